//! Result types returned by the orchestrators.
//!
//! Every type here is `Serialize` so the CLI can print it with `--json`.

use crate::dispatch::{UnitFailure, UnitOutcome};
use crate::error::UnitError;
use crate::progress::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// Final text of one unit, in input position `index`.
///
/// When `error` is set, `text` is the sentinel (OCR, translation) or the
/// fallback kept in its place (unpolished translation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub index: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
}

impl UnitResult {
    pub fn ok(index: usize, text: String) -> Self {
        Self {
            index,
            text,
            error: None,
        }
    }

    /// A failed unit whose text is the error's sentinel rendering.
    pub fn sentinel(error: UnitError) -> Self {
        Self {
            index: error.index(),
            text: error.to_string(),
            error: Some(error),
        }
    }

    /// A failed unit that keeps a usable fallback text.
    pub fn degraded(index: usize, text: String, error: UnitError) -> Self {
        Self {
            index,
            text,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Slot contents of a text-producing stage → result with sentinel.
    pub(crate) fn from_outcome(index: usize, outcome: UnitOutcome<String, UnitError>) -> Self {
        match outcome {
            Ok(text) => Self::ok(index, text),
            Err(UnitFailure::Failed(e)) => Self::sentinel(e),
            Err(other) => Self::sentinel(UnitError::WorkerPanicked {
                index,
                detail: other.to_string(),
            }),
        }
    }
}

/// Counts and wall time of one dispatch stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: Stage,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl StageStats {
    pub fn new(stage: Stage, total: usize, succeeded: usize, started: Instant) -> Self {
        Self {
            stage,
            total,
            succeeded,
            failed: total.saturating_sub(succeeded),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn from_units(stage: Stage, units: &[UnitResult], started: Instant) -> Self {
        let succeeded = units.iter().filter(|u| u.is_ok()).count();
        Self::new(stage, units.len(), succeeded, started)
    }
}

/// Join unit texts in order, each followed by a newline.
pub fn render_units(units: &[UnitResult]) -> String {
    let mut out = String::with_capacity(units.iter().map(|u| u.text.len() + 1).sum());
    for unit in units {
        out.push_str(&unit.text);
        out.push('\n');
    }
    out
}

/// Result of [`crate::ocr::run_ocr`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutput {
    /// Images produced by rasterisation (after stitching).
    pub images: usize,
    /// `None` when images were sent inline.
    pub upload: Option<StageStats>,
    /// Images that never reached OCR because their upload failed.
    pub upload_failures: Vec<UnitError>,
    /// Counts only the images that reached OCR.
    pub ocr: StageStats,
    /// One entry per image, in document order. A failed upload holds its
    /// `Upload failed for …` sentinel.
    pub units: Vec<UnitResult>,
    pub output_path: Option<PathBuf>,
}

impl OcrOutput {
    pub fn text(&self) -> String {
        render_units(&self.units)
    }
}

/// Result of [`crate::translate::run_translation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationOutput {
    pub chunks: usize,
    pub translate: StageStats,
    /// `None` when polishing was disabled.
    pub polish: Option<StageStats>,
    /// One entry per chunk, in document order.
    pub units: Vec<UnitResult>,
    pub output_path: Option<PathBuf>,
}

impl TranslationOutput {
    pub fn text(&self) -> String {
        render_units(&self.units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_text_is_error_display() {
        let u = UnitResult::sentinel(UnitError::TranslationFailed {
            ordinal: 2,
            detail: "HTTP 500: oops".into(),
        });
        assert_eq!(u.index, 2);
        assert_eq!(u.text, "Translation failed for chunk 2: HTTP 500: oops");
        assert!(!u.is_ok());
    }

    #[test]
    fn render_appends_newline_per_unit() {
        let units = vec![
            UnitResult::ok(0, "first".into()),
            UnitResult::ok(1, String::new()),
            UnitResult::ok(2, "third\n".into()),
        ];
        assert_eq!(render_units(&units), "first\n\nthird\n\n");
    }

    #[test]
    fn stats_count_failures() {
        let units = vec![
            UnitResult::ok(0, "a".into()),
            UnitResult::sentinel(UnitError::OcrFailed {
                index: 1,
                image: "u".into(),
                detail: "d".into(),
            }),
        ];
        let s = StageStats::from_units(Stage::Ocr, &units, Instant::now());
        assert_eq!((s.total, s.succeeded, s.failed), (2, 1, 1));
    }

    #[test]
    fn ok_units_omit_error_in_json() {
        let json = serde_json::to_value(UnitResult::ok(0, "x".into())).unwrap();
        assert!(json.get("error").is_none());
    }
}
