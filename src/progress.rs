//! Progress-callback trait for per-unit pipeline events.
//!
//! Pass an [`Arc<dyn StageProgressCallback>`] to [`crate::ocr::run_ocr`] or
//! [`crate::translate::run_translation`] to observe every stage as its
//! units complete. Events fire from the dispatcher's completion observer,
//! in completion order, not input order.
//!
//! # Example
//!
//! ```rust
//! use edgequake_doctrans::{Stage, StageProgressCallback};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl StageProgressCallback for Counter {
//!     fn on_unit_complete(&self, stage: Stage, index: usize, total: usize, output_len: usize) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: unit {index} done ({done}/{total}, {output_len} chars)");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A dispatch stage of one of the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Ocr,
    Translate,
    Polish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Upload => "upload",
            Stage::Ocr => "ocr",
            Stage::Translate => "translate",
            Stage::Polish => "polish",
        };
        f.write_str(name)
    }
}

/// Called by the orchestrators as each stage processes its units.
///
/// Units of one stage run concurrently, so `on_unit_complete` and
/// `on_unit_error` may be called from different tasks. All methods
/// default to no-ops.
pub trait StageProgressCallback: Send + Sync {
    /// Called once before the stage dispatches its first unit.
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let _ = (stage, total);
    }

    /// A unit finished successfully. `output_len` is in chars.
    fn on_unit_complete(&self, stage: Stage, index: usize, total: usize, output_len: usize) {
        let _ = (stage, index, total, output_len);
    }

    /// A unit failed terminally; its slot holds a sentinel or fallback.
    fn on_unit_error(&self, stage: Stage, index: usize, total: usize, error: &str) {
        let _ = (stage, index, total, error);
    }

    /// Called once after every unit of the stage has been attempted.
    fn on_stage_complete(&self, stage: Stage, total: usize, succeeded: usize) {
        let _ = (stage, total, succeeded);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl StageProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn StageProgressCallback>;

pub(crate) fn noop() -> ProgressCallback {
    Arc::new(NoopProgressCallback)
}
