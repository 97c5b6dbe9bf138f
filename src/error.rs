//! Error types for the edgequake-doctrans library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`DocTransError`] — **Fatal**: the pipeline cannot start or cannot
//!   finish its local work (bad input file, missing credential, invalid
//!   segmentation bounds, output not writable). Returned as `Err` from the
//!   orchestrators, always before any remote work is dispatched when the
//!   cause is configuration.
//!
//! * [`RemoteError`] — **Retryable**: one remote call (chat completion,
//!   object upload) failed. The retry layer in [`crate::retry`] consumes
//!   these and only surfaces [`RemoteError::ExhaustedRetries`] once the
//!   attempt budget is spent.
//!
//! * [`UnitError`] — **Non-fatal**: a single unit of work (one image, one
//!   chunk) failed terminally. Stored in [`crate::output::UnitResult`] so a
//!   few bad pages never cost the whole document.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-doctrans library.
#[derive(Debug, Error)]
pub enum DocTransError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// Text input could not be read (missing, unreadable, or not UTF-8).
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A rasterised image could not be PNG-encoded.
    #[error("Image encoding failed for '{name}': {detail}")]
    ImageEncodingFailed { name: String, detail: String },

    // ── Configuration errors ──────────────────────────────────────────────
    /// Missing credential, model, or endpoint; or an out-of-range knob.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Segmentation bounds cannot describe any chunk.
    #[error("Invalid segmentation bounds: min_length {min} > max_length {max}")]
    InvalidSegmentBounds { min: usize, max: usize },

    /// The object-store client could not be constructed.
    #[error("Object storage setup failed: {0}")]
    StorageSetup(String),

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single remote call.
///
/// Every variant except [`RemoteError::ExhaustedRetries`] is retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network-level failure: connect, TLS, timeout, broken body.
    #[error("transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The object store reports a different size than was uploaded.
    #[error("size mismatch for '{object}': local {local} bytes, remote {remote} bytes")]
    SizeMismatch {
        object: String,
        local: u64,
        remote: u64,
    },

    /// All attempts failed; `last` is the cause of the final attempt.
    #[error("max retries exceeded after {attempts} attempts; last error: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<RemoteError>,
    },
}

impl RemoteError {
    /// The innermost non-exhaustion cause.
    ///
    /// The OCR stage nests one retry layer inside another, so a terminal
    /// OCR failure is `ExhaustedRetries(ExhaustedRetries(cause))`.
    pub fn last_cause(&self) -> &RemoteError {
        match self {
            RemoteError::ExhaustedRetries { last, .. } => last.last_cause(),
            other => other,
        }
    }

    /// Map a reqwest failure onto the transport variant.
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Transport(format!("request timed out: {e}"))
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

/// A non-fatal error for a single unit of work.
///
/// The `Display` output of the OCR and translation variants is the sentinel
/// text substituted into the output at the failed position.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitError {
    /// Upload failed after all retries.
    #[error("Upload failed for {object}: {detail}")]
    UploadFailed {
        index: usize,
        object: String,
        detail: String,
    },

    /// OCR failed after both retry layers were exhausted.
    #[error("OCR failed for {image}: {detail}")]
    OcrFailed {
        index: usize,
        image: String,
        detail: String,
    },

    /// Translation failed after all retries.
    #[error("Translation failed for chunk {ordinal}: {detail}")]
    TranslationFailed { ordinal: usize, detail: String },

    /// Polishing failed; the unpolished translation was kept.
    #[error("Polishing failed for chunk {ordinal}: {detail}")]
    PolishingFailed { ordinal: usize, detail: String },

    /// The worker task panicked before producing a result.
    #[error("Worker for unit {index} panicked: {detail}")]
    WorkerPanicked { index: usize, detail: String },
}

impl UnitError {
    /// Position of the failed unit in its stage's input order.
    pub fn index(&self) -> usize {
        match self {
            UnitError::UploadFailed { index, .. }
            | UnitError::OcrFailed { index, .. }
            | UnitError::WorkerPanicked { index, .. } => *index,
            UnitError::TranslationFailed { ordinal, .. }
            | UnitError::PolishingFailed { ordinal, .. } => *ordinal,
        }
    }
}
