//! # edgequake-doctrans
//!
//! OCR scanned PDFs with a vision LLM, then translate and polish the text.
//!
//! ## Why this crate?
//!
//! Scanned books and reports have no text layer, and classic OCR engines
//! lose headings, tables and formulae. This crate rasterises each page, lets
//! a vision model read it, and then feeds the recovered text through a
//! translation model chunk by chunk. Every remote call is slow and
//! unreliable, so the core of the crate is a bounded, order-preserving,
//! retrying fan-out: units finish in any order, results land in their input
//! position, and a unit that keeps failing becomes a visible sentinel line
//! instead of aborting the document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Render     pdfium rasterisation, margin crop, page stitching
//!  ├─ 2. Upload     object store put + size check (or inline data: URLs)
//!  ├─ 3. OCR        vision model, two retry layers, sentinel on failure
//!  └─ 4. Output     one line block per image, in document order
//!
//! Text
//!  │
//!  ├─ 1. Segment    cut along numbered headings, 8 000–12 000 chars
//!  ├─ 2. Translate  chunk-wise, bounded workers
//!  ├─ 3. Polish     second model sees original + translation
//!  └─ 4. Output     one block per chunk, in document order
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_doctrans::{run_ocr, run_translation, ChatEndpoint, OcrConfig, TranslationConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // DOCTRANS_BASE_URL / DOCTRANS_API_KEY
//!     let endpoint = ChatEndpoint::from_env()?;
//!
//!     let ocr = OcrConfig::builder()
//!         .endpoint(endpoint.clone())
//!         .model("qwen-vl-max")
//!         .keywords(["thermodynamics"])
//!         .build()?;
//!     let scanned = run_ocr(Path::new("book.pdf"), Some(Path::new("book.txt")), ocr, None).await?;
//!     eprintln!("OCR: {}/{} images", scanned.ocr.succeeded, scanned.ocr.total);
//!
//!     let translation = TranslationConfig::builder()
//!         .endpoint(endpoint)
//!         .model("qwen-max")
//!         .polishing_model("qwen-max")
//!         .build()?;
//!     let out = run_translation(
//!         Path::new("book.txt"),
//!         Some(Path::new("book.zh.txt")),
//!         translation,
//!         None,
//!     )
//!     .await?;
//!     eprintln!("{} chunks translated", out.translate.succeeded);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doctrans` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-doctrans = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod segment;
pub mod translate;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use chat::{ChatClient, CompletionBackend, CompletionRequest, Retrying};
pub use config::{
    ChatEndpoint, ModelSettings, OcrConfig, OcrConfigBuilder, RenderConfig, StorageConfig,
    TranslationConfig, TranslationConfigBuilder,
};
pub use dispatch::{dispatch, dispatch_observed, ResultSlots, UnitFailure};
pub use error::{DocTransError, RemoteError, UnitError};
pub use ocr::{run_ocr, OcrItem, OcrPipeline};
pub use output::{OcrOutput, StageStats, TranslationOutput, UnitResult};
pub use progress::{NoopProgressCallback, ProgressCallback, Stage, StageProgressCallback};
pub use retry::RetryPolicy;
pub use segment::{reassemble, segment, Chunk, HeadingMode};
pub use translate::{run_translation, TranslationPipeline};
pub use upload::{BlobStore, IntegrityCheckedUploader, ObjectStoreBlobStore, UploadReport};
