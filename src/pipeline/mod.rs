//! Local stages of the OCR pipeline.
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ (upload / OCR) ──▶ cleanup
//! (path)    (pdfium)   (PNG)                          (text)
//! ```
//!
//! 1. [`input`]  — validate the PDF, read text inputs, write outputs atomically
//! 2. [`render`] — rasterise, crop and stitch pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`] — PNG bytes for upload, or a base64 data URL for inline use
//! 4. [`cleanup`] — strip fences and invisible characters from OCR text
//!
//! The remote stages live in [`crate::upload`] and [`crate::ocr`].

pub mod cleanup;
pub mod encode;
pub mod input;
pub mod render;
