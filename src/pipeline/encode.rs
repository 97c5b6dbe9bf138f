//! Image encoding: `DynamicImage` → PNG bytes, and PNG → `data:` URL.
//!
//! PNG is lossless; text crispness matters far more than file size for OCR
//! accuracy. The same bytes are uploaded to object storage or, when no
//! storage is configured, inlined into the request as a base64 data URL.

use crate::error::DocTransError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

pub fn encode_png(img: &DynamicImage, name: &str) -> Result<Vec<u8>, DocTransError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| DocTransError::ImageEncodingFailed {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
    debug!("Encoded {} → {} bytes PNG", name, buf.len());
    Ok(buf)
}

/// `data:image/png;base64,…` for use in an `image_url` content part.
pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}
