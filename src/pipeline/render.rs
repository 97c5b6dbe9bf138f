//! PDF rasterisation, margin cropping and page stitching.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to call from async contexts. Rendering runs on the
//! blocking pool so Tokio workers keep driving network I/O meanwhile.
//!
//! ## Cropping
//!
//! Running headers and folios confuse OCR and break the heading structure
//! the segmenter relies on. Pages are cropped either by explicit pixel
//! margins or, when none are configured, by trimming rows whose grey-level
//! variance is below a tenth of the page's mean row variance.
//!
//! ## Stitching
//!
//! Consecutive pages are stacked into one tall image so a paragraph broken
//! across a page boundary reaches the model in a single request.

use crate::config::RenderConfig;
use crate::error::DocTransError;
use image::{DynamicImage, Rgb, RgbImage};
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Rows kept above and below detected content.
pub const TRIM_SAFETY_MARGIN: u32 = 10;

/// One image sent to OCR: a page or a run of stitched pages.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    /// 1-based, inclusive.
    pub first_page: usize,
    /// 1-based, inclusive.
    pub last_page: usize,
    pub image: DynamicImage,
}

impl RenderedImage {
    /// `pages_{first}-{last}`.
    pub fn label(&self) -> String {
        format!("pages_{}-{}", self.first_page, self.last_page)
    }

    /// `{stem}_pages_{first}-{last}.png`.
    pub fn file_name(&self, stem: &str) -> String {
        format!("{}_{}.png", stem, self.label())
    }
}

/// Render every page of `pdf_path`, crop it and stitch runs of
/// `pages_per_image` pages, in document order.
pub async fn rasterize(
    pdf_path: &Path,
    config: &RenderConfig,
) -> Result<Vec<RenderedImage>, DocTransError> {
    let path = pdf_path.to_path_buf();
    let config = config.clone();

    tokio::task::spawn_blocking(move || {
        let pages = render_pages_blocking(&path, &config)?;
        let cropped = pages
            .into_iter()
            .map(|page| crop_page(page, &config))
            .collect();
        Ok(group_pages(cropped, config.pages_per_image))
    })
    .await
    .map_err(|e| DocTransError::Internal(format!("Render task panicked: {}", e)))?
}

fn render_pages_blocking(
    pdf_path: &Path,
    config: &RenderConfig,
) -> Result<Vec<DynamicImage>, DocTransError> {
    let pdfium = Pdfium::default();
    let password = config.password.as_deref();

    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                DocTransError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                DocTransError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            DocTransError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .set_target_width(config.max_rendered_pixels as i32)
        .set_maximum_height(config.max_rendered_pixels as i32);

    let mut images = Vec::with_capacity(total_pages);
    for idx in 0..total_pages {
        let page = pages
            .get(idx as u16)
            .map_err(|e| DocTransError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            DocTransError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}

/// Apply the configured cropping to one rendered page.
pub fn crop_page(page: DynamicImage, config: &RenderConfig) -> DynamicImage {
    if config.has_margins() {
        crop_margins(
            &page,
            config.top_margin.unwrap_or(0),
            config.bottom_margin.unwrap_or(0),
        )
    } else if config.trim_blank_rows {
        trim_blank_rows(&page, TRIM_SAFETY_MARGIN)
    } else {
        page
    }
}

/// Cut `top` rows off the top and `bottom` rows off the bottom.
///
/// Margins that would remove the whole page leave it untouched.
pub fn crop_margins(img: &DynamicImage, top: u32, bottom: u32) -> DynamicImage {
    let height = img.height();
    match height.checked_sub(top.saturating_add(bottom)) {
        Some(kept) if kept > 0 => img.crop_imm(0, top, img.width(), kept),
        _ => img.clone(),
    }
}

/// Drop blank bands above the first and below the last content row.
///
/// A row is content when its grey-level variance exceeds a tenth of the
/// mean row variance. `margin` rows of padding are kept on both sides.
pub fn trim_blank_rows(img: &DynamicImage, margin: u32) -> DynamicImage {
    let variances = row_variances(img);
    if variances.is_empty() {
        return img.clone();
    }
    let mean = variances.iter().sum::<f64>() / variances.len() as f64;
    let threshold = mean / 10.0;

    let first = variances.iter().position(|&v| v > threshold);
    let last = variances.iter().rposition(|&v| v > threshold);
    match (first, last) {
        (Some(first), Some(last)) => {
            let top = (first as u32).saturating_sub(margin);
            let bottom = (last as u32).saturating_add(margin).min(img.height());
            if bottom <= top {
                return img.clone();
            }
            img.crop_imm(0, top, img.width(), bottom - top)
        }
        _ => img.clone(),
    }
}

/// Population variance of the luma values of each row.
fn row_variances(img: &DynamicImage) -> Vec<f64> {
    let gray = img.to_luma8();
    let width = gray.width() as f64;
    if width == 0.0 {
        return Vec::new();
    }
    gray.rows()
        .map(|row| {
            let (sum, sum_sq) = row.fold((0.0f64, 0.0f64), |(s, sq), p| {
                let v = p.0[0] as f64;
                (s + v, sq + v * v)
            });
            let mean = sum / width;
            (sum_sq / width - mean * mean).max(0.0)
        })
        .collect()
}

/// Stack images vertically on a white canvas as wide as the widest one.
pub fn stitch(pages: &[DynamicImage]) -> DynamicImage {
    let width = pages.iter().map(|p| p.width()).max().unwrap_or(0);
    let height = pages.iter().map(|p| p.height()).sum();
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));

    let mut y = 0i64;
    for page in pages {
        image::imageops::replace(&mut canvas, &page.to_rgb8(), 0, y);
        y += page.height() as i64;
    }
    DynamicImage::ImageRgb8(canvas)
}

/// Group pages into runs of `per_image`, stitching runs longer than one.
pub fn group_pages(pages: Vec<DynamicImage>, per_image: usize) -> Vec<RenderedImage> {
    let per_image = per_image.max(1);
    pages
        .chunks(per_image)
        .enumerate()
        .map(|(i, run)| {
            let first_page = i * per_image + 1;
            let image = if run.len() == 1 {
                run[0].clone()
            } else {
                stitch(run)
            };
            RenderedImage {
                first_page,
                last_page: first_page + run.len() - 1,
                image,
            }
        })
        .collect()
}
