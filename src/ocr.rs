//! OCR pipeline: PDF → page images → (upload) → vision model → text file.
//!
//! ```text
//! PDF ─▶ rasterize ─▶ PNG ─┬─ upload (max_workers = storage.max_workers) ─┬─▶ URLs
//!                          └─ inline data: URLs (no storage) ─────────────┘
//!                                                                         │
//!   output file ◀── "\n"-joined ◀── cleanup ◀── OCR (max_workers = 2) ◀───┘
//! ```
//!
//! Every OCR request is retried twice over: the backend retries transport
//! failures (`call_retry`), and the whole retried call is retried again
//! (`outer_retry`). When both budgets are spent the image's slot receives
//! the sentinel `OCR failed for {image}: {cause}` and the document carries
//! on. Images whose upload failed never reach OCR; they are listed in
//! [`OcrOutput::upload_failures`] and their slot receives the sentinel
//! `Upload failed for {object}: {cause}`.

use crate::chat::{ChatClient, CompletionBackend, CompletionRequest, Retrying};
use crate::config::OcrConfig;
use crate::dispatch::dispatch_observed;
use crate::error::{DocTransError, UnitError};
use crate::output::{OcrOutput, StageStats, UnitResult};
use crate::pipeline::{cleanup, encode, input, render};
use crate::progress::{self, ProgressCallback, Stage};
use crate::retry::RetryPolicy;
use crate::upload::{BlobStore, IntegrityCheckedUploader, ObjectStoreBlobStore, UploadItem};
use render::RenderedImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// An image ready for OCR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrItem {
    /// Identifier used in logs and in the sentinel text.
    pub name: String,
    /// Remote URL or `data:` URL.
    pub url: String,
}

impl OcrItem {
    /// An uploaded image is identified by its URL.
    pub fn remote(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: url.clone(),
            url,
        }
    }

    pub fn inline(name: impl Into<String>, png: &[u8]) -> Self {
        Self {
            name: name.into(),
            url: encode::png_data_url(png),
        }
    }
}

/// OCR one image with the outer retry layer around the retrying backend.
///
/// Never fails: exhaustion of both layers yields the sentinel error.
pub async fn ocr_image<B: CompletionBackend>(
    backend: &Retrying<B>,
    outer: RetryPolicy,
    prompt: &str,
    index: usize,
    item: &OcrItem,
) -> Result<String, UnitError> {
    let request = CompletionRequest::with_image(prompt, item.url.as_str());
    let request = &request;
    outer
        .run(&item.name, move |_| backend.complete(request))
        .await
        .map_err(|e| {
            let failure = UnitError::OcrFailed {
                index,
                image: item.name.clone(),
                detail: e.last_cause().to_string(),
            };
            warn!("{}", failure);
            failure
        })
}

/// The OCR orchestrator.
///
/// Holds everything one run needs; build it once with [`OcrPipeline::new`]
/// and call [`OcrPipeline::run`] per document.
pub struct OcrPipeline<B, S = ObjectStoreBlobStore> {
    backend: Arc<Retrying<B>>,
    uploader: Option<IntegrityCheckedUploader<S>>,
    config: OcrConfig,
    progress: ProgressCallback,
}

impl OcrPipeline<ChatClient, ObjectStoreBlobStore> {
    /// HTTP chat client plus, when storage is configured, an S3 uploader.
    pub fn new(config: OcrConfig) -> Result<Self, DocTransError> {
        let client = ChatClient::new(config.endpoint.clone(), config.model.clone())?;
        let uploader = match &config.storage {
            Some(storage) => Some(IntegrityCheckedUploader::new(
                ObjectStoreBlobStore::s3(storage)?,
                storage,
            )),
            None => None,
        };
        let mut pipeline = Self::with_backend(config, client);
        pipeline.uploader = uploader;
        Ok(pipeline)
    }
}

impl<B: CompletionBackend + 'static> OcrPipeline<B, ObjectStoreBlobStore> {
    /// Any backend, images sent inline.
    pub fn with_backend(config: OcrConfig, backend: B) -> Self {
        let call_retry = config.call_retry;
        Self {
            backend: Arc::new(Retrying::new(backend, call_retry)),
            uploader: None,
            config,
            progress: progress::noop(),
        }
    }
}

impl<B: CompletionBackend + 'static, S: BlobStore> OcrPipeline<B, S> {
    /// Upload images through `uploader` instead of sending them inline.
    pub fn with_uploader<S2: BlobStore>(
        self,
        uploader: IntegrityCheckedUploader<S2>,
    ) -> OcrPipeline<B, S2> {
        OcrPipeline {
            backend: self.backend,
            uploader: Some(uploader),
            config: self.config,
            progress: self.progress,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// OCR `pdf_path` and, if `output_path` is given, write the text there.
    pub async fn run(
        &self,
        pdf_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<OcrOutput, DocTransError> {
        let pdf = input::validate_pdf(pdf_path)?;
        info!("OCR: rasterising {}", pdf.display());
        let images = render::rasterize(&pdf, &self.config.render).await?;

        let mut output = self.process_images(&input::stem(&pdf), images).await?;
        if let Some(path) = output_path {
            input::write_atomic(path, output.text().as_bytes()).await?;
            info!("OCR: wrote {}", path.display());
            output.output_path = Some(path.to_path_buf());
        }
        Ok(output)
    }

    /// Encode, optionally save, upload or inline, then OCR `images`.
    pub async fn process_images(
        &self,
        stem: &str,
        images: Vec<RenderedImage>,
    ) -> Result<OcrOutput, DocTransError> {
        let image_count = images.len();
        let named = encode_all(stem, images).await?;

        if let Some(dir) = &self.config.render.image_dir {
            for (name, png) in &named {
                input::write_atomic(&dir.join(name), png).await?;
            }
            debug!("Saved {} images to {}", named.len(), dir.display());
        }

        let (units, ocr, upload, upload_failures) = match &self.uploader {
            Some(uploader) => {
                let uploads = named
                    .into_iter()
                    .map(|(name, png)| UploadItem::png(name, png))
                    .collect();
                let report = uploader.upload_all(uploads, self.progress.as_ref()).await;
                let items = report.urls().into_iter().map(OcrItem::remote).collect();
                let (recognized, ocr) = self.recognize(items).await;
                let units = merge_upload_failures(&report.results, recognized);
                (units, ocr, Some(report.stats.clone()), report.failures())
            }
            None => {
                let items = named
                    .iter()
                    .map(|(name, png)| OcrItem::inline(name.as_str(), png))
                    .collect();
                let (units, ocr) = self.recognize(items).await;
                (units, ocr, None, Vec::new())
            }
        };

        Ok(OcrOutput {
            images: image_count,
            upload,
            upload_failures,
            ocr,
            units,
            output_path: None,
        })
    }

    /// OCR every item with at most `max_workers` in flight, in input order.
    pub async fn recognize(&self, items: Vec<OcrItem>) -> (Vec<UnitResult>, StageStats) {
        let started = Instant::now();
        let total = items.len();
        let progress = &self.progress;
        progress.on_stage_start(Stage::Ocr, total);
        info!("OCR: {} images, {} workers", total, self.config.max_workers);

        let backend = Arc::clone(&self.backend);
        let prompt: Arc<str> = self.config.effective_prompt().into();
        let outer = self.config.outer_retry;
        let clean = self.config.clean_output;

        let outcomes = dispatch_observed(
            items,
            self.config.max_workers,
            move |index, item: OcrItem| {
                let backend = Arc::clone(&backend);
                let prompt = Arc::clone(&prompt);
                async move {
                    let text = ocr_image(&backend, outer, &prompt, index, &item).await?;
                    Ok::<_, UnitError>(if clean {
                        cleanup::clean_ocr_text(&text)
                    } else {
                        text
                    })
                }
            },
            |index, outcome| match outcome {
                Ok(text) => progress.on_unit_complete(Stage::Ocr, index, total, text.chars().count()),
                Err(e) => progress.on_unit_error(Stage::Ocr, index, total, &e.to_string()),
            },
        )
        .await;

        let units: Vec<UnitResult> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| UnitResult::from_outcome(index, outcome))
            .collect();
        let stats = StageStats::from_units(Stage::Ocr, &units, started);
        progress.on_stage_complete(Stage::Ocr, total, stats.succeeded);
        info!(
            "OCR: {}/{} images succeeded in {} ms",
            stats.succeeded, stats.total, stats.duration_ms
        );
        (units, stats)
    }
}

/// PNG-encode every image off the async workers, keeping order.
async fn encode_all(
    stem: &str,
    images: Vec<RenderedImage>,
) -> Result<Vec<(String, Vec<u8>)>, DocTransError> {
    let stem = stem.to_string();
    tokio::task::spawn_blocking(move || {
        images
            .iter()
            .map(|img| {
                let name = img.file_name(&stem);
                encode::encode_png(&img.image, &name).map(|png| (name, png))
            })
            .collect()
    })
    .await
    .map_err(|e| DocTransError::Internal(format!("Encode task panicked: {}", e)))?
}

/// Put the OCR units of the uploaded images back into image order, with an
/// upload sentinel wherever the image never reached OCR.
fn merge_upload_failures(
    uploads: &[Result<String, UnitError>],
    recognized: Vec<UnitResult>,
) -> Vec<UnitResult> {
    let mut recognized = recognized.into_iter();
    let mut merged = Vec::with_capacity(uploads.len());
    for (position, upload) in uploads.iter().enumerate() {
        let mut unit = match upload {
            Ok(_) => match recognized.next() {
                Some(unit) => unit,
                None => break,
            },
            Err(e) => UnitResult::sentinel(e.clone()),
        };
        unit.index = position;
        if let Some(
            UnitError::OcrFailed { index, .. }
            | UnitError::UploadFailed { index, .. }
            | UnitError::WorkerPanicked { index, .. },
        ) = unit.error.as_mut()
        {
            *index = position;
        }
        merged.push(unit);
    }
    merged
}

/// Convenience wrapper: build an [`OcrPipeline`] from `config` and run it.
pub async fn run_ocr(
    pdf_path: &Path,
    output_path: Option<&Path>,
    config: OcrConfig,
    progress: Option<ProgressCallback>,
) -> Result<OcrOutput, DocTransError> {
    let mut pipeline = OcrPipeline::new(config)?;
    if let Some(cb) = progress {
        pipeline = pipeline.with_progress(cb);
    }
    pipeline.run(pdf_path, output_path).await
}
