//! Integrity-checked uploads to object storage.
//!
//! An upload is only successful when the store, asked right after the
//! write, reports the same object size as the bytes we sent. A short write
//! surfaces as [`RemoteError::SizeMismatch`] and goes through the same
//! fixed-delay retry as a network error.
//!
//! [`BlobStore`] is the seam: [`ObjectStoreBlobStore`] talks to any
//! S3-compatible bucket through `object_store`; tests substitute in-memory
//! stores that drop bytes or fail on demand.

use crate::config::StorageConfig;
use crate::dispatch::{dispatch_observed, UnitFailure};
use crate::error::{DocTransError, RemoteError, UnitError};
use crate::output::StageStats;
use crate::progress::{Stage, StageProgressCallback};
use crate::retry::RetryPolicy;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, ClientOptions, ObjectStore, PutOptions, PutPayload,
    RetryConfig,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimal put/head interface over a blob store.
pub trait BlobStore: Send + Sync + 'static {
    fn put(
        &self,
        object: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Size in bytes the store reports for `object`.
    fn head_size(&self, object: &str) -> impl Future<Output = Result<u64, RemoteError>> + Send;
}

// ── object_store backend ─────────────────────────────────────────────────

/// [`BlobStore`] over an `object_store` implementation.
#[derive(Debug, Clone)]
pub struct ObjectStoreBlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// S3-compatible bucket, credentials from `AWS_*` environment variables.
    ///
    /// The client's own retries are disabled: the uploader's policy is the
    /// only retry layer, so attempt counts stay exact.
    pub fn s3(config: &StorageConfig) -> Result<Self, DocTransError> {
        info!("Creating S3 client for bucket: {}", config.bucket);
        let store = s3_builder(config)
            .build()
            .map_err(|e| DocTransError::StorageSetup(e.to_string()))?;
        Ok(Self::new(Arc::new(store)))
    }
}

fn s3_builder(config: &StorageConfig) -> AmazonS3Builder {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_virtual_hosted_style_request(config.virtual_hosted_style)
        .with_client_options(ClientOptions::new().with_timeout(Duration::from_secs(60)))
        .with_retry(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
    if let Some(endpoint) = &config.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }
    builder
}

impl BlobStore for ObjectStoreBlobStore {
    async fn put(
        &self,
        object: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), RemoteError> {
        let mut attributes = Attributes::new();
        if let Some(ct) = content_type {
            attributes.insert(Attribute::ContentType, AttributeValue::from(ct.to_string()));
        }
        let opts = PutOptions {
            attributes,
            ..PutOptions::default()
        };
        self.inner
            .put_opts(
                &ObjectPath::from(object),
                PutPayload::from(bytes.to_vec()),
                opts,
            )
            .await
            .map(|_| ())
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }

    async fn head_size(&self, object: &str) -> Result<u64, RemoteError> {
        let meta = self
            .inner
            .head(&ObjectPath::from(object))
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(meta.size as u64)
    }
}

// ── Uploader ─────────────────────────────────────────────────────────────

/// One blob to upload under a logical name.
#[derive(Debug, Clone)]
pub struct UploadItem {
    /// Name before the folder prefix is applied.
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl UploadItem {
    pub fn png(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            content_type: Some("image/png".to_string()),
        }
    }
}

/// Per-item outcome of a batch upload, in input order.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub results: Vec<Result<String, UnitError>>,
    pub stats: StageStats,
}

impl UploadReport {
    /// URLs of the successful uploads, in input order.
    pub fn urls(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().ok().cloned())
            .collect()
    }

    pub fn failures(&self) -> Vec<UnitError> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().err().cloned())
            .collect()
    }

    pub fn submitted(&self) -> usize {
        self.results.len()
    }
}

/// Put, then head, then compare sizes; retried as one unit.
pub struct IntegrityCheckedUploader<S> {
    store: Arc<S>,
    download_base_url: String,
    folder: Option<String>,
    retry: RetryPolicy,
    max_workers: usize,
}

impl<S> Clone for IntegrityCheckedUploader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            download_base_url: self.download_base_url.clone(),
            folder: self.folder.clone(),
            retry: self.retry,
            max_workers: self.max_workers,
        }
    }
}

impl<S: BlobStore> IntegrityCheckedUploader<S> {
    pub fn new(store: S, config: &StorageConfig) -> Self {
        Self {
            store: Arc::new(store),
            download_base_url: config.download_base_url.trim_end_matches('/').to_string(),
            folder: config
                .folder
                .as_deref()
                .map(|f| f.trim_matches('/').to_string())
                .filter(|f| !f.is_empty()),
            retry: config.upload_retry,
            max_workers: config.max_workers.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// `{folder}/{name}`, or just `name` without a folder.
    pub fn object_name(&self, name: &str) -> String {
        match &self.folder {
            Some(folder) => format!("{folder}/{name}"),
            None => name.to_string(),
        }
    }

    pub fn download_url(&self, object: &str) -> String {
        format!("{}/{}", self.download_base_url, object)
    }

    /// One put-then-verify attempt.
    async fn put_verified(
        &self,
        object: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.store.put(object, bytes, content_type).await?;
        let remote = self.store.head_size(object).await?;
        let local = bytes.len() as u64;
        if remote != local {
            return Err(RemoteError::SizeMismatch {
                object: object.to_string(),
                local,
                remote,
            });
        }
        Ok(())
    }

    /// Upload `bytes` under `name` and return its download URL.
    pub async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<String, RemoteError> {
        let object = self.object_name(name);
        let object_ref = object.as_str();
        self.retry
            .run(object_ref, |_| self.put_verified(object_ref, bytes, content_type))
            .await?;
        debug!("uploaded {} ({} bytes)", object, bytes.len());
        Ok(self.download_url(&object))
    }

    /// Upload every item with at most `max_workers` in flight.
    ///
    /// Never fails as a whole: terminal per-item failures land in their
    /// slot and a warning reports how many uploads were lost.
    pub async fn upload_all(
        &self,
        items: Vec<UploadItem>,
        progress: &dyn StageProgressCallback,
    ) -> UploadReport {
        let started = Instant::now();
        let total = items.len();
        progress.on_stage_start(Stage::Upload, total);

        let this = self.clone();
        let outcomes = dispatch_observed(
            items,
            self.max_workers,
            move |index, item: UploadItem| {
                let this = this.clone();
                async move {
                    this.upload(&item.name, &item.bytes, item.content_type.as_deref())
                        .await
                        .map_err(|e| UnitError::UploadFailed {
                            index,
                            object: this.object_name(&item.name),
                            detail: e.to_string(),
                        })
                }
            },
            |index, outcome| match outcome {
                Ok(_) => progress.on_unit_complete(Stage::Upload, index, total, 0),
                Err(e) => progress.on_unit_error(Stage::Upload, index, total, &e.to_string()),
            },
        )
        .await;

        let results: Vec<Result<String, UnitError>> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.map_err(|failure| match failure {
                    UnitFailure::Failed(e) => e,
                    other => UnitError::WorkerPanicked {
                        index,
                        detail: other.to_string(),
                    },
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        for failure in results.iter().filter_map(|r| r.as_ref().err()) {
            warn!("{}", failure);
        }
        if succeeded < total {
            warn!(
                "Only {} out of {} uploads succeeded",
                succeeded, total
            );
        }
        progress.on_stage_complete(Stage::Upload, total, succeeded);

        UploadReport {
            results,
            stats: StageStats::new(Stage::Upload, total, succeeded, started),
        }
    }

    /// Upload PNG-encoded images as `image_{i}.png`.
    pub async fn upload_images(
        &self,
        pngs: Vec<Vec<u8>>,
        progress: &dyn StageProgressCallback,
    ) -> UploadReport {
        let items = pngs
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| UploadItem::png(format!("image_{i}.png"), bytes))
            .collect();
        self.upload_all(items, progress).await
    }

    /// Upload one local file under its base name.
    pub async fn upload_file(&self, path: &Path) -> Result<String, UnitError> {
        self.upload_file_at(0, path.to_path_buf()).await
    }

    /// Upload local files under their base names, in parallel.
    pub async fn upload_files(
        &self,
        paths: Vec<PathBuf>,
        progress: &dyn StageProgressCallback,
    ) -> UploadReport {
        let started = Instant::now();
        let total = paths.len();
        progress.on_stage_start(Stage::Upload, total);

        let this = self.clone();
        let outcomes = dispatch_observed(
            paths,
            self.max_workers,
            move |index, path: PathBuf| {
                let this = this.clone();
                async move { this.upload_file_at(index, path).await }
            },
            |index, outcome| match outcome {
                Ok(_) => progress.on_unit_complete(Stage::Upload, index, total, 0),
                Err(e) => progress.on_unit_error(Stage::Upload, index, total, &e.to_string()),
            },
        )
        .await;

        let results: Vec<Result<String, UnitError>> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.map_err(|failure| match failure {
                    UnitFailure::Failed(e) => e,
                    other => UnitError::WorkerPanicked {
                        index,
                        detail: other.to_string(),
                    },
                })
            })
            .collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        if succeeded < total {
            warn!("Only {} out of {} files were uploaded successfully", succeeded, total);
        }
        progress.on_stage_complete(Stage::Upload, total, succeeded);

        UploadReport {
            results,
            stats: StageStats::new(Stage::Upload, total, succeeded, started),
        }
    }

    async fn upload_file_at(&self, index: usize, path: PathBuf) -> Result<String, UnitError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(UnitError::UploadFailed {
                index,
                object: path.display().to_string(),
                detail: "path has no file name".into(),
            });
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| UnitError::UploadFailed {
                index,
                object: self.object_name(&name),
                detail: format!("reading {}: {e}", path.display()),
            })?;
        self.upload(&name, &bytes, None)
            .await
            .map_err(|e| UnitError::UploadFailed {
                index,
                object: self.object_name(&name),
                detail: e.to_string(),
            })
    }
}
