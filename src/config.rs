//! Configuration types for the OCR and translation pipelines.
//!
//! Nothing here is global. Each orchestrator receives one [`OcrConfig`] or
//! [`TranslationConfig`], built through its builder, and creates its
//! clients from it. `build()` validates every knob so that a missing
//! credential or an impossible bound is reported before any remote work is
//! dispatched.
//!
//! Defaults match the deployment the pipeline was tuned on: a single upload
//! worker (object stores rate-limit aggressively), two OCR workers, four
//! translation workers, and chunks of 8 000–12 000 characters.

use crate::error::DocTransError;
use crate::retry::RetryPolicy;
use crate::segment::HeadingMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the chat-completion URL.
pub const ENV_BASE_URL: &str = "DOCTRANS_BASE_URL";
/// Environment variable holding the bearer credential.
pub const ENV_API_KEY: &str = "DOCTRANS_API_KEY";

// ── Chat endpoint ────────────────────────────────────────────────────────

/// Where chat-completion requests go and how they authenticate.
///
/// `base_url` is the full `/chat/completions` URL, not a prefix.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChatEndpoint {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Per-request timeout in seconds. Default: 120.
    pub request_timeout_secs: u64,
}

impl Default for ChatEndpoint {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            request_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for ChatEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl ChatEndpoint {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Read [`ENV_BASE_URL`] and [`ENV_API_KEY`] from the process environment.
    pub fn from_env() -> Result<Self, DocTransError> {
        let base_url = std::env::var(ENV_BASE_URL).map_err(|_| {
            DocTransError::Configuration(format!("{ENV_BASE_URL} is not set"))
        })?;
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| DocTransError::Configuration(format!("{ENV_API_KEY} is not set")))?;
        let endpoint = Self::new(base_url, api_key);
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<(), DocTransError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(DocTransError::Configuration(
                "chat endpoint URL is empty".into(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DocTransError::Configuration(format!(
                "chat endpoint URL must be http(s), got '{url}'"
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(DocTransError::Configuration("API key is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(DocTransError::Configuration(
                "request timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(())
    }
}

// ── Model settings ───────────────────────────────────────────────────────

/// Model identifier and sampling parameters for one kind of request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
}

impl ModelSettings {
    /// Greedy decoding: `temperature = 0.0`, `top_p = 1.0`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.0,
            top_p: 1.0,
        }
    }

    /// OCR defaults: transcription must be deterministic.
    pub fn for_ocr(model: impl Into<String>) -> Self {
        Self::new(model)
    }

    /// Translation and polishing defaults: `temperature = 0.7`.
    pub fn for_translation(model: impl Into<String>) -> Self {
        Self::new(model).temperature(0.7)
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), DocTransError> {
        if self.model.trim().is_empty() {
            return Err(DocTransError::Configuration("model name is empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(DocTransError::Configuration(format!(
                "temperature must be 0–2, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(DocTransError::Configuration(format!(
                "top_p must be 0–1, got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// S3-compatible bucket that rasterised pages are uploaded to.
///
/// Credentials are not stored here; they come from the standard
/// `AWS_*` environment variables read by `object_store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    /// Custom S3 endpoint (MinIO, OSS, R2 …). `None` uses AWS.
    pub endpoint: Option<String>,
    /// Public URL prefix; the download URL is `{download_base_url}/{object}`.
    pub download_base_url: String,
    /// Optional second-level folder prepended to every object name.
    pub folder: Option<String>,
    /// Retry budget for one put-then-verify sequence. Default: 8 × 2 s.
    pub upload_retry: RetryPolicy,
    /// Concurrent uploads. Default: 1.
    pub max_workers: usize,
    /// Address objects as `https://{bucket}.{host}/{object}` instead of
    /// `https://{host}/{bucket}/{object}`. Aliyun OSS accepts only this
    /// form; `endpoint` must then already include the bucket. Default: false.
    #[serde(default)]
    pub virtual_hosted_style: bool,
}

impl StorageConfig {
    pub fn new(bucket: impl Into<String>, download_base_url: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            download_base_url: download_base_url.into(),
            folder: None,
            upload_retry: RetryPolicy::new(8, Duration::from_secs(2)),
            max_workers: 1,
            virtual_hosted_style: false,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn upload_retry(mut self, policy: RetryPolicy) -> Self {
        self.upload_retry = policy;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn virtual_hosted_style(mut self, v: bool) -> Self {
        self.virtual_hosted_style = v;
        self
    }

    pub fn validate(&self) -> Result<(), DocTransError> {
        if self.bucket.trim().is_empty() {
            return Err(DocTransError::Configuration("bucket name is empty".into()));
        }
        if self.download_base_url.trim().is_empty() {
            return Err(DocTransError::Configuration(
                "download base URL is empty".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(DocTransError::Configuration(
                "upload workers must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

/// How PDF pages become images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Cap on the rendered page's longer side in pixels. Default: 2000.
    pub max_rendered_pixels: u32,
    /// Consecutive pages stitched into one long image. Default: 2.
    pub pages_per_image: usize,
    /// Pixels cut from the top of each page (running headers).
    pub top_margin: Option<u32>,
    /// Pixels cut from the bottom of each page (folios, footnote rules).
    pub bottom_margin: Option<u32>,
    /// Trim blank rows when neither margin is given. Default: true.
    pub trim_blank_rows: bool,
    pub password: Option<String>,
    /// Save a PNG copy of every image here.
    pub image_dir: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            pages_per_image: 2,
            top_margin: None,
            bottom_margin: None,
            trim_blank_rows: true,
            password: None,
            image_dir: None,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), DocTransError> {
        if self.max_rendered_pixels < 100 {
            return Err(DocTransError::Configuration(format!(
                "max rendered pixels must be ≥ 100, got {}",
                self.max_rendered_pixels
            )));
        }
        if self.pages_per_image == 0 {
            return Err(DocTransError::Configuration(
                "pages per image must be ≥ 1".into(),
            ));
        }
        Ok(())
    }

    /// Explicit margins were given for at least one edge.
    pub fn has_margins(&self) -> bool {
        self.top_margin.is_some() || self.bottom_margin.is_some()
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────

/// Everything the OCR orchestrator needs.
///
/// Built via [`OcrConfig::builder()`].
///
/// # Example
/// ```rust
/// use edgequake_doctrans::{ChatEndpoint, OcrConfig};
///
/// let config = OcrConfig::builder()
///     .endpoint(ChatEndpoint::new("https://llm.example/v1/chat/completions", "sk-test"))
///     .model("vision-model")
///     .keywords(["computer", "C++", "program"])
///     .max_workers(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.outer_retry.max_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub endpoint: ChatEndpoint,
    pub model: ModelSettings,
    /// Transport-level retry around each request. Default: 5 × 2 s.
    pub call_retry: RetryPolicy,
    /// Retry around the whole retried request; exhausting it yields the
    /// sentinel text. Default: 5 × 3 s.
    pub outer_retry: RetryPolicy,
    /// Concurrent OCR requests. Default: 2.
    pub max_workers: usize,
    /// Field of the document, embedded in the default prompt.
    pub keywords: Vec<String>,
    /// Replaces the default prompt entirely.
    pub prompt: Option<String>,
    pub render: RenderConfig,
    /// `None` sends images inline as `data:` URLs.
    pub storage: Option<StorageConfig>,
    /// Strip fences and invisible characters from OCR text. Default: true.
    pub clean_output: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: ChatEndpoint::default(),
            model: ModelSettings::for_ocr(""),
            call_retry: RetryPolicy::new(5, Duration::from_secs(2)),
            outer_retry: RetryPolicy::new(5, Duration::from_secs(3)),
            max_workers: 2,
            keywords: Vec::new(),
            prompt: None,
            render: RenderConfig::default(),
            storage: None,
            clean_output: true,
        }
    }
}

impl OcrConfig {
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }

    /// The prompt sent with every page.
    pub fn effective_prompt(&self) -> String {
        match &self.prompt {
            Some(p) => p.clone(),
            None => crate::prompts::ocr_prompt(&self.keywords),
        }
    }
}

/// Builder for [`OcrConfig`].
#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn endpoint(mut self, endpoint: ChatEndpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// Sets the model name, keeping the current sampling parameters.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model.model = model.into();
        self
    }

    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.config.model = settings;
        self
    }

    pub fn call_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.call_retry = policy;
        self
    }

    pub fn outer_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.outer_retry = policy;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn render(mut self, render: RenderConfig) -> Self {
        self.config.render = render;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = Some(storage);
        self
    }

    pub fn clean_output(mut self, v: bool) -> Self {
        self.config.clean_output = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, DocTransError> {
        let c = &self.config;
        c.endpoint.validate()?;
        c.model.validate()?;
        c.render.validate()?;
        if let Some(storage) = &c.storage {
            storage.validate()?;
        }
        if c.max_workers == 0 {
            return Err(DocTransError::Configuration(
                "OCR workers must be ≥ 1".into(),
            ));
        }
        if let Some(p) = &c.prompt {
            if p.trim().is_empty() {
                return Err(DocTransError::Configuration("OCR prompt is empty".into()));
            }
        }
        Ok(self.config)
    }
}

// ── Translation ──────────────────────────────────────────────────────────

/// Everything the translation orchestrator needs.
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub endpoint: ChatEndpoint,
    pub translation: ModelSettings,
    /// `None` skips the polishing stage.
    pub polishing: Option<ModelSettings>,
    /// Retry around each translation or polishing request. Default: 8 × 2 s.
    pub retry: RetryPolicy,
    /// Concurrent requests per stage. Default: 4.
    pub max_workers: usize,
    pub min_length: usize,
    pub max_length: usize,
    pub heading_mode: HeadingMode,
    /// Language named in the default prompts. Default: "Chinese".
    pub target_language: String,
    pub translation_prompt: Option<String>,
    pub polishing_prompt: Option<String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: ChatEndpoint::default(),
            translation: ModelSettings::for_translation(""),
            polishing: None,
            retry: RetryPolicy::new(8, Duration::from_secs(2)),
            max_workers: 4,
            min_length: 8000,
            max_length: 12000,
            heading_mode: HeadingMode::Numbered,
            target_language: "Chinese".to_string(),
            translation_prompt: None,
            polishing_prompt: None,
        }
    }
}

impl TranslationConfig {
    pub fn builder() -> TranslationConfigBuilder {
        TranslationConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn effective_translation_prompt(&self) -> String {
        self.translation_prompt
            .clone()
            .unwrap_or_else(|| crate::prompts::translation_prompt(&self.target_language))
    }

    pub fn effective_polishing_prompt(&self) -> String {
        self.polishing_prompt
            .clone()
            .unwrap_or_else(|| crate::prompts::polishing_prompt(&self.target_language))
    }
}

/// Builder for [`TranslationConfig`].
#[derive(Debug)]
pub struct TranslationConfigBuilder {
    config: TranslationConfig,
}

impl TranslationConfigBuilder {
    pub fn endpoint(mut self, endpoint: ChatEndpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.translation.model = model.into();
        self
    }

    pub fn translation_settings(mut self, settings: ModelSettings) -> Self {
        self.config.translation = settings;
        self
    }

    /// Enables polishing with the given model and translation sampling.
    pub fn polishing_model(mut self, model: impl Into<String>) -> Self {
        self.config.polishing = Some(ModelSettings::for_translation(model));
        self
    }

    pub fn polishing_settings(mut self, settings: Option<ModelSettings>) -> Self {
        self.config.polishing = settings;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn lengths(mut self, min_length: usize, max_length: usize) -> Self {
        self.config.min_length = min_length;
        self.config.max_length = max_length;
        self
    }

    pub fn heading_mode(mut self, mode: HeadingMode) -> Self {
        self.config.heading_mode = mode;
        self
    }

    pub fn target_language(mut self, language: impl Into<String>) -> Self {
        self.config.target_language = language.into();
        self
    }

    pub fn translation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.translation_prompt = Some(prompt.into());
        self
    }

    pub fn polishing_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.polishing_prompt = Some(prompt.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TranslationConfig, DocTransError> {
        let c = &self.config;
        c.endpoint.validate()?;
        c.translation.validate()?;
        if let Some(p) = &c.polishing {
            p.validate()?;
        }
        if c.max_workers == 0 {
            return Err(DocTransError::Configuration(
                "translation workers must be ≥ 1".into(),
            ));
        }
        if c.max_length == 0 {
            return Err(DocTransError::Configuration(
                "max_length must be ≥ 1".into(),
            ));
        }
        if c.min_length > c.max_length {
            return Err(DocTransError::Configuration(format!(
                "min_length {} exceeds max_length {}",
                c.min_length, c.max_length
            )));
        }
        if c.target_language.trim().is_empty() {
            return Err(DocTransError::Configuration(
                "target language is empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ChatEndpoint {
        ChatEndpoint::new("https://llm.example/v1/chat/completions", "sk-secret")
    }

    #[test]
    fn debug_never_prints_api_key() {
        let dbg = format!("{:?}", endpoint());
        assert!(!dbg.contains("sk-secret"), "got: {dbg}");
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn endpoint_validation() {
        assert!(endpoint().validate().is_ok());
        assert!(ChatEndpoint::new("", "k").validate().is_err());
        assert!(ChatEndpoint::new("ftp://host", "k").validate().is_err());
        assert!(ChatEndpoint::new("https://host", "  ").validate().is_err());
        assert!(endpoint().request_timeout_secs(0).validate().is_err());
    }

    #[test]
    fn ocr_defaults() {
        let c = OcrConfig::builder()
            .endpoint(endpoint())
            .model("vision")
            .build()
            .unwrap();
        assert_eq!(c.max_workers, 2);
        assert_eq!(c.call_retry, RetryPolicy::new(5, Duration::from_secs(2)));
        assert_eq!(c.outer_retry, RetryPolicy::new(5, Duration::from_secs(3)));
        assert_eq!(c.model.temperature, 0.0);
        assert_eq!(c.model.top_p, 1.0);
        assert_eq!(c.render.pages_per_image, 2);
        assert!(c.clean_output);
        assert!(c.storage.is_none());
    }

    #[test]
    fn ocr_missing_model_fails_fast() {
        let err = OcrConfig::builder().endpoint(endpoint()).build().unwrap_err();
        assert!(matches!(err, DocTransError::Configuration(_)));
    }

    #[test]
    fn ocr_missing_endpoint_fails_fast() {
        let err = OcrConfig::builder().model("vision").build().unwrap_err();
        assert!(matches!(err, DocTransError::Configuration(_)));
    }

    #[test]
    fn ocr_zero_workers_rejected() {
        let err = OcrConfig::builder()
            .endpoint(endpoint())
            .model("vision")
            .max_workers(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn ocr_validates_storage() {
        let err = OcrConfig::builder()
            .endpoint(endpoint())
            .model("vision")
            .storage(StorageConfig::new("", "https://cdn.example.com"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn storage_defaults_follow_rate_limited_provider() {
        let s = StorageConfig::new("bucket", "https://cdn.example.com");
        assert_eq!(s.max_workers, 1);
        assert_eq!(s.upload_retry.max_attempts, 8);
        assert_eq!(s.upload_retry.delay, Duration::from_secs(2));
    }

    #[test]
    fn translation_defaults() {
        let c = TranslationConfig::builder()
            .endpoint(endpoint())
            .model("translator")
            .build()
            .unwrap();
        assert_eq!(c.max_workers, 4);
        assert_eq!((c.min_length, c.max_length), (8000, 12000));
        assert_eq!(c.heading_mode, HeadingMode::Numbered);
        assert_eq!(c.retry.max_attempts, 8);
        assert_eq!(c.translation.temperature, 0.7);
        assert!(c.polishing.is_none());
    }

    #[test]
    fn translation_inverted_lengths_rejected() {
        let err = TranslationConfig::builder()
            .endpoint(endpoint())
            .model("translator")
            .lengths(500, 100)
            .build()
            .unwrap_err();
        assert!(matches!(err, DocTransError::Configuration(_)));
    }

    #[test]
    fn polishing_model_enables_polish_stage() {
        let c = TranslationConfig::builder()
            .endpoint(endpoint())
            .model("translator")
            .polishing_model("polisher")
            .build()
            .unwrap();
        let p = c.polishing.unwrap();
        assert_eq!(p.model, "polisher");
        assert_eq!(p.temperature, 0.7);
    }

    #[test]
    fn sampling_parameters_are_clamped() {
        let m = ModelSettings::new("m").temperature(5.0).top_p(-1.0);
        assert_eq!(m.temperature, 2.0);
        assert_eq!(m.top_p, 0.0);
    }

    #[test]
    fn custom_prompt_overrides_keywords() {
        let c = OcrConfig::builder()
            .endpoint(endpoint())
            .model("vision")
            .keywords(["law"])
            .prompt("Transcribe.")
            .build()
            .unwrap();
        assert_eq!(c.effective_prompt(), "Transcribe.");
    }
}
