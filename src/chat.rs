//! Chat-completion calls: wire format, backend trait, HTTP client, retry.
//!
//! Both the OCR and the translation stages talk to an OpenAI-compatible
//! `/chat/completions` endpoint. OCR requests carry a multimodal user
//! message (`image_url` part + `text` part); translation and polishing
//! requests carry a plain text message. Only `choices[0].message.content`
//! is read from the response.
//!
//! The stages depend on the [`CompletionBackend`] trait, not on
//! [`ChatClient`] directly, so tests can drive them with scripted backends
//! and the retry layer can be stacked on any backend through [`Retrying`].

use crate::config::{ChatEndpoint, ModelSettings};
use crate::error::{DocTransError, RemoteError};
use crate::retry::RetryPolicy;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

// ── Wire format ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequestBody<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Either a bare string or an array of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

// ── Requests ─────────────────────────────────────────────────────────────

/// One completion request: a prompt and, for OCR, the image to read.
///
/// `image_url` is either a remote URL returned by the uploader or an
/// inline `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub image_url: Option<String>,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_url: None,
        }
    }

    pub fn with_image(prompt: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_url: Some(image_url.into()),
        }
    }

    /// The single user message for this request.
    ///
    /// With an image, the content is `[image_url, text]` in that order.
    pub fn to_message(&self) -> ChatMessage {
        let content = match &self.image_url {
            None => MessageContent::Text(self.prompt.clone()),
            Some(url) => MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: url.clone() },
                },
                ContentPart::Text {
                    text: self.prompt.clone(),
                },
            ]),
        };
        ChatMessage {
            role: "user".to_string(),
            content,
        }
    }
}

/// Anything that can answer a [`CompletionRequest`] with text.
pub trait CompletionBackend: Send + Sync {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;
}

// ── HTTP client ──────────────────────────────────────────────────────────

/// [`CompletionBackend`] over HTTP with bearer authentication.
///
/// Cheap to clone: the underlying `reqwest::Client` is reference-counted,
/// so the translation and polishing clients can share one connection pool.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: ChatEndpoint,
    settings: ModelSettings,
}

impl ChatClient {
    pub fn new(endpoint: ChatEndpoint, settings: ModelSettings) -> Result<Self, DocTransError> {
        endpoint.validate()?;
        settings.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.request_timeout_secs))
            .build()
            .map_err(|e| DocTransError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            settings,
        })
    }

    /// Same endpoint and connection pool, different model settings.
    pub fn with_settings(&self, settings: ModelSettings) -> Result<Self, DocTransError> {
        settings.validate()?;
        Ok(Self {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            settings,
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    pub(crate) fn request_body<'a>(&'a self, request: &CompletionRequest) -> ChatRequestBody<'a> {
        ChatRequestBody {
            model: &self.settings.model,
            messages: vec![request.to_message()],
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            stream: false,
        }
    }

    async fn send(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
        let body = serde_json::to_vec(&self.request_body(request))
            .map_err(|e| RemoteError::Transport(format!("encoding request: {e}")))?;

        let response = self
            .http
            .post(&self.endpoint.base_url)
            .bearer_auth(&self.endpoint.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(RemoteError::from_reqwest)?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: truncate(&text, 512),
            });
        }

        let content = parse_content(&text)?;
        debug!(
            "{}: {} chars in, {} chars out",
            self.settings.model,
            request.prompt.len(),
            content.len()
        );
        Ok(content)
    }
}

impl CompletionBackend for ChatClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
        self.send(request).await
    }
}

/// Extract `choices[0].message.content` from a response body.
///
/// A `null` content is an empty answer, not a shape error.
pub(crate) fn parse_content(body: &str) -> Result<String, RemoteError> {
    let parsed: ChatResponseBody = serde_json::from_str(body)
        .map_err(|e| RemoteError::MalformedResponse(format!("{e}: {}", truncate(body, 200))))?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| RemoteError::MalformedResponse("response has no choices".into()))
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

// ── Retry decorator ──────────────────────────────────────────────────────

/// A backend whose every call is wrapped in a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retrying<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: CompletionBackend> Retrying<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: CompletionBackend> CompletionBackend for Retrying<B> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
        let label = request
            .image_url
            .as_deref()
            .map(short_label)
            .unwrap_or("chat request");
        self.policy
            .run(label, |_| self.inner.complete(request))
            .await
    }
}

/// Inline `data:` URLs are huge; log only their scheme prefix.
fn short_label(url: &str) -> &str {
    if url.starts_with("data:") {
        "inline image"
    } else {
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn image_request_serialises_image_part_before_text() {
        let msg = CompletionRequest::with_image("read this", "https://cdn/x.png").to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": "https://cdn/x.png"}},
                    {"type": "text", "text": "read this"}
                ]
            })
        );
    }

    #[test]
    fn text_request_serialises_plain_string_content() {
        let msg = CompletionRequest::text("translate me").to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "translate me");
    }

    #[test]
    fn request_body_carries_sampling_settings() {
        let client = ChatClient::new(
            ChatEndpoint::new("https://llm.example/v1/chat/completions", "sk-test"),
            ModelSettings::new("vision-model").temperature(0.0).top_p(1.0),
        )
        .unwrap();
        let body = client.request_body(&CompletionRequest::text("hi"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "vision-model");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["top_p"], 1.0);
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn parse_content_reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}},{"message":{"content":"other"}}]}"#;
        assert_eq!(parse_content(body).unwrap(), "hello");
    }

    #[test]
    fn parse_content_null_is_empty_answer() {
        let body = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert_eq!(parse_content(body).unwrap(), "");
    }

    #[test]
    fn parse_content_rejects_shape_mismatch() {
        assert!(matches!(
            parse_content(r#"{"choices":[]}"#),
            Err(RemoteError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_content(r#"{"error":{"message":"quota"}}"#),
            Err(RemoteError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_content("<html>gateway</html>"),
            Err(RemoteError::MalformedResponse(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("中文测试", 2), "中文…");
        assert_eq!(truncate("short", 10), "short");
    }

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl CompletionBackend for Flaky {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(RemoteError::Status {
                    status: 500,
                    body: String::new(),
                })
            } else {
                Ok(format!("ok: {}", request.prompt))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_backend_recovers_within_budget() {
        let backend = Retrying::new(
            Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
            },
            RetryPolicy::new(3, Duration::from_secs(2)),
        );
        let out = backend.complete(&CompletionRequest::text("p")).await.unwrap();
        assert_eq!(out, "ok: p");
        assert_eq!(backend.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_backend_gives_up_after_budget() {
        let backend = Retrying::new(
            Flaky {
                failures: 10,
                calls: AtomicU32::new(0),
            },
            RetryPolicy::new(2, Duration::from_secs(2)),
        );
        let err = backend
            .complete(&CompletionRequest::with_image("p", "data:image/png;base64,AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ExhaustedRetries { attempts: 2, .. }));
        assert_eq!(backend.inner().calls.load(Ordering::SeqCst), 2);
    }
}
