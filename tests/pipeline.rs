//! Integration tests for edgequake-doctrans.
//!
//! The orchestrators are driven with scripted `CompletionBackend` and
//! `BlobStore` implementations, and `ChatClient` is exercised against a
//! one-shot HTTP stub on localhost, so nothing here needs network access
//! or pdfium.
//!
//! `live_translation_roundtrip` talks to a real endpoint and is gated behind
//! `E2E_ENABLED`:
//!   E2E_ENABLED=1 DOCTRANS_BASE_URL=… DOCTRANS_API_KEY=… DOCTRANS_MODEL=… \
//!     cargo test --test pipeline live_ -- --nocapture

use edgequake_doctrans::pipeline::render::RenderedImage;
use edgequake_doctrans::{
    BlobStore, ChatClient, ChatEndpoint, CompletionBackend, CompletionRequest,
    IntegrityCheckedUploader, ModelSettings, NoopProgressCallback, OcrConfig, OcrPipeline,
    RemoteError, RetryPolicy, Stage, StageProgressCallback, StorageConfig, TranslationConfig,
    TranslationPipeline, UnitError,
};
use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// In-memory bucket. Objects whose name contains one of `refuse` are never
/// stored.
#[derive(Default)]
struct FlakyStore {
    objects: Mutex<HashMap<String, u64>>,
    refuse: HashSet<String>,
    puts: AtomicU32,
}

impl FlakyStore {
    fn refusing(names: &[&str]) -> Self {
        Self {
            refuse: names.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl BlobStore for FlakyStore {
    async fn put(
        &self,
        object: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.iter().any(|r| object.contains(r.as_str())) {
            return Err(RemoteError::Status {
                status: 403,
                body: "AccessDenied".into(),
            });
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object.to_string(), bytes.len() as u64);
        Ok(())
    }

    async fn head_size(&self, object: &str) -> Result<u64, RemoteError> {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .copied()
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                body: "NoSuchKey".into(),
            })
    }
}

/// Vision backend: answers with a fenced transcription of the image URL,
/// fails for URLs containing `broken`. Later images answer sooner so
/// completion order is the reverse of input order.
struct ScriptedVision {
    broken: &'static str,
}

impl ScriptedVision {
    fn failing_on(broken: &'static str) -> Self {
        Self { broken }
    }
}

impl CompletionBackend for ScriptedVision {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
        let url = request.image_url.clone().unwrap_or_default();
        if url.contains(self.broken) {
            return Err(RemoteError::Transport("connection reset".into()));
        }
        let page: u64 = url
            .rsplit("pages_")
            .next()
            .and_then(|s| s.split('-').next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(page * 10))).await;
        Ok(format!(
            "```markdown\n## {page} Scanned page\u{200B}\n```"
        ))
    }
}

#[derive(Clone, Copy)]
enum Role {
    Translator,
    Polisher,
}

/// Translator upper-cases the chunk and fails on "boom"; polisher prefixes
/// the translation and fails when the original mentions "fragile".
struct ScriptedText {
    role: Role,
}

impl ScriptedText {
    fn new(role: Role) -> Self {
        Self { role }
    }
}

impl CompletionBackend for ScriptedText {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RemoteError> {
        match self.role {
            Role::Translator => {
                let chunk = request.prompt.strip_prefix("T:\n").unwrap_or_default();
                if chunk.contains("boom") {
                    return Err(RemoteError::Transport("connection reset".into()));
                }
                // Shorter chunks finish later.
                let wait = 30u64.saturating_sub(chunk.len() as u64);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                Ok(chunk.trim_end().to_uppercase())
            }
            Role::Polisher => {
                let (original, translation) = request
                    .prompt
                    .split_once("\nTranslation:\n")
                    .ok_or_else(|| RemoteError::MalformedResponse("no translation".into()))?;
                if original.contains("fragile") {
                    return Err(RemoteError::Status {
                        status: 500,
                        body: "overloaded".into(),
                    });
                }
                Ok(format!("polished: {translation}"))
            }
        }
    }
}

#[derive(Default)]
struct CountingProgress {
    started: Mutex<Vec<(Stage, usize)>>,
    completed: AtomicUsize,
    errors: AtomicUsize,
}

impl StageProgressCallback for CountingProgress {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        self.started.lock().unwrap().push((stage, total));
    }
    fn on_unit_complete(&self, _stage: Stage, _index: usize, _total: usize, _len: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_unit_error(&self, _stage: Stage, _index: usize, _total: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn endpoint() -> ChatEndpoint {
    ChatEndpoint::new("https://llm.example.com/v1/chat/completions", "sk-test")
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::from_millis(1))
}

fn storage() -> StorageConfig {
    StorageConfig::new("scans", "https://cdn.example.com/")
        .folder("pdf_ocr")
        .upload_retry(RetryPolicy::new(3, Duration::from_secs(2)))
        .max_workers(2)
}

fn pages(n: usize) -> Vec<RenderedImage> {
    (1..=n)
        .map(|p| RenderedImage {
            first_page: p,
            last_page: p,
            image: DynamicImage::new_rgb8(8, 4 + p as u32),
        })
        .collect()
}

// ── Upload ───────────────────────────────────────────────────────────────────

/// Log sink shared between the subscriber and the test body.
#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn five_uploads_two_permanent_failures_yield_three_urls() {
    let log = CapturedLog::default();
    let sink = log.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let uploader =
        IntegrityCheckedUploader::new(FlakyStore::refusing(&["image_1", "image_3"]), &storage());
    let pngs: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 16 + i]).collect();

    let report = uploader.upload_images(pngs, &NoopProgressCallback).await;

    assert_eq!(
        report.urls(),
        vec![
            "https://cdn.example.com/pdf_ocr/image_0.png",
            "https://cdn.example.com/pdf_ocr/image_2.png",
            "https://cdn.example.com/pdf_ocr/image_4.png",
        ]
    );
    let failed: Vec<usize> = report.failures().iter().map(|e| e.index()).collect();
    assert_eq!(failed, vec![1, 3]);
    assert_eq!(report.submitted(), 5);
    assert_eq!((report.stats.succeeded, report.stats.failed), (3, 2));
    // 3 good puts + 2 × 3 attempts for the refused ones.
    assert_eq!(uploader.store().puts.load(Ordering::SeqCst), 9);
    assert!(log.contents().contains("Only 3 out of 5 uploads succeeded"));
}

// ── OCR ──────────────────────────────────────────────────────────────────────

fn ocr_config() -> OcrConfig {
    OcrConfig::builder()
        .endpoint(endpoint())
        .model("vision")
        .call_retry(fast_retry(2))
        .outer_retry(fast_retry(2))
        .max_workers(2)
        .prompt("Transcribe.")
        .build()
        .unwrap()
}

#[tokio::test]
async fn ocr_keeps_document_order_and_marks_failed_image() {
    let pipeline = OcrPipeline::with_backend(ocr_config(), ScriptedVision::failing_on("pages_2-2"))
        .with_uploader(IntegrityCheckedUploader::new(FlakyStore::default(), &storage()));

    let out = pipeline.process_images("book", pages(4)).await.unwrap();

    assert_eq!(out.images, 4);
    assert_eq!(out.upload.as_ref().map(|s| s.succeeded), Some(4));
    assert!(out.upload_failures.is_empty());
    assert_eq!(
        out.text(),
        "## 1 Scanned page\n\
         OCR failed for https://cdn.example.com/pdf_ocr/book_pages_2-2.png: transport error: connection reset\n\
         ## 3 Scanned page\n\
         ## 4 Scanned page\n"
    );
    assert!(matches!(
        out.units[1].error,
        Some(UnitError::OcrFailed { index: 1, .. })
    ));
    assert_eq!((out.ocr.total, out.ocr.succeeded, out.ocr.failed), (4, 3, 1));
}

#[tokio::test]
async fn ocr_marks_images_whose_upload_failed_in_place() {
    let progress = Arc::new(CountingProgress::default());
    let pipeline = OcrPipeline::with_backend(ocr_config(), ScriptedVision::failing_on("never"))
        .with_uploader(IntegrityCheckedUploader::new(
            FlakyStore::refusing(&["pages_2-2"]),
            &StorageConfig::new("scans", "https://cdn.example.com")
                .upload_retry(fast_retry(2)),
        ))
        .with_progress(progress.clone());

    let out = pipeline.process_images("book", pages(3)).await.unwrap();

    assert_eq!(out.upload_failures.len(), 1);
    assert!(out.upload_failures[0].to_string().contains("book_pages_2-2.png"));
    assert_eq!(out.units.len(), 3);
    let text = out.text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "## 1 Scanned page");
    assert!(lines[1].starts_with("Upload failed for book_pages_2-2.png:"));
    assert_eq!(lines[2], "## 3 Scanned page");
    assert!(matches!(
        out.units[1].error,
        Some(UnitError::UploadFailed { index: 1, .. })
    ));
    assert_eq!((out.ocr.total, out.ocr.succeeded), (2, 2));
    assert_eq!(
        *progress.started.lock().unwrap(),
        vec![(Stage::Upload, 3), (Stage::Ocr, 2)]
    );
    assert_eq!(progress.errors.load(Ordering::SeqCst), 1);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn ocr_without_storage_sends_inline_images_and_saves_copies() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ocr_config();
    config.render.image_dir = Some(dir.path().to_path_buf());

    // Any remote URL would fail, so success proves the images went inline.
    let pipeline = OcrPipeline::with_backend(config, ScriptedVision::failing_on("https://"));
    let out = pipeline.process_images("scan", pages(2)).await.unwrap();

    assert!(out.upload.is_none());
    assert_eq!(out.ocr.succeeded, 2);
    assert!(dir.path().join("scan_pages_1-1.png").exists());
    assert!(dir.path().join("scan_pages_2-2.png").exists());
}

#[tokio::test]
async fn raw_ocr_output_is_not_cleaned() {
    let mut config = ocr_config();
    config.clean_output = false;
    let pipeline = OcrPipeline::with_backend(config, ScriptedVision::failing_on("never"));

    let out = pipeline.process_images("scan", pages(1)).await.unwrap();
    assert!(out.units[0].text.starts_with("```markdown\n"));
}

// ── Translation ──────────────────────────────────────────────────────────────

fn translation_config() -> TranslationConfig {
    TranslationConfig::builder()
        .endpoint(endpoint())
        .model("translator")
        .polishing_model("polisher")
        .lengths(1, 10)
        .max_workers(3)
        .retry(fast_retry(2))
        .translation_prompt("T:")
        .polishing_prompt("P:")
        .build()
        .unwrap()
}

const DOC: &str = "# 1 alpha\n# 2 boom\n# 3 fragile\n# 4 delta\n";

#[tokio::test]
async fn translation_sentinel_and_polish_fallback_keep_positions() {
    let pipeline = TranslationPipeline::with_backends(
        translation_config(),
        ScriptedText::new(Role::Translator),
        Some(ScriptedText::new(Role::Polisher)),
    );

    let out = pipeline.translate_text(DOC).await.unwrap();

    assert_eq!(out.chunks, 4);
    let texts: Vec<&str> = out.units.iter().map(|u| u.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "polished: # 1 ALPHA",
            "Translation failed for chunk 1: transport error: connection reset",
            "# 3 FRAGILE",
            "polished: # 4 DELTA",
        ]
    );
    assert!(matches!(
        out.units[2].error,
        Some(UnitError::PolishingFailed { ordinal: 2, .. })
    ));
    assert_eq!((out.translate.total, out.translate.succeeded), (4, 3));
    let polish = out.polish.unwrap();
    assert_eq!((polish.total, polish.succeeded, polish.failed), (3, 2, 1));
}

#[tokio::test]
async fn translation_run_writes_one_block_per_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.txt");
    let output = dir.path().join("out/book.zh.txt");
    std::fs::write(&input, DOC).unwrap();

    let mut config = translation_config();
    config.polishing = None;
    let pipeline =
        TranslationPipeline::with_backends(config, ScriptedText::new(Role::Translator), None);

    let out = pipeline.run(&input, Some(&output)).await.unwrap();

    assert_eq!(out.output_path.as_deref(), Some(output.as_path()));
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "# 1 ALPHA\n\
         Translation failed for chunk 1: transport error: connection reset\n\
         # 3 FRAGILE\n\
         # 4 DELTA\n"
    );
}

// ── ChatClient over HTTP ─────────────────────────────────────────────────────

struct Captured {
    head: String,
    body: serde_json::Value,
}

/// Accept one connection, capture the request, answer with `status` and
/// `body`.
async fn one_shot_server(
    status: &'static str,
    body: &'static str,
) -> (String, tokio::task::JoinHandle<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/v1/chat/completions", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length: usize = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending body");
            buf.extend_from_slice(&chunk[..n]);
        }

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();

        Captured {
            head,
            body: serde_json::from_slice(&buf[header_end..header_end + content_length]).unwrap(),
        }
    });
    (url, handle)
}

#[tokio::test]
async fn chat_client_sends_bearer_and_multimodal_body() {
    let (url, server) = one_shot_server(
        "200 OK",
        r###"{"choices":[{"message":{"role":"assistant","content":"## 1 Intro"}}]}"###,
    )
    .await;
    let client = ChatClient::new(
        ChatEndpoint::new(url, "sk-local"),
        ModelSettings::for_ocr("qwen-vl-max"),
    )
    .unwrap();

    let text = client
        .complete(&CompletionRequest::with_image(
            "Transcribe.",
            "https://cdn.example.com/a.png",
        ))
        .await
        .unwrap();
    assert_eq!(text, "## 1 Intro");

    let captured = server.await.unwrap();
    let head = captured.head.to_ascii_lowercase();
    assert!(head.starts_with("post /v1/chat/completions http/1.1"));
    assert!(head.contains("authorization: bearer sk-local"));
    assert!(head.contains("content-type: application/json"));

    let body = captured.body;
    assert_eq!(body["model"], "qwen-vl-max");
    assert_eq!(body["stream"], false);
    assert_eq!(body["temperature"], 0.0);
    let parts = &body["messages"][0]["content"];
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(parts[0]["type"], "image_url");
    assert_eq!(parts[0]["image_url"]["url"], "https://cdn.example.com/a.png");
    assert_eq!(parts[1]["type"], "text");
    assert_eq!(parts[1]["text"], "Transcribe.");
}

#[tokio::test]
async fn chat_client_maps_non_2xx_to_status_error() {
    let (url, server) = one_shot_server(
        "429 Too Many Requests",
        r#"{"error":{"message":"rate limited"}}"#,
    )
    .await;
    let client = ChatClient::new(
        ChatEndpoint::new(url, "sk-local"),
        ModelSettings::for_translation("qwen-max"),
    )
    .unwrap();

    let err = client
        .complete(&CompletionRequest::text("hello"))
        .await
        .unwrap_err();
    match err {
        RemoteError::Status { status, body } => {
            assert_eq!(status, 429);
            assert!(body.contains("rate limited"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    let captured = server.await.unwrap();
    assert_eq!(captured.body["messages"][0]["content"], "hello");
}

#[tokio::test]
async fn chat_client_rejects_response_without_choices() {
    let (url, _server) = one_shot_server("200 OK", r#"{"choices":[]}"#).await;
    let client = ChatClient::new(
        ChatEndpoint::new(url, "sk-local"),
        ModelSettings::new("m"),
    )
    .unwrap();
    assert!(matches!(
        client.complete(&CompletionRequest::text("x")).await,
        Err(RemoteError::MalformedResponse(_))
    ));
}

// ── Live endpoint ────────────────────────────────────────────────────────────

#[tokio::test]
async fn live_translation_roundtrip() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP — set E2E_ENABLED=1 and DOCTRANS_* to run");
        return;
    }
    let endpoint = ChatEndpoint::from_env().expect("DOCTRANS_BASE_URL / DOCTRANS_API_KEY");
    let model = std::env::var("DOCTRANS_MODEL").expect("DOCTRANS_MODEL");
    let config = TranslationConfig::builder()
        .endpoint(endpoint)
        .model(model)
        .lengths(10, 200)
        .build()
        .unwrap();

    let pipeline = TranslationPipeline::new(config).unwrap();
    let out = pipeline
        .translate_text("# 1 Introduction\nEntropy never decreases in an isolated system.\n")
        .await
        .unwrap();

    println!("{}", out.text());
    assert_eq!(out.translate.succeeded, 1);
    assert!(!out.units[0].text.trim().is_empty());
}
