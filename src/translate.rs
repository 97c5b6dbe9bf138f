//! Translation pipeline: text → chunks → translate → polish → text file.
//!
//! The document is cut along its numbered headings ([`crate::segment`]),
//! each chunk is translated independently with at most `max_workers`
//! requests in flight, and the translations are optionally polished by a
//! second model that sees both the original and the translation.
//!
//! Failure handling differs per stage:
//!
//! * **Segmentation** errors are fatal and nothing is dispatched.
//! * A chunk whose **translation** exhausts its retries gets the sentinel
//!   `Translation failed for chunk {n}: {cause}` and is not polished.
//! * A chunk whose **polishing** fails keeps its unpolished translation and
//!   is flagged with [`UnitError::PolishingFailed`].

use crate::chat::{ChatClient, CompletionBackend, CompletionRequest, Retrying};
use crate::config::TranslationConfig;
use crate::dispatch::{dispatch_observed, UnitFailure};
use crate::error::{DocTransError, UnitError};
use crate::output::{StageStats, TranslationOutput, UnitResult};
use crate::pipeline::input;
use crate::progress::{self, ProgressCallback, Stage};
use crate::prompts;
use crate::segment::{segment, Chunk};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// The translation orchestrator.
pub struct TranslationPipeline<B> {
    translator: Arc<Retrying<B>>,
    polisher: Option<Arc<Retrying<B>>>,
    config: TranslationConfig,
    progress: ProgressCallback,
}

impl TranslationPipeline<ChatClient> {
    /// One HTTP connection pool shared by the translation and polishing
    /// clients.
    pub fn new(config: TranslationConfig) -> Result<Self, DocTransError> {
        let translator = ChatClient::new(config.endpoint.clone(), config.translation.clone())?;
        let polisher = match &config.polishing {
            Some(settings) => Some(translator.with_settings(settings.clone())?),
            None => None,
        };
        Ok(Self::with_backends(config, translator, polisher))
    }
}

impl<B: CompletionBackend + 'static> TranslationPipeline<B> {
    /// Any backends. Polishing runs only when `polisher` is given.
    pub fn with_backends(config: TranslationConfig, translator: B, polisher: Option<B>) -> Self {
        let retry = config.retry;
        Self {
            translator: Arc::new(Retrying::new(translator, retry)),
            polisher: polisher.map(|p| Arc::new(Retrying::new(p, retry))),
            config,
            progress: progress::noop(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    /// Translate the text file at `input_path`.
    pub async fn run(
        &self,
        input_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<TranslationOutput, DocTransError> {
        let text = input::read_text(input_path).await?;
        let mut output = self.translate_text(&text).await?;
        if let Some(path) = output_path {
            input::write_atomic(path, output.text().as_bytes()).await?;
            info!("Translation: wrote {}", path.display());
            output.output_path = Some(path.to_path_buf());
        }
        Ok(output)
    }

    /// Segment, translate and (optionally) polish `text`.
    pub async fn translate_text(&self, text: &str) -> Result<TranslationOutput, DocTransError> {
        let c = &self.config;
        let chunks = segment(text, c.min_length, c.max_length, c.heading_mode)?;
        info!(
            "Translation: {} chars → {} chunks",
            text.chars().count(),
            chunks.len()
        );

        let (translated, translate) = self.translate_chunks(&chunks).await;
        let (units, polish) = match &self.polisher {
            Some(polisher) => {
                let (units, stats) = self.polish_chunks(polisher, &chunks, translated).await;
                (units, Some(stats))
            }
            None => (translated, None),
        };

        Ok(TranslationOutput {
            chunks: chunks.len(),
            translate,
            polish,
            units,
            output_path: None,
        })
    }

    /// Translate every chunk, results in ordinal order.
    pub async fn translate_chunks(&self, chunks: &[Chunk]) -> (Vec<UnitResult>, StageStats) {
        let started = Instant::now();
        let total = chunks.len();
        let progress = &self.progress;
        progress.on_stage_start(Stage::Translate, total);

        let translator = Arc::clone(&self.translator);
        let prompt: Arc<str> = self.config.effective_translation_prompt().into();

        let outcomes = dispatch_observed(
            chunks.to_vec(),
            self.config.max_workers,
            move |_, chunk: Chunk| {
                let translator = Arc::clone(&translator);
                let prompt = Arc::clone(&prompt);
                async move {
                    let request =
                        CompletionRequest::text(prompts::translation_request(&prompt, &chunk.text));
                    translator.complete(&request).await.map_err(|e| {
                        let failure = UnitError::TranslationFailed {
                            ordinal: chunk.ordinal,
                            detail: e.last_cause().to_string(),
                        };
                        warn!("{}", failure);
                        failure
                    })
                }
            },
            |index, outcome| match outcome {
                Ok(text) => {
                    progress.on_unit_complete(Stage::Translate, index, total, text.chars().count())
                }
                Err(e) => progress.on_unit_error(Stage::Translate, index, total, &e.to_string()),
            },
        )
        .await;

        let units: Vec<UnitResult> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| UnitResult::from_outcome(index, outcome))
            .collect();
        let stats = StageStats::from_units(Stage::Translate, &units, started);
        progress.on_stage_complete(Stage::Translate, total, stats.succeeded);
        info!(
            "Translation: {}/{} chunks succeeded in {} ms",
            stats.succeeded, stats.total, stats.duration_ms
        );
        (units, stats)
    }

    /// Polish every successfully translated chunk.
    ///
    /// Failed translations pass through untouched; a failed polish keeps the
    /// translation and flags the unit.
    async fn polish_chunks(
        &self,
        polisher: &Arc<Retrying<B>>,
        chunks: &[Chunk],
        translated: Vec<UnitResult>,
    ) -> (Vec<UnitResult>, StageStats) {
        let started = Instant::now();
        let eligible: Vec<(Chunk, String)> = chunks
            .iter()
            .zip(&translated)
            .filter(|(_, t)| t.is_ok())
            .map(|(c, t)| (c.clone(), t.text.clone()))
            .collect();
        let total = eligible.len();
        let chunk_count = chunks.len();
        let progress = &self.progress;
        progress.on_stage_start(Stage::Polish, total);

        let polisher = Arc::clone(polisher);
        let prompt: Arc<str> = self.config.effective_polishing_prompt().into();

        let mut ordinals = Vec::with_capacity(total);
        let mut fallbacks = Vec::with_capacity(total);
        for (chunk, translation) in &eligible {
            ordinals.push(chunk.ordinal);
            fallbacks.push(translation.clone());
        }

        let outcomes = dispatch_observed(
            eligible,
            self.config.max_workers,
            move |_, (chunk, translation): (Chunk, String)| {
                let polisher = Arc::clone(&polisher);
                let prompt = Arc::clone(&prompt);
                async move {
                    let request = CompletionRequest::text(prompts::polishing_request(
                        &prompt,
                        &chunk.text,
                        &translation,
                    ));
                    polisher.complete(&request).await.map_err(|e| {
                        let failure = UnitError::PolishingFailed {
                            ordinal: chunk.ordinal,
                            detail: e.last_cause().to_string(),
                        };
                        warn!("{}; keeping unpolished translation", failure);
                        failure
                    })
                }
            },
            // Report document positions, not positions among the eligible chunks.
            |index, outcome| {
                let ordinal = ordinals[index];
                match outcome {
                    Ok(text) => progress.on_unit_complete(
                        Stage::Polish,
                        ordinal,
                        chunk_count,
                        text.chars().count(),
                    ),
                    Err(e) => {
                        progress.on_unit_error(Stage::Polish, ordinal, chunk_count, &e.to_string())
                    }
                }
            },
        )
        .await;

        let mut units = translated;
        let mut succeeded = 0;
        for ((outcome, ordinal), fallback) in outcomes.into_iter().zip(ordinals).zip(fallbacks) {
            units[ordinal] = match outcome {
                Ok(text) => {
                    succeeded += 1;
                    UnitResult::ok(ordinal, text)
                }
                Err(UnitFailure::Failed(e)) => UnitResult::degraded(ordinal, fallback, e),
                Err(other) => UnitResult::degraded(
                    ordinal,
                    fallback,
                    UnitError::PolishingFailed {
                        ordinal,
                        detail: other.to_string(),
                    },
                ),
            };
        }

        progress.on_stage_complete(Stage::Polish, total, succeeded);
        let stats = StageStats::new(Stage::Polish, total, succeeded, started);
        info!(
            "Polishing: {}/{} chunks succeeded in {} ms",
            stats.succeeded, stats.total, stats.duration_ms
        );
        (units, stats)
    }
}

/// Convenience wrapper: build a [`TranslationPipeline`] and run it.
pub async fn run_translation(
    input_path: &Path,
    output_path: Option<&Path>,
    config: TranslationConfig,
    progress: Option<ProgressCallback>,
) -> Result<TranslationOutput, DocTransError> {
    let mut pipeline = TranslationPipeline::new(config)?;
    if let Some(cb) = progress {
        pipeline = pipeline.with_progress(cb);
    }
    pipeline.run(input_path, output_path).await
}
