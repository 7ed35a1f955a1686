//! Vision-model OCR: send an image region to an LLM provider, read back text.
//!
//! All prompt text lives in [`crate::prompts`]; this module owns provider
//! resolution, the retry loop, and confidence scoring.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors are frequent when many pages OCR at once.
//! Exponential backoff (`retry_backoff_ms * 2^(attempt-1)`) spreads the
//! retries out: with 500 ms base and 3 retries the waits are 500 ms → 1 s → 2 s.
//! A single wait never exceeds [`MAX_BACKOFF_MS`], however many retries are
//! configured.
//! The OCR stage's per-call timeout wraps the whole loop, so a slow provider
//! cannot stall a page for longer than the configured budget.
//!
//! ## Confidence
//!
//! Vision models do not report per-character confidence. The score is a
//! heuristic over the reply: longer and more structured transcriptions
//! score higher, `[?]` markers for illegible words score lower, and an
//! empty reply scores zero.

use crate::error::{ExtractError, OcrFailure};
use crate::fragment::ImageRegion;
use crate::pipeline::encode::png_image_data;
use crate::pipeline::ocr::{OcrEngine, OcrOutput};
use crate::prompts::{region_instruction, DEFAULT_OCR_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_OCR_MODEL: &str = "gpt-4.1-nano";

/// Marker the prompt asks the model to emit for illegible words.
const ILLEGIBLE_MARKER: &str = "[?]";

/// [`OcrEngine`] backed by an `edgequake-llm` vision provider.
#[derive(Clone)]
pub struct VisionOcrEngine {
    provider: Arc<dyn LLMProvider>,
    label: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl fmt::Debug for VisionOcrEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionOcrEngine")
            .field("provider", &"<dyn LLMProvider>")
            .field("label", &self.label)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl VisionOcrEngine {
    /// Wrap a pre-built provider.
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            label: "vision".to_string(),
            system_prompt: DEFAULT_OCR_PROMPT.to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    /// Create a named provider (e.g. `"openai"`) with the given model. The
    /// provider reads its API key from the environment.
    pub fn from_provider_name(provider_name: &str, model: &str) -> Result<Self, ExtractError> {
        let provider = create_vision_provider(provider_name, model)?;
        Ok(Self::new(provider).with_label(format!("{provider_name}/{model}")))
    }

    /// Resolve a provider from the environment, most specific first:
    ///
    /// 1. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set
    /// 2. `OPENAI_API_KEY` → `openai` with `model` (or [`DEFAULT_OCR_MODEL`])
    /// 3. [`ProviderFactory::from_env`] auto-detection
    pub fn from_env(model: Option<&str>) -> Result<Self, ExtractError> {
        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return Self::from_provider_name(&prov, &env_model);
            }
        }

        if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
            if !openai_key.is_empty() {
                return Self::from_provider_name("openai", model.unwrap_or(DEFAULT_OCR_MODEL));
            }
        }

        let (llm_provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| ExtractError::OcrProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No vision provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --ocr-provider.\n\
                    Error: {}",
                    e
                ),
            })?;
        Ok(Self::new(llm_provider).with_label("auto"))
    }

    /// Override the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Name shown in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n.max(1);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OcrEngine for VisionOcrEngine {
    fn name(&self) -> &str {
        &self.label
    }

    async fn recognize(&self, region: &ImageRegion) -> Result<OcrOutput, OcrFailure> {
        let Some(png) = region.png.as_deref() else {
            return Err(OcrFailure::Unavailable {
                detail: format!("region {} has no decoded pixels", region.name),
            });
        };

        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user_with_images(
                region_instruction(&region.name, region.pixel_width, region.pixel_height),
                vec![png_image_data(png)],
            ),
        ];
        let options = self.options();

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_ms(self.retry_backoff_ms, attempt);
                warn!(
                    "OCR {}: retry {}/{} after {}ms",
                    region.name, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "OCR {} via {}: {} input tokens, {} output tokens, {:?}",
                        region.name,
                        self.label,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    let confidence = heuristic_confidence(&response.content);
                    return Ok(OcrOutput::new(response.content, confidence));
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    warn!("OCR {}: attempt {} failed: {}", region.name, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(OcrFailure::Engine {
            detail: format!(
                "{} after {} retries",
                last_err.unwrap_or_else(|| "Unknown error".to_string()),
                self.max_retries
            ),
        })
    }
}

/// Upper bound on a single retry wait.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Wait before retry `attempt` (1-based): `base * 2^(attempt-1)`, saturating
/// and capped at [`MAX_BACKOFF_MS`].
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::OcrProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Score a vision-model transcription.
///
/// | Reply length (chars) | Base |
/// |----------------------|------|
/// | 0 | 0.0 |
/// | 1–19 | 0.5 |
/// | 20–199 | 0.7 |
/// | 200+ | 0.8 |
///
/// Table rows (`|` separated) and list markers add 0.05 each. Every `[?]`
/// subtracts its share of the words, so a reply that is mostly markers
/// lands near zero. Capped at 0.95.
pub fn heuristic_confidence(text: &str) -> f32 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }

    let len = text.chars().count();
    let base: f32 = if len < 20 {
        0.5
    } else if len < 200 {
        0.7
    } else {
        0.8
    };

    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);
    let has_lists = text
        .lines()
        .any(|l| l.trim_start().starts_with("- ") || l.trim_start().starts_with("* "));
    let bonus: f32 = if has_tables { 0.05 } else { 0.0 } + if has_lists { 0.05 } else { 0.0 };

    let words = text.split_whitespace().count().max(1) as f32;
    let illegible = text.matches(ILLEGIBLE_MARKER).count() as f32;
    let legible_share = (1.0 - illegible / words).clamp(0.0, 1.0);

    ((base + bonus) * legible_share).clamp(0.0, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reply_scores_zero() {
        assert_eq!(heuristic_confidence(""), 0.0);
        assert_eq!(heuristic_confidence("  \n "), 0.0);
    }

    #[test]
    fn short_chart_labels_clear_default_floor() {
        let c = heuristic_confidence("Revenue\nQ1 Q2 Q3");
        assert!(c >= 0.5, "got {c}");
    }

    #[test]
    fn table_structure_adds_bonus() {
        let plain = heuristic_confidence("Region North South East West totals for the year");
        let table = heuristic_confidence("Region | North | South\n2024 | 10 | 20\n");
        assert!(table > plain, "{table} vs {plain}");
    }

    #[test]
    fn illegible_markers_lower_confidence() {
        let clean = heuristic_confidence("Total sales by region");
        let murky = heuristic_confidence("Total [?] by [?]");
        assert!(murky < clean);
        assert!(heuristic_confidence("[?] [?] [?]") < 0.05);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 2), 1000);
        assert_eq!(backoff_ms(500, 3), 2000);
    }

    #[test]
    fn backoff_saturates_for_large_retry_counts() {
        assert_eq!(backoff_ms(500, 65), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(500, u32::MAX), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(0, 100), 0);
    }

    #[test]
    fn confidence_is_capped() {
        let long = "- item | a | b\n".repeat(50);
        assert!(heuristic_confidence(&long) <= 0.95);
    }
}
