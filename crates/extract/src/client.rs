use spendbot_core::{AmountError, ExpenseRecord, ExpenseSchema};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::backend::{BackendError, GenerationRequest, GenerativeBackend};
use crate::media::MediaPart;
use crate::prompt::{Clock, PromptBuilder, SystemClock};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Backend call failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },
    #[error("Failed to extract structured expense data")]
    Malformed { raw: String },
    #[error("Reply amount is unusable: {0}")]
    InvalidAmount(#[from] AmountError),
    #[error("Nothing to extract: no text and no media")]
    EmptyInput,
}

/// Bounded retry with exponential backoff, applied to backend calls only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt `attempt` (1-based):
    /// base, 2×base, 4×base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

/// Orchestrates: prompt → backend (with retry) → JSON parse → record.
pub struct Extractor<B: GenerativeBackend> {
    backend: B,
    prompts: PromptBuilder,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<B: GenerativeBackend> Extractor<B> {
    pub fn new(backend: B, schema: ExpenseSchema) -> Self {
        Self {
            backend,
            prompts: PromptBuilder::new(schema),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    pub fn schema(&self) -> &ExpenseSchema {
        self.prompts.schema()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Extract one expense from free text and/or one media attachment.
    /// Exactly one instruction payload is built; only the backend call is retried.
    pub async fn extract(
        &self,
        default_paid_by: &str,
        text: Option<&str>,
        media: Option<&MediaPart>,
    ) -> Result<ExpenseRecord, ExtractionError> {
        let prompt = self.prompts.build(self.clock.today(), default_paid_by, text);
        if prompt.user_text.is_none() && media.is_none() {
            return Err(ExtractionError::EmptyInput);
        }

        tracing::info!(
            backend = self.backend.name(),
            has_text = prompt.user_text.is_some(),
            media = media.map(|m| m.mime).unwrap_or("none"),
            "Analyzing content"
        );

        let request = GenerationRequest { prompt: &prompt, media, schema: self.schema() };
        let raw = self.generate_with_retry(&request).await?;
        let record = parse_reply(&raw)?;

        tracing::info!(?record, "Extracted expense");
        Ok(record)
    }

    async fn generate_with_retry(&self, request: &GenerationRequest<'_>) -> Result<String, ExtractionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!(attempt, max_attempts, "Generation attempt");

            match self.backend.generate(request).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Generation attempt failed");

                    if !err.is_retryable() {
                        tracing::error!(attempts = attempt, "Backend cannot handle this input");
                        return Err(ExtractionError::Backend { attempts: attempt, source: err });
                    }
                    if attempt >= max_attempts {
                        tracing::error!(attempts = attempt, "Max retries exceeded");
                        return Err(ExtractionError::Backend { attempts: attempt, source: err });
                    }

                    let delay = self.retry.delay_after(attempt);
                    tracing::info!(delay_ms = delay.as_millis() as u64, "Retrying generation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// One-shot parse of a reply. Anything but a JSON object is terminal.
pub fn parse_reply(raw: &str) -> Result<ExpenseRecord, ExtractionError> {
    match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(serde_json::Value::Object(object)) => Ok(ExpenseRecord::from_reply(&object)?),
        Ok(other) => {
            tracing::error!(raw, kind = json_kind(&other), "Reply is not a JSON object");
            Err(ExtractionError::Malformed { raw: raw.to_string() })
        }
        Err(e) => {
            tracing::error!(raw, error = %e, "Failed to parse JSON reply");
            Err(ExtractionError::Malformed { raw: raw.to_string() })
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::prompt::FixedClock;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn extractor(backend: ScriptedBackend) -> Extractor<ScriptedBackend> {
        Extractor::new(backend, ExpenseSchema::with_currency())
            .with_clock(Arc::new(FixedClock(NaiveDate::from_ymd_opt(2026, 2, 7).unwrap())))
    }

    fn unavailable() -> Result<String, BackendError> {
        Err(BackendError::Status { status: 503, body: "overloaded".into() })
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_secs(1));
        assert_eq!(p.delay_after(2), Duration::from_secs(2));
        assert_eq!(p.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn well_formed_reply_maps_exactly() {
        let ex = extractor(ScriptedBackend::replying(
            r#"{"date":"2026-02-01","item":"Groceries","amount":45.5,"currency":"PHP","paid_by":"Tine"}"#,
        ));
        let record = ex.extract("Me", Some("groceries 45.50 pesos, paid by Tine"), None).await.unwrap();
        assert_eq!(record.date(), Some("2026-02-01"));
        assert_eq!(record.item(), Some("Groceries"));
        assert_eq!(record.amount().unwrap().as_decimal(), Decimal::new(455, 1));
        assert_eq!(record.currency(), Some("PHP"));
        assert_eq!(record.paid_by(), Some("Tine"));
    }

    #[tokio::test]
    async fn invalid_json_is_not_retried() {
        let ex = extractor(ScriptedBackend::new(vec![Ok("Sure! Here is the expense".into()), Ok("{}".into())]));
        let err = ex.extract("Me", Some("Coffee 5"), None).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { ref raw } if raw == "Sure! Here is the expense"));
        assert_eq!(err.to_string(), "Failed to extract structured expense data");
        assert_eq!(ex.backend().call_count(), 1);
    }

    #[tokio::test]
    async fn non_object_json_is_malformed() {
        let ex = extractor(ScriptedBackend::replying("[1,2,3]"));
        let err = ex.extract("Me", Some("Coffee 5"), None).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_waits_one_then_two() {
        let ex = extractor(ScriptedBackend::new(vec![
            unavailable(),
            unavailable(),
            Ok(r#"{"item":"Gas","amount":50}"#.into()),
        ]));
        let record = ex.extract("Me", Some("Gas 50"), None).await.unwrap();
        assert_eq!(record.item(), Some("Gas"));

        let calls = ex.backend().calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
        assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_stops_after_three_attempts() {
        let ex = extractor(ScriptedBackend::new(vec![unavailable(), unavailable(), unavailable(), unavailable()]));
        let started = tokio::time::Instant::now();
        let err = ex.extract("Me", Some("Gas 50"), None).await.unwrap_err();

        match err {
            ExtractionError::Backend { attempts, source: BackendError::Status { status, .. } } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, 503);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ex.backend().call_count(), 3);
        // No sleep after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_input_fails_without_backoff() {
        let ex = extractor(ScriptedBackend::new(vec![
            Err(BackendError::Unsupported("image/jpeg attachments need a generative model".into())),
            Ok(r#"{"item":"Gas","amount":50}"#.into()),
        ]));
        let started = tokio::time::Instant::now();
        let err = ex.extract("Me", Some("Gas 50"), None).await.unwrap_err();

        assert!(matches!(err, ExtractionError::Backend { attempts: 1, source: BackendError::Unsupported(_) }));
        assert_eq!(ex.backend().call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn bad_amount_is_terminal() {
        let ex = extractor(ScriptedBackend::replying(r#"{"item":"Gift","amount":"priceless"}"#));
        let err = ex.extract("Me", Some("Gift"), None).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidAmount(_)));
        assert_eq!(ex.backend().call_count(), 1);
    }

    #[tokio::test]
    async fn empty_input_skips_backend() {
        let ex = extractor(ScriptedBackend::replying("{}"));
        assert!(matches!(ex.extract("Me", Some("  "), None).await, Err(ExtractionError::EmptyInput)));
        assert_eq!(ex.backend().call_count(), 0);
    }

    #[tokio::test]
    async fn media_is_sent_with_single_payload() {
        let ex = extractor(ScriptedBackend::replying(r#"{"item":"Receipt","amount":"12.00"}"#));
        let media = MediaPart { bytes: vec![0xFF, 0xD8], mime: "image/jpeg" };
        let record = ex.extract("Me", Some("Paid by Sarah"), Some(&media)).await.unwrap();
        assert_eq!(record.amount().unwrap().to_string(), "12.00");

        let calls = ex.backend().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mime, Some("image/jpeg"));
        assert!(calls[0].prompt_text.contains("User input: Paid by Sarah"));
    }
}
