use async_trait::async_trait;
use spendbot_core::{ExpenseRecord, ExpenseSchema, LedgerRow};
use spendbot_extract::{
    AttachmentRef, AttachmentSource, Clock, ExtractionError, Extractor, GenerativeBackend, MediaFetchError,
    MediaKind, MediaNormalizer, RetryPolicy, StagedMedia,
};
use spendbot_storage::{LedgerBackend, LedgerError, LedgerWriter};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::messages;
use crate::telegram::TransportError;

/// Characters of user input kept in log lines.
const LOG_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Plain,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub format: ReplyFormat,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), format: ReplyFormat::Plain }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self { text: text.into(), format: ReplyFormat::Markdown }
    }
}

/// Outbound channel back to the user who sent the message.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn send(&self, reply: &Reply) -> Result<(), TransportError>;
}

/// Where a message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Normalizing,
    Extracting,
    Persisting,
    Confirmed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Normalizing => "normalizing",
            Stage::Extracting => "extracting",
            Stage::Persisting => "persisting",
            Stage::Confirmed => "confirmed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Media(#[from] MediaFetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl PipelineError {
    /// The stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Media(_) => Stage::Normalizing,
            PipelineError::Extraction(_) => Stage::Extracting,
            PipelineError::Ledger(_) => Stage::Persisting,
        }
    }

    /// What the user is told. Internal error text never reaches the chat.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Media(_) => messages::ERROR_INVALID_FILE,
            PipelineError::Extraction(_) => messages::ERROR_GENERIC,
            PipelineError::Ledger(_) => messages::ERROR_LEDGER_ACCESS,
        }
    }
}

/// One inbound message, as far as the pipeline cares.
#[derive(Debug, Clone, Copy)]
pub enum Inbound<'a> {
    Text(&'a str),
    Photo { attachment: &'a AttachmentRef, caption: Option<&'a str> },
    Voice { attachment: &'a AttachmentRef },
}

impl<'a> Inbound<'a> {
    fn kind(&self) -> &'static str {
        match self {
            Inbound::Text(_) => "text",
            Inbound::Photo { .. } => "photo",
            Inbound::Voice { .. } => "voice",
        }
    }

    fn text(&self) -> Option<&'a str> {
        match *self {
            Inbound::Text(text) => Some(text),
            Inbound::Photo { caption, .. } => caption.filter(|c| !c.trim().is_empty()),
            Inbound::Voice { .. } => None,
        }
    }

    fn attachment(&self) -> Option<(&'a AttachmentRef, MediaKind)> {
        match *self {
            Inbound::Text(_) => None,
            Inbound::Photo { attachment, .. } => Some((attachment, MediaKind::Image)),
            Inbound::Voice { attachment } => Some((attachment, MediaKind::Audio)),
        }
    }
}

pub fn preview(text: &str) -> String {
    text.chars().take(LOG_PREVIEW_CHARS).collect()
}

/// Per-message orchestration: acknowledge, stage media, extract, persist,
/// confirm. Every inbound message ends with exactly one terminal reply.
/// Everything it needs is passed in at construction.
pub struct ExpensePipeline {
    extractor: Extractor<Arc<dyn GenerativeBackend>>,
    ledger: LedgerWriter<Arc<dyn LedgerBackend>>,
    normalizer: MediaNormalizer,
    attachments: Arc<dyn AttachmentSource>,
    summary_limit: usize,
}

impl ExpensePipeline {
    /// Extraction and ledger share `schema`, so the prompt, the parsed record
    /// and the written row always agree on the field list.
    pub fn new(
        schema: ExpenseSchema,
        backend: Arc<dyn GenerativeBackend>,
        ledger: Arc<dyn LedgerBackend>,
        attachments: Arc<dyn AttachmentSource>,
    ) -> Self {
        Self {
            extractor: Extractor::new(backend, schema.clone()),
            ledger: LedgerWriter::new(ledger, schema),
            normalizer: MediaNormalizer::default(),
            attachments,
            summary_limit: 10,
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { extractor: self.extractor.with_retry(retry), ..self }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { extractor: self.extractor.with_clock(clock), ..self }
    }

    pub fn with_normalizer(self, normalizer: MediaNormalizer) -> Self {
        Self { normalizer, ..self }
    }

    pub fn with_summary_limit(self, summary_limit: usize) -> Self {
        Self { summary_limit, ..self }
    }

    pub fn schema(&self) -> &ExpenseSchema {
        self.ledger.schema()
    }

    pub fn summary_limit(&self) -> usize {
        self.summary_limit
    }

    pub fn ledger(&self) -> &LedgerWriter<Arc<dyn LedgerBackend>> {
        &self.ledger
    }

    pub async fn on_text(
        &self,
        replier: &dyn Replier,
        identity: &str,
        text: &str,
    ) -> Result<ExpenseRecord, PipelineError> {
        if text.trim().is_empty() {
            deliver(replier, Reply::plain(messages::EMPTY_TEXT)).await;
            return Err(ExtractionError::EmptyInput.into());
        }
        self.handle(replier, identity, Inbound::Text(text)).await
    }

    pub async fn on_photo(
        &self,
        replier: &dyn Replier,
        identity: &str,
        attachment: &AttachmentRef,
        caption: Option<&str>,
    ) -> Result<ExpenseRecord, PipelineError> {
        self.handle(replier, identity, Inbound::Photo { attachment, caption }).await
    }

    pub async fn on_voice(
        &self,
        replier: &dyn Replier,
        identity: &str,
        attachment: &AttachmentRef,
    ) -> Result<ExpenseRecord, PipelineError> {
        self.handle(replier, identity, Inbound::Voice { attachment }).await
    }

    /// Recent rows, newest first. An unreachable ledger gets its own message,
    /// distinct from an empty one.
    pub async fn summary(&self, replier: &dyn Replier, identity: &str) -> Result<Vec<LedgerRow>, LedgerError> {
        tracing::info!(user = identity, "Summary requested");
        match self.ledger.read_tail(self.summary_limit).await {
            Ok(rows) => {
                let text = messages::summary(&rows, self.schema(), self.summary_limit);
                deliver(replier, Reply::markdown(text)).await;
                Ok(rows)
            }
            Err(e) => {
                tracing::error!(user = identity, error = %e, "Error reading summary");
                deliver(replier, Reply::plain(messages::ERROR_LEDGER_ACCESS)).await;
                Err(e)
            }
        }
    }

    async fn handle(
        &self,
        replier: &dyn Replier,
        identity: &str,
        inbound: Inbound<'_>,
    ) -> Result<ExpenseRecord, PipelineError> {
        let input = inbound.text().map(preview).unwrap_or_default();
        tracing::info!(user = identity, kind = inbound.kind(), %input, "Message received");
        tracing::debug!(user = identity, stage = %Stage::Received, "Stage");

        deliver(replier, Reply::plain(messages::PROCESSING)).await;

        match self.process(identity, inbound).await {
            Ok(record) => {
                tracing::debug!(user = identity, stage = %Stage::Confirmed, "Stage");
                let text = messages::confirmation(&record, self.schema(), identity);
                deliver(replier, Reply::markdown(text)).await;
                tracing::info!(user = identity, kind = inbound.kind(), "Expense processed");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(
                    user = identity,
                    kind = inbound.kind(),
                    %input,
                    stage = %Stage::Failed,
                    failed_at = %e.stage(),
                    error = %e,
                    "Error handling message"
                );
                deliver(replier, Reply::plain(e.user_message())).await;
                Err(e)
            }
        }
    }

    /// Staged media lives until this returns, on success and failure alike.
    async fn process(&self, identity: &str, inbound: Inbound<'_>) -> Result<ExpenseRecord, PipelineError> {
        let staged = match inbound.attachment() {
            Some((attachment, kind)) => {
                tracing::debug!(user = identity, stage = %Stage::Normalizing, %kind, "Stage");
                let staged = self.normalizer.stage(self.attachments.as_ref(), attachment, kind).await?;
                tracing::debug!(user = identity, digest = %staged.digest(), "Media ready");
                Some(staged)
            }
            None => None,
        };

        tracing::debug!(user = identity, stage = %Stage::Extracting, "Stage");
        let record = self
            .extractor
            .extract(identity, inbound.text(), staged.as_ref().map(StagedMedia::part))
            .await?
            .with_default_payer(identity);

        tracing::debug!(user = identity, stage = %Stage::Persisting, "Stage");
        self.ledger.append(&record).await?;
        Ok(record)
    }
}

/// Delivery is best effort; a failed send never changes the outcome.
async fn deliver(replier: &dyn Replier, reply: Reply) {
    if let Err(e) = replier.send(&reply).await {
        tracing::warn!(error = %e, "Could not deliver reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_to_distinct_messages() {
        let media = PipelineError::from(MediaFetchError::Empty);
        let extraction = PipelineError::from(ExtractionError::Malformed { raw: "nope".into() });
        let ledger = PipelineError::from(LedgerError::NotFound("Expense_Tracker".into()));

        assert_eq!(media.user_message(), messages::ERROR_INVALID_FILE);
        assert_eq!(extraction.user_message(), messages::ERROR_GENERIC);
        assert_eq!(ledger.user_message(), messages::ERROR_LEDGER_ACCESS);

        assert_eq!(media.stage(), Stage::Normalizing);
        assert_eq!(extraction.stage(), Stage::Extracting);
        assert_eq!(ledger.stage(), Stage::Persisting);
    }

    #[test]
    fn user_messages_never_carry_internal_text() {
        let err = PipelineError::from(LedgerError::Api { status: 500, body: "stack trace".into() });
        assert!(!err.user_message().contains("stack trace"));
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        let long = "é".repeat(80);
        assert_eq!(preview(&long).chars().count(), 50);
        assert_eq!(preview("Coffee 5"), "Coffee 5");
    }

    #[test]
    fn blank_caption_is_no_text() {
        let attachment = AttachmentRef::new("f");
        let inbound = Inbound::Photo { attachment: &attachment, caption: Some("  ") };
        assert_eq!(inbound.text(), None);
        assert_eq!(inbound.attachment().map(|(_, k)| k), Some(MediaKind::Image));
    }
}
