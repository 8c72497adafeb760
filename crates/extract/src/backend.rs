use async_trait::async_trait;
use spendbot_core::ExpenseSchema;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Instant;

use crate::media::MediaPart;
use crate::prompt::Prompt;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend transport error: {0}")]
    Transport(String),
    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Backend reply contained no text: {0}")]
    EmptyReply(String),
    #[error("Backend cannot handle this input: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Whether another attempt could succeed. A backend that cannot handle the
    /// input at all will refuse it again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Unsupported(_))
    }
}

/// Everything a backend needs for one round trip.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a Prompt,
    pub media: Option<&'a MediaPart>,
    pub schema: &'a ExpenseSchema,
}

/// A structured-extraction oracle: instruction (+ optional inline media) in,
/// raw reply text out. Implementations must ask for JSON-only output at a low,
/// fixed temperature.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError>;
}

#[async_trait]
impl<B: GenerativeBackend + ?Sized> GenerativeBackend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        (**self).generate(request).await
    }
}

// ── Scripted backend (always available, used for tests) ───────────────────────

/// What a [`ScriptedBackend`] saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub prompt_text: String,
    pub mime: Option<&'static str>,
}

/// Replays queued replies in order and records every call. Once the queue is
/// empty each call fails with a transport error.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) }
    }

    pub fn replying(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    /// Fails on every call.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                at: Instant::now(),
                prompt_text: request.prompt.full_text(),
                mime: request.media.map(|m| m.mime),
            });
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(BackendError::Transport("no scripted reply left".into())))
    }
}
