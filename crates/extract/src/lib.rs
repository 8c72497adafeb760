pub mod backend;
pub mod client;
pub mod gemini;
pub mod hash;
pub mod media;
pub mod prompt;
pub mod rules;

pub use backend::{BackendError, GenerationRequest, GenerativeBackend, RecordedCall, ScriptedBackend};
pub use client::{ExtractionError, Extractor, RetryPolicy};
pub use gemini::GeminiBackend;
pub use hash::{sha256_bytes, short_digest, to_hex};
pub use media::{
    mime_for, AttachmentRef, AttachmentSource, FetchedAttachment, MediaFetchError, MediaKind,
    MediaNormalizer, MediaPart, StagedMedia,
};
pub use prompt::{Clock, FixedClock, Prompt, PromptBuilder, SystemClock};
pub use rules::RulesBackend;
