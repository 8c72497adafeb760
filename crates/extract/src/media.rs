use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::hash;

#[derive(Debug, Error)]
pub enum MediaFetchError {
    #[error("Attachment download failed: {0}")]
    Download(String),
    #[error("Attachment staging failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Attachment is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Attachment is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Handle to a remotely hosted attachment, as delivered by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub file_id: String,
    /// File name or remote path when the platform provides one.
    pub file_name: Option<String>,
}

impl AttachmentRef {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self { file_id: file_id.into(), file_name: None }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub bytes: Vec<u8>,
    /// Remote path reported by the platform at download time, if any.
    pub remote_path: Option<String>,
}

/// Retrieves attachment bytes, independent of any particular chat transport.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self, attachment: &AttachmentRef) -> Result<FetchedAttachment, MediaFetchError>;
}

/// Bytes plus a concrete MIME type, ready to be sent inline to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPart {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

/// Image MIME is inferred from the file suffix; voice notes are always OGG.
pub fn mime_for(kind: MediaKind, name: Option<&str>) -> &'static str {
    match kind {
        MediaKind::Audio => "audio/ogg",
        MediaKind::Image => {
            let ext = name
                .and_then(|n| Path::new(n).extension())
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            match ext.as_deref() {
                Some("png") => "image/png",
                _ => "image/jpeg",
            }
        }
    }
}

fn suffix_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "audio/ogg" => ".ogg",
        _ => ".jpg",
    }
}

/// Media staged on disk for the duration of one message. Dropping it removes
/// the temporary file, whichever way the handler exits.
#[derive(Debug)]
pub struct StagedMedia {
    kind: MediaKind,
    part: MediaPart,
    file: NamedTempFile,
}

impl StagedMedia {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn part(&self) -> &MediaPart {
        &self.part
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn digest(&self) -> String {
        hash::short_digest(&self.part.bytes)
    }
}

/// Turns a platform attachment into bytes + MIME type.
#[derive(Debug, Clone)]
pub struct MediaNormalizer {
    max_bytes: usize,
    staging_dir: Option<PathBuf>,
}

impl MediaNormalizer {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes, staging_dir: None }
    }

    /// Stage into `dir` instead of the system temp directory.
    pub fn with_staging_dir(self, dir: PathBuf) -> Self {
        Self { staging_dir: Some(dir), ..self }
    }

    pub async fn stage(
        &self,
        source: &dyn AttachmentSource,
        attachment: &AttachmentRef,
        kind: MediaKind,
    ) -> Result<StagedMedia, MediaFetchError> {
        let fetched = source.fetch(attachment).await?;
        if fetched.bytes.is_empty() {
            return Err(MediaFetchError::Empty);
        }
        if fetched.bytes.len() > self.max_bytes {
            return Err(MediaFetchError::TooLarge {
                size: fetched.bytes.len(),
                limit: self.max_bytes,
            });
        }

        let name = fetched.remote_path.as_deref().or(attachment.file_name.as_deref());
        let mime = mime_for(kind, name);

        let mut builder = tempfile::Builder::new();
        builder.prefix("spendbot-").suffix(suffix_for(mime));
        let file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        tokio::fs::write(file.path(), &fetched.bytes).await?;
        let bytes = tokio::fs::read(file.path()).await?;

        tracing::debug!(
            kind = %kind,
            mime,
            size = bytes.len(),
            digest = %hash::short_digest(&bytes),
            path = %file.path().display(),
            "Attachment staged"
        );

        Ok(StagedMedia { kind, part: MediaPart { bytes, mime }, file })
    }
}

impl Default for MediaNormalizer {
    fn default() -> Self {
        Self::new(20 * 1024 * 1024)
    }
}
