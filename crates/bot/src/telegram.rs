use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use spendbot_extract::{AttachmentRef, AttachmentSource, FetchedAttachment, MediaFetchError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::{Replier, Reply, ReplyFormat};

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
const USER_AGENT: &str = concat!("spendbot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("Telegram reply was missing its result")]
    EmptyResult,
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<PhotoSize>>,
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
}

impl Message {
    /// Largest rendition of an attached photo.
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo
            .as_deref()?
            .iter()
            .max_by_key(|p| (u64::from(p.width) * u64::from(p.height), p.file_size.unwrap_or(0)))
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Minimal Bot API client: long polling, replies, file downloads.
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, token: token.into(), base_url: DEFAULT_BASE_URL.to_string() })
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..self }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url.trim_end_matches('/'), self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url.trim_end_matches('/'), self.token, file_path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError> {
        let mut request = self.http.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let reply: ApiResponse<T> = request.send().await?.json().await?;
        unwrap_reply(reply)
    }

    /// Long-poll for updates after `offset`. The HTTP timeout is stretched past
    /// the poll window so an idle poll is not reported as a failure.
    pub async fn get_updates(&self, offset: i64, poll_timeout: Duration) -> Result<Vec<Update>, TransportError> {
        let body = json!({
            "offset": offset,
            "timeout": poll_timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", &body, Some(poll_timeout + Duration::from_secs(10))).await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str, format: ReplyFormat) -> Result<(), TransportError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if format == ReplyFormat::Markdown {
            body["parse_mode"] = json!("Markdown");
        }
        let _: Value = self.call("sendMessage", &body, None).await?;
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, TransportError> {
        self.call("getFile", &json!({ "file_id": file_id }), None).await
    }

    pub async fn download(&self, file_path: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.http.get(self.file_url(file_path)).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn unwrap_reply<T>(reply: ApiResponse<T>) -> Result<T, TransportError> {
    if !reply.ok {
        return Err(TransportError::Api {
            code: reply.error_code.unwrap_or_default(),
            description: reply.description.unwrap_or_default(),
        });
    }
    reply.result.ok_or(TransportError::EmptyResult)
}

#[async_trait]
impl AttachmentSource for TelegramClient {
    async fn fetch(&self, attachment: &AttachmentRef) -> Result<FetchedAttachment, MediaFetchError> {
        let remote = self
            .get_file(&attachment.file_id)
            .await
            .map_err(|e| MediaFetchError::Download(e.to_string()))?;
        let path = remote
            .file_path
            .ok_or_else(|| MediaFetchError::Download(format!("no download path for {}", remote.file_id)))?;

        tracing::debug!(file_id = %attachment.file_id, size = ?remote.file_size, "Downloading attachment");
        let bytes = self.download(&path).await.map_err(|e| MediaFetchError::Download(e.to_string()))?;
        Ok(FetchedAttachment { bytes, remote_path: Some(path) })
    }
}

/// Sends replies into one chat.
pub struct TelegramReplier {
    client: Arc<TelegramClient>,
    chat_id: i64,
}

impl TelegramReplier {
    pub fn new(client: Arc<TelegramClient>, chat_id: i64) -> Self {
        Self { client, chat_id }
    }
}

#[async_trait]
impl Replier for TelegramReplier {
    async fn send(&self, reply: &Reply) -> Result<(), TransportError> {
        match self.client.send_message(self.chat_id, &reply.text, reply.format).await {
            // Extracted text can contain stray Markdown; resend it verbatim.
            Err(TransportError::Api { code: 400, description }) if reply.format == ReplyFormat::Markdown => {
                tracing::warn!(chat = self.chat_id, %description, "Markdown rejected, resending as plain text");
                self.client.send_message(self.chat_id, &reply.text, ReplyFormat::Plain).await
            }
            other => other,
        }
    }
}
