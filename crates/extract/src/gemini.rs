use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use spendbot_core::ExpenseSchema;
use std::time::Duration;

use crate::backend::{BackendError, GenerationRequest, GenerativeBackend};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const USER_AGENT: &str = concat!("spendbot/", env!("CARGO_PKG_VERSION"));

/// Decoding temperature for extraction; kept low so replies stay deterministic.
pub const TEMPERATURE: f64 = 0.1;

/// Gemini `generateContent` over REST.
pub struct GeminiBackend {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..self }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        let body = request_body(request);

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        reply_text(&reply)
    }
}

/// Request body: one user turn holding the instruction text and, when present,
/// the media as an inline blob.
pub fn request_body(request: &GenerationRequest<'_>) -> Value {
    let mut parts = vec![json!({ "text": request.prompt.full_text() })];
    if let Some(media) = request.media {
        parts.push(json!({
            "inlineData": {
                "mimeType": media.mime,
                "data": base64::engine::general_purpose::STANDARD.encode(&media.bytes),
            }
        }));
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": TEMPERATURE,
            "responseMimeType": "application/json",
            "responseSchema": response_schema(request.schema),
        }
    })
}

/// The schema in Gemini's OpenAPI subset: upper-case type names plus an
/// explicit property ordering.
pub fn response_schema(schema: &ExpenseSchema) -> Value {
    let mut out = schema.json_schema();
    upper_case_types(&mut out);
    let ordering: Vec<&str> = schema.fields().iter().map(|f| f.field.key()).collect();
    out["propertyOrdering"] = json!(ordering);
    out
}

fn upper_case_types(value: &mut Value) {
    let Some(object) = value.as_object_mut() else { return };
    if let Some(Value::String(kind)) = object.get_mut("type") {
        *kind = kind.to_uppercase();
    }
    if let Some(Value::Object(properties)) = object.get_mut("properties") {
        properties.values_mut().for_each(upper_case_types);
    }
}

/// Concatenated text of the first candidate.
pub fn reply_text(reply: &Value) -> Result<String, BackendError> {
    let Some(candidate) = reply
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        let reason = reply
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        return Err(BackendError::EmptyReply(reason.to_string()));
    };

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("empty content");
        return Err(BackendError::EmptyReply(reason.to_string()));
    }
    Ok(text)
}
