use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::backend::{LedgerBackend, LedgerError};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they actually expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

// ── Credentials ───────────────────────────────────────────────────────────────

/// The fields of a downloaded service-account JSON key that matter here.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub async fn from_file(path: &Path) -> Result<Self, LedgerError> {
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| LedgerError::Credentials(format!("{}: {e}", path.display())))
    }

    /// Signed RS256 assertion for the JWT-bearer grant.
    fn assertion(&self, issued_at: i64) -> Result<String, LedgerError> {
        let claims = Claims {
            iss: &self.client_email,
            scope: SCOPES,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + TOKEN_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| LedgerError::Credentials(e.to_string()))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| LedgerError::Credentials(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    TOKEN_LIFETIME_SECS as u64
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

// ── Locating the spreadsheet ──────────────────────────────────────────────────

/// How the spreadsheet is addressed: directly by ID, or by its Drive name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpreadsheetLocator {
    Id(String),
    Name(String),
}

impl fmt::Display for SpreadsheetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpreadsheetLocator::Id(id) => write!(f, "spreadsheet {id}"),
            SpreadsheetLocator::Name(name) => write!(f, "sheet '{name}'"),
        }
    }
}

/// Resolved spreadsheet ID and the title of its first worksheet.
#[derive(Debug, Clone)]
struct Worksheet {
    spreadsheet_id: String,
    title: String,
}

impl Worksheet {
    /// Whole-sheet A1 range, e.g. `'Sheet 1'`.
    fn range(&self) -> String {
        quote_sheet_title(&self.title)
    }

    fn header_range(&self) -> String {
        format!("{}!1:1", self.range())
    }
}

fn quote_sheet_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// Google Sheets v4 ledger authenticated with a service-account key.
pub struct SheetsBackend {
    http: reqwest::Client,
    key: ServiceAccountKey,
    locator: SpreadsheetLocator,
    label: String,
    token: Mutex<Option<CachedToken>>,
    worksheet: OnceCell<Worksheet>,
}

impl SheetsBackend {
    pub fn new(key: ServiceAccountKey, locator: SpreadsheetLocator, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        let label = match &locator {
            SpreadsheetLocator::Id(id) | SpreadsheetLocator::Name(id) => id.clone(),
        };

        Ok(Self {
            http,
            key,
            locator,
            label,
            token: Mutex::new(None),
            worksheet: OnceCell::new(),
        })
    }

    async fn access_token(&self) -> Result<String, LedgerError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!(account = %self.key.client_email, "Requesting Google access token");
        let assertion = self.key.assertion(chrono::Utc::now().timestamp())?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let response = check_status(response, &self.locator).await.map_err(|e| match e {
            LedgerError::Api { status: 400, body } => LedgerError::Credentials(body),
            other => other,
        })?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Credentials(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken { value: token.access_token.clone(), refresh_at: Instant::now() + lifetime });
        Ok(token.access_token)
    }

    async fn worksheet(&self) -> Result<&Worksheet, LedgerError> {
        self.worksheet.get_or_try_init(|| self.resolve_worksheet()).await
    }

    async fn resolve_worksheet(&self) -> Result<Worksheet, LedgerError> {
        let spreadsheet_id = match &self.locator {
            SpreadsheetLocator::Id(id) => id.clone(),
            SpreadsheetLocator::Name(name) => self.find_by_name(name).await?,
        };

        let url = api_url(SHEETS_API, &[spreadsheet_id.as_str()])?;
        let body = self.get_json(url, &[("fields", "sheets.properties.title")]).await?;
        let title = body
            .pointer("/sheets/0/properties/title")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::NotFound(format!("{} has no worksheets", self.locator)))?
            .to_string();

        tracing::info!(ledger = %self.locator, spreadsheet_id = %spreadsheet_id, worksheet = %title, "Accessed sheet");
        Ok(Worksheet { spreadsheet_id, title })
    }

    async fn find_by_name(&self, name: &str) -> Result<String, LedgerError> {
        let query = format!(
            "name = '{}' and mimeType = 'application/vnd.google-apps.spreadsheet' and trashed = false",
            name.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let url = Url::parse(DRIVE_FILES_API).map_err(|e| LedgerError::Transport(e.to_string()))?;
        let body = self
            .get_json(url, &[("q", query.as_str()), ("fields", "files(id,name)")])
            .await?;

        body.pointer("/files/0/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LedgerError::NotFound(self.locator.to_string()))
    }

    async fn get_json(&self, url: Url, query: &[(&str, &str)]) -> Result<Value, LedgerError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        check_status(response, &self.locator)
            .await?
            .json()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))
    }

    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, LedgerError> {
        let sheet = self.worksheet().await?;
        let url = api_url(SHEETS_API, &[sheet.spreadsheet_id.as_str(), "values", range])?;
        let body = self.get_json(url, &[("majorDimension", "ROWS")]).await?;
        Ok(value_rows(&body))
    }
}

#[async_trait]
impl LedgerBackend for SheetsBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn append_row(&self, cells: &[String]) -> Result<(), LedgerError> {
        let sheet = self.worksheet().await?;
        let segment = format!("{}:append", sheet.range());
        let url = api_url(SHEETS_API, &[sheet.spreadsheet_id.as_str(), "values", segment.as_str()])?;
        let token = self.access_token().await?;

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[("valueInputOption", "USER_ENTERED"), ("insertDataOption", "INSERT_ROWS")])
            .json(&json!({ "majorDimension": "ROWS", "values": [cells] }))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        check_status(response, &self.locator).await?;
        Ok(())
    }

    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        let range = self.worksheet().await?.range();
        self.read_range(&range).await
    }

    async fn read_header_row(&self) -> Result<Vec<String>, LedgerError> {
        let range = self.worksheet().await?.header_range();
        Ok(self.read_range(&range).await?.into_iter().next().unwrap_or_default())
    }
}

fn api_url(base: &str, segments: &[&str]) -> Result<Url, LedgerError> {
    let mut url = Url::parse(base).map_err(|e| LedgerError::Transport(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| LedgerError::Transport(format!("cannot extend {base}")))?
        .extend(segments);
    Ok(url)
}

async fn check_status(response: Response, locator: &SpreadsheetLocator) -> Result<Response, LedgerError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body, locator))
}

fn status_error(status: u16, body: String, locator: &SpreadsheetLocator) -> LedgerError {
    match status {
        404 => LedgerError::NotFound(locator.to_string()),
        401 | 403 => LedgerError::PermissionDenied(format!("{locator}: {body}")),
        _ => LedgerError::Api { status, body },
    }
}

/// `values` of a ValueRange as strings; absent when the range is empty.
fn value_rows(body: &Value) -> Vec<Vec<String>> {
    body.get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
