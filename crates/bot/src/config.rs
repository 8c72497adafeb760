use serde::Deserialize;
use spendbot_core::ExpenseSchema;
use spendbot_extract::RetryPolicy;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "spendbot.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Configuration errors: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Which generative backend answers extraction requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Gemini,
    Rules,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(BackendKind::Gemini),
            "rules" => Ok(BackendKind::Rules),
            _ => Err(ConfigError::InvalidValue { key: "EXTRACTION_BACKEND", value: s.to_string() }),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gemini => write!(f, "gemini"),
            BackendKind::Rules => write!(f, "rules"),
        }
    }
}

/// Bot settings. Every key is optional in the file; secrets usually come
/// from the environment.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub telegram_bot_token: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub google_sheets_creds_file: Option<PathBuf>,
    pub google_sheet_name: String,
    pub google_spreadsheet_id: Option<String>,
    pub log_level: String,
    pub extraction_backend: BackendKind,
    pub include_currency: bool,
    pub summary_limit: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_file_size_mb: usize,
    pub poll_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            gemini_api_key: None,
            gemini_model: "gemini-2.5-flash".to_string(),
            google_sheets_creds_file: None,
            google_sheet_name: "Expense_Tracker".to_string(),
            google_spreadsheet_id: None,
            log_level: "info".to_string(),
            extraction_backend: BackendKind::Gemini,
            include_currency: true,
            summary_limit: 10,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 60,
            max_file_size_mb: 20,
            poll_timeout_secs: 30,
        }
    }
}

// Secrets stay out of Debug output.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(secret: &Option<String>) -> &'static str {
            if secret.is_some() { "<set>" } else { "<unset>" }
        }
        f.debug_struct("Config")
            .field("telegram_bot_token", &redact(&self.telegram_bot_token))
            .field("gemini_api_key", &redact(&self.gemini_api_key))
            .field("gemini_model", &self.gemini_model)
            .field("google_sheets_creds_file", &self.google_sheets_creds_file)
            .field("google_sheet_name", &self.google_sheet_name)
            .field("google_spreadsheet_id", &self.google_spreadsheet_id)
            .field("log_level", &self.log_level)
            .field("extraction_backend", &self.extraction_backend)
            .field("include_currency", &self.include_currency)
            .field("summary_limit", &self.summary_limit)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_file_size_mb", &self.max_file_size_mb)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

impl Config {
    /// Read `path`, or `spendbot.toml` when none is given, then apply the
    /// process environment on top. A missing default file is not an error;
    /// a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Override file values with whatever `lookup` returns for the known
    /// environment variable names. Blank values are ignored.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini_api_key = Some(v);
        }
        if let Some(v) = get("GEMINI_MODEL") {
            self.gemini_model = v;
        }
        if let Some(v) = get("GOOGLE_SHEETS_CREDS_FILE") {
            self.google_sheets_creds_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("GOOGLE_SHEET_NAME") {
            self.google_sheet_name = v;
        }
        if let Some(v) = get("GOOGLE_SPREADSHEET_ID") {
            self.google_spreadsheet_id = Some(v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_lowercase();
        }
        if let Some(v) = get("EXTRACTION_BACKEND") {
            self.extraction_backend = v.parse()?;
        }
        Ok(self)
    }

    /// Collect every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.telegram_bot_token.is_none() {
            errors.push("TELEGRAM_BOT_TOKEN is not set".to_string());
        }
        if self.extraction_backend == BackendKind::Gemini && self.gemini_api_key.is_none() {
            errors.push("GEMINI_API_KEY is not set".to_string());
        }
        if self.google_sheets_creds_file.is_none() {
            errors.push("GOOGLE_SHEETS_CREDS_FILE is not set".to_string());
        }
        if self.google_sheet_name.trim().is_empty() && self.google_spreadsheet_id.is_none() {
            errors.push("GOOGLE_SHEET_NAME is empty".to_string());
        }
        if self.max_attempts == 0 {
            errors.push("max_attempts must be at least 1".to_string());
        }
        if self.summary_limit == 0 {
            errors.push("summary_limit must be at least 1".to_string());
        }
        if self.max_file_size_mb == 0 {
            errors.push("max_file_size_mb must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn schema(&self) -> ExpenseSchema {
        ExpenseSchema::for_deployment(self.include_currency)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn max_file_bytes(&self) -> usize {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}
