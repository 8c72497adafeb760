use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger not found: {0}")]
    NotFound(String),
    #[error("Permission denied on ledger: {0}")]
    PermissionDenied(String),
    #[error("Ledger credentials are unusable: {0}")]
    Credentials(String),
    #[error("Ledger API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Ledger transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Row-oriented store addressed by a configured sheet/table name. Cells are
/// positional; no column types are enforced.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Human-readable ledger name, for logs.
    fn name(&self) -> &str;

    async fn append_row(&self, cells: &[String]) -> Result<(), LedgerError>;

    /// Every row including the header, in append order.
    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, LedgerError>;

    /// The first row, or an empty vector when the ledger has no rows.
    async fn read_header_row(&self) -> Result<Vec<String>, LedgerError>;
}

#[async_trait]
impl<B: LedgerBackend + ?Sized> LedgerBackend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn append_row(&self, cells: &[String]) -> Result<(), LedgerError> {
        (**self).append_row(cells).await
    }

    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        (**self).read_all_rows().await
    }

    async fn read_header_row(&self) -> Result<Vec<String>, LedgerError> {
        (**self).read_header_row().await
    }
}

// ── In-memory backend (always available, used for tests and dry runs) ────────

#[derive(Default)]
pub struct MemoryLedger {
    name: String,
    rows: Mutex<Vec<Vec<String>>>,
    appends: Mutex<usize>,
    denied: bool,
}

impl MemoryLedger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_rows(name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self { name: name.into(), rows: Mutex::new(rows), ..Self::default() }
    }

    /// A ledger that refuses every operation, like a sheet the service
    /// account was never shared with.
    pub fn denied(name: impl Into<String>) -> Self {
        Self { name: name.into(), denied: true, ..Self::default() }
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn append_count(&self) -> usize {
        self.appends.lock().map(|n| *n).unwrap_or_default()
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.denied {
            return Err(LedgerError::PermissionDenied(self.name.clone()));
        }
        Ok(())
    }

    fn poisoned(&self) -> LedgerError {
        LedgerError::Transport(format!("ledger '{}' lock poisoned", self.name))
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append_row(&self, cells: &[String]) -> Result<(), LedgerError> {
        self.check()?;
        self.rows.lock().map_err(|_| self.poisoned())?.push(cells.to_vec());
        *self.appends.lock().map_err(|_| self.poisoned())? += 1;
        Ok(())
    }

    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        self.check()?;
        Ok(self.rows.lock().map_err(|_| self.poisoned())?.clone())
    }

    async fn read_header_row(&self) -> Result<Vec<String>, LedgerError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .map_err(|_| self.poisoned())?
            .first()
            .cloned()
            .unwrap_or_default())
    }
}
