use spendbot_core::{ExpenseRecord, ExpenseSchema, LedgerRow};

use crate::backend::{LedgerBackend, LedgerError};

/// Appends validated expenses as rows and reads recent ones back.
pub struct LedgerWriter<B: LedgerBackend> {
    backend: B,
    schema: ExpenseSchema,
}

impl<B: LedgerBackend> LedgerWriter<B> {
    pub fn new(backend: B, schema: ExpenseSchema) -> Self {
        Self { backend, schema }
    }

    pub fn schema(&self) -> &ExpenseSchema {
        &self.schema
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Append `record` as the new last row. There is no idempotency key: a
    /// repeated call writes a second row.
    pub async fn append(&self, record: &ExpenseRecord) -> Result<LedgerRow, LedgerError> {
        let row = LedgerRow::project(record, &self.schema);
        tracing::info!(ledger = self.backend.name(), cells = ?row.cells(), "Adding expense row");

        self.backend.append_row(row.cells()).await.map_err(|e| {
            tracing::error!(ledger = self.backend.name(), error = %e, "Error adding expense row");
            e
        })?;
        Ok(row)
    }

    /// Up to `limit` data rows, newest first. A ledger holding only its header
    /// (or nothing at all) yields an empty list.
    pub async fn read_tail(&self, limit: usize) -> Result<Vec<LedgerRow>, LedgerError> {
        let rows = self.backend.read_all_rows().await?;
        let data = rows.get(1..).unwrap_or_default();
        if data.is_empty() {
            tracing::info!(ledger = self.backend.name(), "No expense data found");
            return Ok(Vec::new());
        }

        let tail: Vec<LedgerRow> = data
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .map(LedgerRow::from_cells)
            .collect();
        tracing::debug!(ledger = self.backend.name(), count = tail.len(), "Retrieved recent expenses");
        Ok(tail)
    }

    /// Write the canonical header into an empty ledger. An existing header that
    /// differs is reported but left alone. Returns `false` only when the
    /// ledger cannot be reached.
    pub async fn ensure_header(&self) -> bool {
        let expected = self.schema.headers();

        let header = match self.backend.read_header_row().await {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(ledger = self.backend.name(), error = %e, "Sheet verification failed");
                return false;
            }
        };

        if header.is_empty() {
            tracing::warn!(ledger = self.backend.name(), "Sheet has no headers, creating header row");
            if let Err(e) = self.backend.append_row(&expected).await {
                tracing::error!(ledger = self.backend.name(), error = %e, "Could not write header row");
                return false;
            }
            tracing::info!(ledger = self.backend.name(), "Header row created");
        } else if header != expected {
            tracing::warn!(
                ledger = self.backend.name(),
                ?expected,
                found = ?header,
                "Sheet headers mismatch"
            );
        }

        tracing::info!(ledger = self.backend.name(), "Sheet access verified");
        true
    }
}
