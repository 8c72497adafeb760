pub mod backend;
pub mod sheets;
pub mod writer;

pub use backend::{LedgerBackend, LedgerError, MemoryLedger};
pub use sheets::{ServiceAccountKey, SheetsBackend, SpreadsheetLocator};
pub use writer::LedgerWriter;
