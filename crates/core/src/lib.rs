pub mod amount;
pub mod record;
pub mod schema;

pub use amount::{Amount, AmountError};
pub use record::{ExpenseRecord, LedgerRow, NOT_AVAILABLE};
pub use schema::{ExpenseSchema, Field, FieldSpec};
