use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::amount::{Amount, AmountError};
use crate::schema::{ExpenseSchema, Field};

/// Shown in confirmations for fields the extraction left out.
pub const NOT_AVAILABLE: &str = "N/A";

/// One extracted expense. Fields are kept exactly as the extraction produced
/// them; absent fields are tolerated and filled in only for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    date: Option<String>,
    item: Option<String>,
    amount: Option<Amount>,
    currency: Option<String>,
    paid_by: Option<String>,
}

impl ExpenseRecord {
    pub fn new(
        date: impl Into<String>,
        item: impl Into<String>,
        amount: Amount,
        paid_by: impl Into<String>,
    ) -> Self {
        Self {
            date: Some(date.into()),
            item: Some(item.into()),
            amount: Some(amount),
            currency: None,
            paid_by: Some(paid_by.into()),
        }
    }

    pub fn with_currency(self, currency: impl Into<String>) -> Self {
        Self { currency: Some(currency.into()), ..self }
    }

    /// Build a record from a parsed reply object. Only the amount is checked:
    /// a present amount that is not a non-negative number is rejected.
    /// Text values are kept verbatim; an empty or whitespace-only string
    /// counts as absent, so display fallbacks and the default payer apply.
    pub fn from_reply(object: &Map<String, Value>) -> Result<Self, AmountError> {
        let amount = match object.get(Field::Amount.key()) {
            Some(value) => Amount::from_json(value)?,
            None => None,
        };
        Ok(Self {
            date: text_field(object, Field::Date),
            item: text_field(object, Field::Item),
            amount,
            currency: text_field(object, Field::Currency),
            paid_by: text_field(object, Field::PaidBy),
        })
    }

    /// Substitute the requesting user's identity when nobody else was named.
    pub fn with_default_payer(self, identity: &str) -> Self {
        match self.paid_by {
            Some(_) => self,
            None => Self { paid_by: Some(identity.to_string()), ..self },
        }
    }

    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    pub fn item(&self) -> Option<&str> {
        self.item.as_deref()
    }

    pub fn amount(&self) -> Option<Amount> {
        self.amount
    }

    pub fn currency(&self) -> Option<&str> {
        self.currency.as_deref()
    }

    pub fn paid_by(&self) -> Option<&str> {
        self.paid_by.as_deref()
    }

    /// Value used when rendering a confirmation.
    pub fn display(&self, field: Field, default_paid_by: &str) -> String {
        match field {
            Field::PaidBy => self.paid_by.clone().unwrap_or_else(|| default_paid_by.to_string()),
            Field::Currency => self.currency.clone().unwrap_or_default(),
            _ => self.cell(field).filter(|s| !s.is_empty()).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        }
    }

    fn cell(&self, field: Field) -> Option<String> {
        match field {
            Field::Date => self.date.clone(),
            Field::Item => self.item.clone(),
            Field::Amount => self.amount.map(|a| a.to_string()),
            Field::Currency => self.currency.clone(),
            Field::PaidBy => self.paid_by.clone(),
        }
    }
}

fn text_field(object: &Map<String, Value>, field: Field) -> Option<String> {
    match object.get(field.key())? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Flat positional projection of a record, in ledger column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow(Vec<String>);

impl LedgerRow {
    pub fn project(record: &ExpenseRecord, schema: &ExpenseSchema) -> Self {
        LedgerRow(
            schema
                .fields()
                .iter()
                .map(|spec| record.cell(spec.field).unwrap_or_default())
                .collect(),
        )
    }

    pub fn from_cells(cells: Vec<String>) -> Self {
        LedgerRow(cells)
    }

    pub fn cells(&self) -> &[String] {
        &self.0
    }

    pub fn into_cells(self) -> Vec<String> {
        self.0
    }

    /// Cell for `field`, or an empty string when the row is short.
    pub fn get(&self, schema: &ExpenseSchema, field: Field) -> &str {
        schema
            .position(field)
            .and_then(|i| self.0.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}
