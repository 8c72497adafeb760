use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One column of an expense ledger and one key of the extraction reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Date,
    Item,
    Amount,
    Currency,
    PaidBy,
}

impl Field {
    /// Key used in the structured reply.
    pub fn key(self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Item => "item",
            Field::Amount => "amount",
            Field::Currency => "currency",
            Field::PaidBy => "paid_by",
        }
    }

    /// Canonical ledger header label.
    pub fn header(self) -> &'static str {
        match self {
            Field::Date => "Date",
            Field::Item => "Item",
            Field::Amount => "Amount",
            Field::Currency => "Currency",
            Field::PaidBy => "Paid By",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Field::Date => "Date in YYYY-MM-DD format",
            Field::Item => "Description of the item or expense",
            Field::Amount => "Numeric amount of the expense",
            Field::Currency => "Currency code or name (e.g., USD, PHP, Peso)",
            Field::PaidBy => "Name of the person who paid",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Field::Amount)
    }

    /// Placeholder shown in the instruction's output template.
    pub fn template(self) -> &'static str {
        match self {
            Field::Date => "\"YYYY-MM-DD\"",
            Field::Amount => "float",
            _ => "\"string\"",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Field,
    pub required: bool,
}

/// Ordered field list shared by the prompt, the reply validation and the row
/// projection. Order is the ledger column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseSchema {
    fields: Vec<FieldSpec>,
}

impl ExpenseSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// `date, item, amount, paid_by`
    pub fn standard() -> Self {
        Self::new(
            [Field::Date, Field::Item, Field::Amount, Field::PaidBy]
                .into_iter()
                .map(|field| FieldSpec { field, required: true })
                .collect(),
        )
    }

    /// `date, item, amount, currency, paid_by`
    pub fn with_currency() -> Self {
        Self::new(
            [Field::Date, Field::Item, Field::Amount, Field::Currency, Field::PaidBy]
                .into_iter()
                .map(|field| FieldSpec { field, required: true })
                .collect(),
        )
    }

    pub fn for_deployment(include_currency: bool) -> Self {
        if include_currency {
            Self::with_currency()
        } else {
            Self::standard()
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn contains(&self, field: Field) -> bool {
        self.position(field).is_some()
    }

    pub fn position(&self, field: Field) -> Option<usize> {
        self.fields.iter().position(|f| f.field == field)
    }

    pub fn headers(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.field.header().to_string()).collect()
    }

    /// JSON Schema (draft style, lowercase types) describing the reply object.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.fields {
            let kind = if spec.field.is_numeric() { "number" } else { "string" };
            properties.insert(
                spec.field.key().to_string(),
                json!({ "type": kind, "description": spec.field.description() }),
            );
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.field.key())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// The literal object template embedded in extraction instructions.
    pub fn template(&self) -> String {
        let body: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("  \"{}\": {}", f.field.key(), f.field.template()))
            .collect();
        format!("{{\n{}\n}}", body.join(",\n"))
    }
}

impl Default for ExpenseSchema {
    fn default() -> Self {
        Self::with_currency()
    }
}
