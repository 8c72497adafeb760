use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Amount is not numeric: '{0}'")]
    NotNumeric(String),
    #[error("Amount is negative: '{0}'")]
    Negative(String),
}

/// A non-negative expense magnitude with currency markers already stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative(value.to_string()));
        }
        Ok(Amount(value))
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    /// Coerce free text such as `"$1,250.00"`, `"5 dollars"` or `"12,50"`.
    pub fn parse(text: &str) -> Result<Self, AmountError> {
        let raw = text.trim();
        let kept: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
            .collect();
        let kept = kept.trim_matches(|c| c == '.' || c == ',');

        if !kept.chars().any(|c| c.is_ascii_digit()) {
            return Err(AmountError::NotNumeric(raw.to_string()));
        }
        if kept.starts_with('-') {
            return Err(AmountError::Negative(raw.to_string()));
        }

        let normalized = normalize_separators(kept);
        let value = Decimal::from_str(&normalized)
            .map_err(|_| AmountError::NotNumeric(raw.to_string()))?;
        Amount::new(value)
    }

    /// Interpret a JSON value from a model reply. `null` yields `None`.
    pub fn from_json(value: &Value) -> Result<Option<Self>, AmountError> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => {
                let text = n.to_string();
                let value = Decimal::from_str(&text)
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map_err(|_| AmountError::NotNumeric(text.clone()))?;
                Amount::new(value).map(Some)
            }
            Value::String(s) => Amount::parse(s).map(Some),
            other => Err(AmountError::NotNumeric(other.to_string())),
        }
    }
}

/// `1,234.50` → `1234.50`; `1.234,56` → `1234.56`; `12,50` → `12.50`;
/// `1,234` → `1234`. With both separators present the last one is the
/// decimal point.
fn normalize_separators(s: &str) -> String {
    match (s.rfind('.'), s.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => s.replace('.', "").replacen(',', ".", 1),
        (Some(_), Some(_)) => s.replace(',', ""),
        (None, Some(_)) => {
            let groups: Vec<&str> = s.split(',').collect();
            let thousands = groups.len() > 1
                && groups[0].len() <= 3
                && groups[1..].iter().all(|g| g.len() == 3);
            if thousands {
                s.replace(',', "")
            } else {
                s.replacen(',', ".", 1).replace(',', "")
            }
        }
        (_, None) => s.to_string(),
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}
