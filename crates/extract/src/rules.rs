use std::ops::Range;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Number, Value};
use spendbot_core::{Amount, Field};

use crate::backend::{BackendError, GenerationRequest, GenerativeBackend};

/// Item used when nothing descriptive is left after extraction.
pub const PLACEHOLDER_ITEM: &str = "Expense";

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_paid_by,
    r"(?i)\b(?:paid|bought|purchased)\s+by\s+(\p{L}[\p{L}'\-]*)");
re!(re_payer_first,
    r"(?i)\b(\p{L}[\p{L}'\-]*)\s+(?:paid|bought)\b");

re!(re_date_month_name,
    r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2}),?\s+(\d{4})\b");
re!(re_date_abbr_month,
    r"(?i)\b(\d{1,2})\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)\.?\s+(\d{4})\b");
re!(re_date_iso,
    r"\b(\d{4})-(\d{2})-(\d{2})\b");
re!(re_date_slash,
    r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b");
re!(re_relative_day,
    r"(?i)\b(today|yesterday)\b");

re!(re_currency,
    r"(?i)(?:[$€£₱]|\b(?:usd|eur|gbp|php|jpy|dollars?|bucks|euros?|pounds?|pesos?|yen)\b)");
re!(re_amount,
    r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d{1,3}(?:\.\d{3})+(?:,\d+)?|\d+(?:[.,]\d+)?");

re!(re_filler_lead,
    r"(?i)^(?:(?:paid|bought|spent|purchased|this|for|on|the|a|an)\b[\s:,\-]*)+");
re!(re_filler_trail,
    r"(?i)(?:[\s:,\-]+(?:for|on|at|of|with|paid|bought))+$");

/// Words that precede "paid"/"bought" without naming a payer.
const NOT_A_NAME: &[&str] = &[
    "i", "we", "you", "they", "he", "she", "me", "it", "just", "already", "also", "and",
    "who", "that", "which", "has", "have", "had", "was", "been", "be", "is",
];

// ── Backend ──────────────────────────────────────────────────────────────────

/// Offline backend: the extraction rules applied with regular expressions
/// over the user's text. Replies in the same JSON shape a model would.
pub struct RulesBackend;

#[async_trait]
impl GenerativeBackend for RulesBackend {
    fn name(&self) -> &str {
        "rules"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        if let Some(media) = request.media {
            return Err(BackendError::Unsupported(format!(
                "{} attachments need a generative model",
                media.mime
            )));
        }
        let text = request
            .prompt
            .user_text
            .as_deref()
            .ok_or_else(|| BackendError::Unsupported("no text to read".into()))?;

        let parsed = ParsedExpense::from_text(text, request.prompt.today);

        let mut reply = Map::new();
        for spec in request.schema.fields() {
            let value = match spec.field {
                Field::Date => Some(Value::String(parsed.date.format("%Y-%m-%d").to_string())),
                Field::Item => Some(Value::String(parsed.item.clone())),
                Field::Amount => parsed.amount.and_then(amount_number).map(Value::Number),
                Field::Currency => parsed.currency.map(|c| Value::String(c.to_string())),
                Field::PaidBy => Some(Value::String(
                    parsed
                        .paid_by
                        .clone()
                        .unwrap_or_else(|| request.prompt.default_paid_by.clone()),
                )),
            };
            if let Some(value) = value {
                reply.insert(spec.field.key().to_string(), value);
            }
        }

        Ok(Value::Object(reply).to_string())
    }
}

/// Whole amounts stay integers so the ledger shows `50`, not `50.0`.
fn amount_number(amount: Amount) -> Option<Number> {
    let value = amount.as_decimal();
    if value.fract().is_zero() {
        value.to_u64().map(Number::from)
    } else {
        value.to_f64().and_then(Number::from_f64)
    }
}

// ── Text extraction ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct ParsedExpense {
    date: NaiveDate,
    item: String,
    amount: Option<Amount>,
    currency: Option<&'static str>,
    paid_by: Option<String>,
}

impl ParsedExpense {
    fn from_text(text: &str, today: NaiveDate) -> Self {
        // Matched spans are blanked so later patterns cannot reuse them.
        let mut work = text.to_string();

        let date = match find_date(&work, today) {
            Some((date, span)) => {
                blank(&mut work, span);
                date
            }
            None => today,
        };

        let paid_by = find_payer(&work).map(|(name, span)| {
            blank(&mut work, span);
            name
        });

        let currency = re_currency()
            .find(&work)
            .and_then(|m| currency_code(m.as_str()));
        let spans: Vec<Range<usize>> = re_currency().find_iter(&work).map(|m| m.range()).collect();
        for span in spans {
            blank(&mut work, span);
        }

        let found = re_amount()
            .find(&work)
            .map(|m| (Amount::parse(m.as_str()).ok(), m.range()));
        let amount = found.and_then(|(amount, span)| {
            blank(&mut work, span);
            amount
        });

        Self { date, item: clean_item(&work), amount, currency, paid_by }
    }
}

fn blank(work: &mut String, span: Range<usize>) {
    let spaces = " ".repeat(span.len());
    work.replace_range(span, &spaces);
}

fn find_payer(text: &str) -> Option<(String, Range<usize>)> {
    if let Some(c) = re_paid_by().captures(text) {
        return Some((capitalize(c.get(1)?.as_str()), c.get(0)?.range()));
    }
    re_payer_first()
        .captures_iter(text)
        .filter_map(|c| Some((c.get(1)?, c.get(0)?)))
        .find(|(name, whole)| {
            !NOT_A_NAME.contains(&name.as_str().to_lowercase().as_str())
                && leaves_an_item(text, whole.range())
        })
        .map(|(name, whole)| (capitalize(name.as_str()), whole.range()))
}

/// In "Rent paid 500" the only noun is the purchase, not a payer.
fn leaves_an_item(text: &str, span: Range<usize>) -> bool {
    let mut rest = text.to_string();
    blank(&mut rest, span);
    let rest = re_currency().replace_all(&rest, " ");
    let rest = re_amount().replace_all(&rest, " ");
    clean_item(&rest) != PLACEHOLDER_ITEM
}

fn currency_code(token: &str) -> Option<&'static str> {
    let code = match token.to_lowercase().as_str() {
        "$" | "usd" | "dollar" | "dollars" | "bucks" => "USD",
        "€" | "eur" | "euro" | "euros" => "EUR",
        "£" | "gbp" | "pound" | "pounds" => "GBP",
        "₱" | "php" | "peso" | "pesos" => "PHP",
        "jpy" | "yen" => "JPY",
        _ => return None,
    };
    Some(code)
}

fn clean_item(residual: &str) -> String {
    let collapsed = residual.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| !c.is_alphanumeric());
    let trimmed = re_filler_lead().replace(trimmed, "");
    let trimmed = re_filler_trail().replace(&trimmed, "");
    let trimmed = trimmed.trim_matches(|c: char| !c.is_alphanumeric());

    if trimmed.is_empty() {
        PLACEHOLDER_ITEM.to_string()
    } else {
        capitalize(trimmed)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ── Date helpers ──────────────────────────────────────────────────────────────

fn find_date(text: &str, today: NaiveDate) -> Option<(NaiveDate, Range<usize>)> {
    try_date_month_name(text)
        .or_else(|| try_date_abbr_month(text))
        .or_else(|| try_date_iso(text))
        .or_else(|| try_date_slash(text))
        .or_else(|| try_relative_day(text, today))
}

fn try_date_month_name(text: &str) -> Option<(NaiveDate, Range<usize>)> {
    let c = re_date_month_name().captures(text)?;
    let month = month_to_num(&c.get(1)?.as_str()[..3])?;
    let day: u32 = c.get(2)?.as_str().parse().ok()?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    Some((NaiveDate::from_ymd_opt(year, month, day)?, c.get(0)?.range()))
}

fn try_date_abbr_month(text: &str) -> Option<(NaiveDate, Range<usize>)> {
    let c = re_date_abbr_month().captures(text)?;
    let day: u32 = c.get(1)?.as_str().parse().ok()?;
    let month = month_to_num(c.get(2)?.as_str())?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    Some((NaiveDate::from_ymd_opt(year, month, day)?, c.get(0)?.range()))
}

fn try_date_iso(text: &str) -> Option<(NaiveDate, Range<usize>)> {
    let c = re_date_iso().captures(text)?;
    let y: i32 = c.get(1)?.as_str().parse().ok()?;
    let m: u32 = c.get(2)?.as_str().parse().ok()?;
    let d: u32 = c.get(3)?.as_str().parse().ok()?;
    Some((NaiveDate::from_ymd_opt(y, m, d)?, c.get(0)?.range()))
}

fn try_date_slash(text: &str) -> Option<(NaiveDate, Range<usize>)> {
    let c = re_date_slash().captures(text)?;
    let month: u32 = c.get(1)?.as_str().parse().ok()?;
    let day: u32 = c.get(2)?.as_str().parse().ok()?;
    let year = expand_year(c.get(3)?.as_str().parse().ok()?);
    // Assume MM/DD/YYYY (US format)
    Some((NaiveDate::from_ymd_opt(year, month, day)?, c.get(0)?.range()))
}

fn try_relative_day(text: &str, today: NaiveDate) -> Option<(NaiveDate, Range<usize>)> {
    let m = re_relative_day().find(text)?;
    let date = if m.as_str().eq_ignore_ascii_case("yesterday") {
        today.pred_opt()?
    } else {
        today
    };
    Some((date, m.range()))
}

fn month_to_num(abbr: &str) -> Option<u32> {
    let n = match abbr.to_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(n)
}

fn expand_year(y: i32) -> i32 {
    if y < 100 {
        2000 + y
    } else {
        y
    }
}
