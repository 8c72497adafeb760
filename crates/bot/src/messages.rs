use spendbot_core::{ExpenseRecord, ExpenseSchema, Field, LedgerRow};

/// Reply to `/start`.
pub const START: &str = "👋 Welcome to the Expense Tracker Bot!

I help you track expenses using AI. Just send me:
📝 Text: \"Coffee 5.50 USD\"
📸 Receipt photos (with optional caption)
🎤 Voice notes: \"Paid 100 pesos for groceries\"

I'll automatically extract and log your expenses to Google Sheets!

Use /help to see more examples.";

pub const PROCESSING: &str = "⏳ Processing your expense...";

pub const ERROR_GENERIC: &str = "❌ Oops! Something went wrong. Please try again.";

pub const ERROR_INVALID_FILE: &str = "❌ Sorry, I couldn't process that file. Please try again.";

pub const ERROR_LEDGER_ACCESS: &str = "❌ Unable to access Google Sheets. Please contact admin.";

pub const NO_SUMMARY_DATA: &str = "📊 No expenses found in the sheet yet. Start logging!";

pub const EMPTY_TEXT: &str = "✏️ Send a short description like \"Coffee 5.50 USD\" to log an expense.";

/// Usage text, sent with Markdown formatting.
pub fn help(summary_limit: usize) -> String {
    format!(
        "📖 *How to Use the Expense Tracker Bot*

*Text Messages:*
• \"Lunch at restaurant 25.50 USD\"
• \"Paid by John: Gas 50 EUR\"
• \"Coffee 5 dollars\"

*Receipt Images:*
• Send photo of receipt
• Add caption: \"Paid by Sarah\"
• Or just send without caption (defaults to you)

*Voice Notes:*
• Record: \"Stefan paid 100 pesos for bananas\"
• Or: \"Bought fish for 75 PHP\"

*Commands:*
• /start - Show welcome message
• /help - Show this help text
• /summary - View last {summary_limit} expenses

*\"Paid By\" Logic:*
If you mention a name (e.g., \"Paid by John\"), I'll log it.
Otherwise, I'll log it under your name.

🤖 Powered by Google Gemini AI"
    )
}

/// Success confirmation. Missing fields show as `N/A`; a missing payer shows
/// the caller's identity.
pub fn confirmation(record: &ExpenseRecord, schema: &ExpenseSchema, default_paid_by: &str) -> String {
    let mut amount = record.display(Field::Amount, default_paid_by);
    if schema.contains(Field::Currency) {
        let currency = record.display(Field::Currency, default_paid_by);
        if !currency.is_empty() {
            amount = format!("{amount} {currency}");
        }
    }

    format!(
        "✅ *Expense Logged!*

📅 Date: {}
🛒 Item: {}
💰 Amount: {}
👤 Paid By: {}

Saved to Google Sheets! 📊",
        record.display(Field::Date, default_paid_by),
        record.display(Field::Item, default_paid_by),
        amount,
        record.display(Field::PaidBy, default_paid_by),
    )
}

/// Numbered list of recent rows, newest first:
/// `idx. item - amount [currency] - paid_by (date)`.
pub fn summary(rows: &[LedgerRow], schema: &ExpenseSchema, limit: usize) -> String {
    if rows.is_empty() {
        return NO_SUMMARY_DATA.to_string();
    }

    let mut message = format!("📊 *Recent Expenses (Last {limit})*\n\n");
    for (idx, row) in rows.iter().enumerate() {
        let mut amount = row.get(schema, Field::Amount).to_string();
        let currency = row.get(schema, Field::Currency);
        if !currency.is_empty() {
            amount = format!("{amount} {currency}");
        }
        message.push_str(&format!(
            "{}. {} - {} - {} ({})\n",
            idx + 1,
            row.get(schema, Field::Item),
            amount,
            row.get(schema, Field::PaidBy),
            row.get(schema, Field::Date),
        ));
    }
    message
}
