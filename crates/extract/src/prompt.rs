use chrono::{Local, NaiveDate};
use spendbot_core::{ExpenseSchema, Field};

/// Source of "today" for extraction requests.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Instruction payload for one extraction call, plus the context it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub instruction: String,
    pub user_text: Option<String>,
    pub today: NaiveDate,
    pub default_paid_by: String,
}

impl Prompt {
    /// Instruction followed by the user's own words, as sent to the model.
    pub fn full_text(&self) -> String {
        match &self.user_text {
            Some(text) => format!("{}\n\nUser input: {}", self.instruction, text),
            None => self.instruction.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    schema: ExpenseSchema,
}

impl PromptBuilder {
    pub fn new(schema: ExpenseSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &ExpenseSchema {
        &self.schema
    }

    pub fn build(&self, today: NaiveDate, default_paid_by: &str, text: Option<&str>) -> Prompt {
        let today_str = today.format("%Y-%m-%d").to_string();
        let mut rules = vec![
            format!(
                "**Date**: If a date is mentioned, use it in YYYY-MM-DD form. Otherwise, use today's date ({today_str})."
            ),
            "**Item**: Brief description of what was purchased (e.g., \"Coffee\", \"Groceries\", \"Gas\").".to_string(),
            "**Amount**: Numeric value only (e.g., 45.50, 100). Strip currency symbols and words.".to_string(),
        ];
        if self.schema.contains(Field::Currency) {
            rules.push(
                "**Currency**: ISO code or common abbreviation (e.g., \"USD\", \"PHP\", \"EUR\", \"Peso\").".to_string(),
            );
        }
        rules.push(format!(
            "**Paid By**:\n   \
             - If the input says \"Paid by [Name]\", \"Bought by [Name]\", \"[Name] paid\" or \"[Name] bought this\" \
             (in any capitalization), extract [Name]\n   \
             - If no name is mentioned, use \"{default_paid_by}\"\n   \
             - Common variations: \"Stefan paid\", \"paid by Tine\", \"John bought this\""
        ));

        let numbered: Vec<String> = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. {rule}", i + 1))
            .collect();

        let instruction = format!(
            "You are an expense tracking assistant. Extract structured expense data from the provided input (text, image, or audio).\n\
             \n\
             Current date: {today_str}\n\
             \n\
             Output MUST be valid JSON matching this exact schema:\n\
             {template}\n\
             \n\
             RULES:\n\
             {rules}\n\
             \n\
             For images:\n\
             - Read text from receipts (OCR)\n\
             - Extract total amount, date, items\n\
             - Consider both image content AND any caption text together\n\
             \n\
             For voice/audio:\n\
             - Transcribe the audio\n\
             - Extract expense details from the transcription\n\
             \n\
             Return ONLY the JSON object, no additional text or explanation.",
            template = self.schema.template(),
            rules = numbered.join("\n"),
        );

        Prompt {
            instruction,
            user_text: text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
            today,
            default_paid_by: default_paid_by.to_string(),
        }
    }
}
