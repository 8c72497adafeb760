use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::json;
use spendbot::messages;
use spendbot::{handle_message, ExpensePipeline, PipelineError, Replier, Reply, ReplyFormat, TransportError};
use spendbot_core::ExpenseSchema;
use spendbot_extract::{
    AttachmentRef, AttachmentSource, BackendError, ExtractionError, FetchedAttachment, FixedClock,
    GenerativeBackend, MediaFetchError, MediaNormalizer, RetryPolicy, RulesBackend, ScriptedBackend,
};
use spendbot_storage::{LedgerBackend, MemoryLedger};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test doubles ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingReplier {
    sent: Mutex<Vec<Reply>>,
    broken: bool,
}

impl RecordingReplier {
    fn broken() -> Self {
        Self { broken: true, ..Self::default() }
    }

    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|r| r.text.clone()).collect()
    }

    fn replies(&self) -> Vec<Reply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn send(&self, reply: &Reply) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(reply.clone());
        if self.broken {
            return Err(TransportError::Api { code: 403, description: "bot was blocked by the user".into() });
        }
        Ok(())
    }
}

/// Serves the same bytes for every attachment, or fails every download.
struct MemoryAttachments {
    result: Result<FetchedAttachment, String>,
    fetches: Mutex<Vec<String>>,
}

impl MemoryAttachments {
    fn serving(bytes: &[u8], remote_path: &str) -> Self {
        Self {
            result: Ok(FetchedAttachment { bytes: bytes.to_vec(), remote_path: Some(remote_path.to_string()) }),
            fetches: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        Self { result: Err("file is temporarily unavailable".into()), fetches: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl AttachmentSource for MemoryAttachments {
    async fn fetch(&self, attachment: &AttachmentRef) -> Result<FetchedAttachment, MediaFetchError> {
        self.fetches.lock().unwrap().push(attachment.file_id.clone());
        self.result.clone().map_err(MediaFetchError::Download)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 7).unwrap()
}

fn header() -> Vec<String> {
    ExpenseSchema::with_currency().headers()
}

fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

fn pipeline(
    backend: Arc<dyn GenerativeBackend>,
    ledger: Arc<dyn LedgerBackend>,
    attachments: Arc<dyn AttachmentSource>,
    staging: &Path,
) -> ExpensePipeline {
    ExpensePipeline::new(ExpenseSchema::with_currency(), backend, ledger, attachments)
        .with_clock(Arc::new(FixedClock(today())))
        .with_retry(RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO })
        .with_normalizer(MediaNormalizer::new(1024).with_staging_dir(staging.to_path_buf()))
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

// ── Text messages ────────────────────────────────────────────────────────────

#[tokio::test]
async fn named_payer_overrides_caller() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(Arc::new(RulesBackend), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::default();

    let record = p.on_text(&replier, "Me", "Paid by John: Gas 50").await.unwrap();

    assert_eq!(record.paid_by(), Some("John"));
    assert_eq!(record.item(), Some("Gas"));
    assert_eq!(record.amount().unwrap().as_decimal(), Decimal::from(50));
    assert_eq!(ledger.rows()[1], row(&["2026-02-07", "Gas", "50", "", "John"]));

    let replies = replier.replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0], Reply::plain(messages::PROCESSING));
    assert_eq!(replies[1].format, ReplyFormat::Markdown);
    assert!(replies[1].text.contains("👤 Paid By: John"));
}

#[tokio::test]
async fn caller_identity_is_the_default_payer() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(Arc::new(RulesBackend), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::default();

    let record = p.on_text(&replier, "Alice", "Coffee 5 dollars").await.unwrap();

    assert_eq!(record.paid_by(), Some("Alice"));
    assert_eq!(ledger.rows()[1], row(&["2026-02-07", "Coffee", "5", "USD", "Alice"]));
    assert!(replier.texts()[1].contains("💰 Amount: 5 USD"));
}

#[tokio::test]
async fn missing_payer_in_reply_is_filled_before_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::replying(
        json!({ "date": "2026-02-01", "item": "Bread", "amount": "3.20" }).to_string(),
    ));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend, ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());

    p.on_text(&RecordingReplier::default(), "Tine", "bread").await.unwrap();

    assert_eq!(ledger.rows()[1], row(&["2026-02-01", "Bread", "3.20", "", "Tine"]));
}

#[tokio::test]
async fn blank_text_gets_a_hint_and_no_backend_call() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::failing());
    let ledger = Arc::new(MemoryLedger::new("Expense_Tracker"));
    let p = pipeline(backend.clone(), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::default();

    let err = p.on_text(&replier, "Me", "   ").await.unwrap_err();

    assert!(matches!(err, PipelineError::Extraction(ExtractionError::EmptyInput)));
    assert_eq!(replier.texts(), vec![messages::EMPTY_TEXT.to_string()]);
    assert_eq!(backend.call_count(), 0);
    assert_eq!(ledger.append_count(), 0);
}

// ── Attachments ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn photo_and_caption_go_out_in_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::replying(
        json!({ "date": "2026-02-05", "item": "Groceries", "amount": 45.5, "currency": "EUR", "paid_by": "Sarah" })
            .to_string(),
    ));
    let attachments = Arc::new(MemoryAttachments::serving(b"\xff\xd8jpeg", "photos/file_1.jpg"));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), attachments.clone(), dir.path());
    let replier = RecordingReplier::default();

    p.on_photo(&replier, "Stefan", &AttachmentRef::new("large"), Some("Paid by Sarah")).await.unwrap();

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].mime, Some("image/jpeg"));
    assert!(calls[0].prompt_text.ends_with("User input: Paid by Sarah"));
    assert_eq!(*attachments.fetches.lock().unwrap(), vec!["large".to_string()]);
    assert_eq!(ledger.rows()[1], row(&["2026-02-05", "Groceries", "45.5", "EUR", "Sarah"]));
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn voice_note_is_sent_as_ogg_without_text() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::replying(
        json!({ "date": "2026-02-07", "item": "Bananas", "amount": 100, "currency": "PHP", "paid_by": "Stefan" })
            .to_string(),
    ));
    let attachments = Arc::new(MemoryAttachments::serving(b"OggS", "voice/file_3.oga"));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), attachments, dir.path());

    let record = p.on_voice(&RecordingReplier::default(), "Me", &AttachmentRef::new("v1")).await.unwrap();

    assert_eq!(record.item(), Some("Bananas"));
    let calls = backend.calls();
    assert_eq!(calls[0].mime, Some("audio/ogg"));
    assert!(!calls[0].prompt_text.contains("User input:"));
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn download_failure_is_an_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::replying("{}"));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::default();

    let err = p.on_photo(&replier, "Me", &AttachmentRef::new("gone"), None).await.unwrap_err();

    assert!(matches!(err, PipelineError::Media(MediaFetchError::Download(_))));
    assert_eq!(replier.texts(), vec![messages::PROCESSING.to_string(), messages::ERROR_INVALID_FILE.to_string()]);
    assert_eq!(backend.call_count(), 0);
    assert_eq!(ledger.append_count(), 0);
}

#[tokio::test]
async fn oversized_attachment_is_rejected_before_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::replying("{}"));
    let attachments = Arc::new(MemoryAttachments::serving(&[0u8; 2048], "photos/huge.jpg"));
    let p = pipeline(backend.clone(), Arc::new(MemoryLedger::new("Expense_Tracker")), attachments, dir.path());

    let err = p.on_photo(&RecordingReplier::default(), "Me", &AttachmentRef::new("huge"), None).await.unwrap_err();

    assert!(matches!(err, PipelineError::Media(MediaFetchError::TooLarge { size: 2048, limit: 1024 })));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn staged_media_is_removed_when_extraction_fails() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::failing());
    let attachments = Arc::new(MemoryAttachments::serving(b"OggS", "voice/file_9.oga"));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), attachments, dir.path());
    let replier = RecordingReplier::default();

    let err = p.on_voice(&replier, "Me", &AttachmentRef::new("v2")).await.unwrap_err();

    assert!(matches!(err, PipelineError::Extraction(ExtractionError::Backend { attempts: 3, .. })));
    assert_eq!(backend.call_count(), 3);
    assert_eq!(replier.texts()[1], messages::ERROR_GENERIC);
    assert_eq!(staged_files(dir.path()), 0);
    assert_eq!(ledger.append_count(), 0);
}

// ── Failure categories ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn exhausted_retries_back_off_then_report_generic_failure() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::Status { status: 503, body: "overloaded".into() }),
        Err(BackendError::Status { status: 503, body: "overloaded".into() }),
        Err(BackendError::Status { status: 503, body: "overloaded".into() }),
    ]));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path())
        .with_retry(RetryPolicy::default());
    let replier = RecordingReplier::default();

    let started = tokio::time::Instant::now();
    let err = p.on_text(&replier, "Me", "Coffee 5").await.unwrap_err();

    assert!(matches!(err, PipelineError::Extraction(ExtractionError::Backend { attempts: 3, .. })));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    let calls = backend.calls();
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
    assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(2));
    assert_eq!(replier.texts(), vec![messages::PROCESSING.to_string(), messages::ERROR_GENERIC.to_string()]);
    assert_eq!(ledger.append_count(), 0);
}

#[tokio::test]
async fn malformed_reply_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new(vec![Ok("Sure! Here is your expense".into()), Ok("{}".into())]));
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(backend.clone(), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::default();

    let err = p.on_text(&replier, "Me", "Coffee 5").await.unwrap_err();

    assert!(matches!(err, PipelineError::Extraction(ExtractionError::Malformed { .. })));
    assert_eq!(backend.call_count(), 1);
    assert_eq!(replier.texts()[1], messages::ERROR_GENERIC);
}

#[tokio::test]
async fn unreachable_ledger_gets_its_own_message() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(
        Arc::new(RulesBackend),
        Arc::new(MemoryLedger::denied("Expense_Tracker")),
        Arc::new(MemoryAttachments::unreachable()),
        dir.path(),
    );
    let replier = RecordingReplier::default();

    let err = p.on_text(&replier, "Me", "Coffee 5").await.unwrap_err();

    assert!(matches!(err, PipelineError::Ledger(_)));
    assert_eq!(replier.texts()[1], messages::ERROR_LEDGER_ACCESS);
}

#[tokio::test]
async fn broken_delivery_does_not_change_the_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(Arc::new(RulesBackend), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let replier = RecordingReplier::broken();

    assert!(p.on_text(&replier, "Me", "Tea 2").await.is_ok());
    assert_eq!(ledger.append_count(), 1);
    assert_eq!(replier.texts().len(), 2);
}

#[tokio::test]
async fn concurrent_messages_both_land() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(Arc::new(RulesBackend), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());
    let (a, b) = (RecordingReplier::default(), RecordingReplier::default());

    let (first, second) = tokio::join!(p.on_text(&a, "Alice", "Coffee 5"), p.on_text(&b, "Bob", "Taxi 12"));

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(ledger.rows().len(), 3);
}

// ── Summary and commands ─────────────────────────────────────────────────────

#[tokio::test]
async fn summary_lists_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows(
        "Expense_Tracker",
        vec![
            header(),
            row(&["2026-02-01", "Bread", "3.20", "", "Tine"]),
            row(&["2026-02-02", "Gas", "50", "EUR", "John"]),
            row(&["2026-02-03", "Coffee", "5", "USD", "Alice"]),
        ],
    ));
    let p = pipeline(Arc::new(RulesBackend), ledger, Arc::new(MemoryAttachments::unreachable()), dir.path())
        .with_summary_limit(2);
    let replier = RecordingReplier::default();

    let rows = p.summary(&replier, "Me").await.unwrap();

    assert_eq!(rows.len(), 2);
    let text = &replier.texts()[0];
    assert!(text.contains("1. Coffee - 5 USD - Alice (2026-02-03)"));
    assert!(text.contains("2. Gas - 50 EUR - John (2026-02-02)"));
    assert!(!text.contains("Bread"));
}

#[tokio::test]
async fn summary_distinguishes_empty_from_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let empty = pipeline(
        Arc::new(RulesBackend),
        Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()])),
        Arc::new(MemoryAttachments::unreachable()),
        dir.path(),
    );
    let replier = RecordingReplier::default();
    assert!(empty.summary(&replier, "Me").await.unwrap().is_empty());
    assert_eq!(replier.texts(), vec![messages::NO_SUMMARY_DATA.to_string()]);

    let denied = pipeline(
        Arc::new(RulesBackend),
        Arc::new(MemoryLedger::denied("Expense_Tracker")),
        Arc::new(MemoryAttachments::unreachable()),
        dir.path(),
    );
    let replier = RecordingReplier::default();
    assert!(denied.summary(&replier, "Me").await.is_err());
    assert_eq!(replier.texts(), vec![messages::ERROR_LEDGER_ACCESS.to_string()]);
}

#[tokio::test]
async fn telegram_messages_are_routed_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::with_rows("Expense_Tracker", vec![header()]));
    let p = pipeline(Arc::new(RulesBackend), ledger.clone(), Arc::new(MemoryAttachments::unreachable()), dir.path());

    let start = serde_json::from_value(json!({
        "message_id": 1, "chat": { "id": 5 }, "from": { "id": 8, "first_name": "Alice" }, "text": "/start"
    }))
    .unwrap();
    let replier = RecordingReplier::default();
    handle_message(&p, &replier, &start).await;
    assert_eq!(replier.texts(), vec![messages::START.to_string()]);

    let expense = serde_json::from_value(json!({
        "message_id": 2, "chat": { "id": 5 }, "from": { "id": 8, "first_name": "Alice" }, "text": "Coffee 5 dollars"
    }))
    .unwrap();
    let replier = RecordingReplier::default();
    handle_message(&p, &replier, &expense).await;
    assert_eq!(ledger.rows()[1][4], "Alice");

    let help = serde_json::from_value(json!({ "message_id": 3, "chat": { "id": 5 }, "text": "/help" })).unwrap();
    let replier = RecordingReplier::default();
    handle_message(&p, &replier, &help).await;
    assert_eq!(replier.replies()[0].format, ReplyFormat::Markdown);
    assert_eq!(ledger.append_count(), 1);
}
