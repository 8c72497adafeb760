use spendbot_extract::AttachmentRef;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

use crate::messages;
use crate::pipeline::{ExpensePipeline, Replier, Reply};
use crate::telegram::{Message, TelegramClient, TelegramReplier, User};

/// Caller identity used when the sender has no first name.
pub const DEFAULT_IDENTITY: &str = "Me";

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Summary,
}

impl Command {
    /// `/summary`, `/summary@my_bot` and `/summary extra` all parse.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "summary" => Some(Command::Summary),
            _ => None,
        }
    }
}

/// What an incoming message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command(Command),
    Text(String),
    Photo { attachment: AttachmentRef, caption: Option<String> },
    Voice { attachment: AttachmentRef },
    Ignored,
}

impl Request {
    pub fn classify(message: &Message) -> Self {
        if let Some(photo) = message.largest_photo() {
            return Request::Photo {
                attachment: AttachmentRef::new(photo.file_id.clone()),
                caption: message.caption.clone(),
            };
        }
        if let Some(voice) = &message.voice {
            return Request::Voice { attachment: AttachmentRef::new(voice.file_id.clone()) };
        }
        match message.text.as_deref() {
            Some(text) if text.starts_with('/') => Command::parse(text).map_or(Request::Ignored, Request::Command),
            Some(text) => Request::Text(text.to_string()),
            None => Request::Ignored,
        }
    }
}

pub fn caller_identity(user: Option<&User>) -> String {
    user.map(|u| u.first_name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_IDENTITY)
        .to_string()
}

/// Handle one message to completion. Outcomes are already logged and replied
/// to by the pipeline, so nothing is returned.
pub async fn handle_message(pipeline: &ExpensePipeline, replier: &dyn Replier, message: &Message) {
    let identity = caller_identity(message.from.as_ref());

    match Request::classify(message) {
        Request::Command(Command::Start) => {
            tracing::info!(user = %identity, "Started bot");
            send(replier, Reply::plain(messages::START)).await;
        }
        Request::Command(Command::Help) => {
            tracing::info!(user = %identity, "Requested help");
            send(replier, Reply::markdown(messages::help(pipeline.summary_limit()))).await;
        }
        Request::Command(Command::Summary) => {
            let _ = pipeline.summary(replier, &identity).await;
        }
        Request::Text(text) => {
            let _ = pipeline.on_text(replier, &identity, &text).await;
        }
        Request::Photo { attachment, caption } => {
            let _ = pipeline.on_photo(replier, &identity, &attachment, caption.as_deref()).await;
        }
        Request::Voice { attachment } => {
            let _ = pipeline.on_voice(replier, &identity, &attachment).await;
        }
        Request::Ignored => {
            tracing::debug!(message_id = message.message_id, "Ignoring unsupported message");
        }
    }
}

async fn send(replier: &dyn Replier, reply: Reply) {
    if let Err(e) = replier.send(&reply).await {
        tracing::warn!(error = %e, "Could not deliver reply");
    }
}

/// Message handlers still running. Shutdown waits for all of them.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<()>,
}

impl InFlight {
    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Collect handlers that already finished.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
        }
    }

    async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            tracing::info!(pending = self.tasks.len(), "Waiting for message handlers");
        }
        while let Some(result) = self.tasks.join_next().await {
            log_join(result);
        }
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Message handler panicked");
    }
}

/// Long-poll until `shutdown` resolves. Each update runs on its own task so a
/// slow extraction never holds up other chats. On shutdown the running
/// handlers finish and the last offset is acknowledged, so no update is lost
/// or delivered twice across restarts.
pub async fn run_polling<S>(
    client: Arc<TelegramClient>,
    pipeline: Arc<ExpensePipeline>,
    poll_timeout: Duration,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut offset = 0i64;
    let mut in_flight = InFlight::default();

    loop {
        in_flight.reap();

        let updates = tokio::select! {
            _ = &mut shutdown => break,
            result = client.get_updates(offset, poll_timeout) => result,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "Polling failed, retrying");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else { continue };

            let client = Arc::clone(&client);
            let pipeline = Arc::clone(&pipeline);
            in_flight.spawn(async move {
                let replier = TelegramReplier::new(client, message.chat.id);
                handle_message(&pipeline, &replier, &message).await;
            });
        }
    }

    tracing::info!("Shutdown requested, stopping polling");
    in_flight.drain().await;

    if offset > 0 {
        match client.get_updates(offset, Duration::ZERO).await {
            Ok(_) => tracing::debug!(offset, "Acknowledged processed updates"),
            Err(e) => tracing::warn!(error = %e, offset, "Could not acknowledge processed updates"),
        }
    }
}
