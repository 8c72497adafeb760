pub mod config;
pub mod dispatch;
pub mod messages;
pub mod pipeline;
pub mod telegram;

pub use config::{BackendKind, Config, ConfigError};
pub use dispatch::{caller_identity, handle_message, run_polling, Command, Request};
pub use pipeline::{ExpensePipeline, Inbound, PipelineError, Replier, Reply, ReplyFormat, Stage};
pub use telegram::{TelegramClient, TelegramReplier, TransportError};
