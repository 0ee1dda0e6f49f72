//! Chat Harvest: message retrieval for conversation summarization.
//!
//! Fetches a conversation's messages for a date range from Webex, Reddit or a
//! Telegram export, caches past days on disk, reconstructs threads and
//! downloads attachments under bounded concurrency.

pub mod attachments;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod model;
pub mod platforms;
pub mod retry;
pub mod service;
pub mod threads;
pub mod time;

pub use error::{Error, Result};
pub use fetch::{FetchReport, FetchRequest};
pub use model::{Attachment, ConversationRef, Message, Platform};
pub use service::{GetMessagesRequest, MessageService};
