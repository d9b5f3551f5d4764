//! Messaging network access: delivery client and source update polling.

pub mod client;
pub mod telegram;
pub mod updates;

pub use client::{MessagingClient, Outgoing};
pub use telegram::TelegramClient;
pub use updates::{SourceUpdate, TelegramUpdates, UpdateStream};
