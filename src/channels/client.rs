//! Messaging client abstraction consumed by the relay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::types::{ChatId, Media, MessageId};

/// Content to deliver to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outgoing {
    /// An independent message. For media, `text` is the caption.
    Copy { text: String, media: Option<Media> },
    /// A forward that keeps attribution to the original.
    Forward {
        from_chat: ChatId,
        message_id: MessageId,
    },
}

impl Outgoing {
    /// A plain text copy.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Copy {
            text: text.into(),
            media: None,
        }
    }

    pub fn forward(from_chat: ChatId, message_id: MessageId) -> Self {
        Self::Forward {
            from_chat,
            message_id,
        }
    }

    /// Rendered text of a copy; `None` for forwards.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Copy { text, .. } => Some(text),
            Self::Forward { .. } => None,
        }
    }
}

/// A network messaging client: send, edit and delete in destination chats.
///
/// Implementations classify failures into transient and permanent
/// [`ChannelError`] variants; the relay retries only transient ones.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Client name used in logs and errors.
    fn name(&self) -> &str;

    /// Deliver one message. Returns the id of the created copy.
    async fn send(&self, chat: ChatId, message: &Outgoing) -> Result<MessageId, ChannelError>;

    /// Deliver an album as one batch. Returns one copy id per item, in order.
    async fn send_album(
        &self,
        chat: ChatId,
        items: &[Outgoing],
    ) -> Result<Vec<MessageId>, ChannelError>;

    /// Replace the content of an existing copy.
    async fn edit(
        &self,
        chat: ChatId,
        copy: MessageId,
        message: &Outgoing,
    ) -> Result<(), ChannelError>;

    /// Delete an existing copy.
    async fn delete(&self, chat: ChatId, copy: MessageId) -> Result<(), ChannelError>;
}
