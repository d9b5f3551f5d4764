//! Shared types for source messages, albums and delivery keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat identifier on the messaging network (sources and destinations alike).
pub type ChatId = i64;

/// Message identifier, unique within one chat.
pub type MessageId = i64;

// ── Source keys ─────────────────────────────────────────────────────

/// Identity of a delivered unit: a single message or a whole album.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKey {
    Message { chat: ChatId, id: MessageId },
    Album { chat: ChatId, group: String },
}

impl SourceKey {
    pub fn message(chat: ChatId, id: MessageId) -> Self {
        Self::Message { chat, id }
    }

    pub fn album(chat: ChatId, group: impl Into<String>) -> Self {
        Self::Album {
            chat,
            group: group.into(),
        }
    }

    /// The source chat this key belongs to.
    pub fn chat(&self) -> ChatId {
        match self {
            Self::Message { chat, .. } | Self::Album { chat, .. } => *chat,
        }
    }

    pub fn is_album(&self) -> bool {
        matches!(self, Self::Album { .. })
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { chat, id } => write!(f, "{chat}:{id}"),
            Self::Album { chat, group } => write!(f, "{chat}:album:{group}"),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Animation,
}

impl MediaKind {
    /// Name used by the Bot API for this media type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Animation => "animation",
        }
    }
}

/// A media attachment, referenced by the network's file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub file_id: String,
}

/// A message observed in a source chat (new or edited revision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub chat: ChatId,
    pub id: MessageId,
    /// Text body, or the caption for media messages.
    pub text: String,
    pub media: Option<Media>,
    /// Album group this message belongs to, if any.
    pub media_group: Option<String>,
    pub date: DateTime<Utc>,
}

impl SourceMessage {
    /// A plain text message, mostly useful in tests and tools.
    pub fn text(chat: ChatId, id: MessageId, text: impl Into<String>) -> Self {
        Self {
            chat,
            id,
            text: text.into(),
            media: None,
            media_group: None,
            date: Utc::now(),
        }
    }

    pub fn with_media(mut self, kind: MediaKind, file_id: impl Into<String>) -> Self {
        self.media = Some(Media {
            kind,
            file_id: file_id.into(),
        });
        self
    }

    pub fn in_album(mut self, group: impl Into<String>) -> Self {
        self.media_group = Some(group.into());
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::message(self.chat, self.id)
    }

    /// Key of the album this message belongs to, if any.
    pub fn album_key(&self) -> Option<SourceKey> {
        self.media_group
            .as_ref()
            .map(|group| SourceKey::album(self.chat, group.clone()))
    }
}

// ── Albums ──────────────────────────────────────────────────────────

/// A multi-part message: members share one media group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub chat: ChatId,
    pub group: String,
    /// Members in send order.
    pub members: Vec<SourceMessage>,
    /// Set once the last expected member arrived or the quiet period elapsed.
    pub complete: bool,
}

impl Album {
    pub fn new(chat: ChatId, group: impl Into<String>) -> Self {
        Self {
            chat,
            group: group.into(),
            members: Vec::new(),
            complete: false,
        }
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::album(self.chat, self.group.clone())
    }

    pub fn member_ids(&self) -> Vec<MessageId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Text used for rule matching: the first non-empty caption.
    pub fn match_text(&self) -> &str {
        self.members
            .iter()
            .map(|m| m.text.as_str())
            .find(|t| !t.trim().is_empty())
            .unwrap_or("")
    }

    /// Insert a member, keeping id order and ignoring duplicates.
    pub fn push(&mut self, member: SourceMessage) {
        if self.members.iter().any(|m| m.id == member.id) {
            return;
        }
        let pos = self
            .members
            .iter()
            .position(|m| m.id > member.id)
            .unwrap_or(self.members.len());
        self.members.insert(pos, member);
    }
}
