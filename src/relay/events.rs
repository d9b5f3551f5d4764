//! Relay events and per-destination results.

use serde::Serialize;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::types::{Album, ChatId, MessageId, SourceKey, SourceMessage};

/// An event from a source chat, handled by [`crate::relay::Relay`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    New(SourceMessage),
    AlbumComplete(Album),
    Edit(SourceMessage),
    Delete(SourceKey),
}

impl RelayEvent {
    /// Source chat whose lane orders this event.
    pub fn source_chat(&self) -> ChatId {
        match self {
            Self::New(msg) | Self::Edit(msg) => msg.chat,
            Self::AlbumComplete(album) => album.chat,
            Self::Delete(key) => key.chat(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::New(_) => EventKind::New,
            Self::AlbumComplete(_) => EventKind::AlbumComplete,
            Self::Edit(_) => EventKind::Edit,
            Self::Delete(_) => EventKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    New,
    AlbumComplete,
    Edit,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::AlbumComplete => "album_complete",
            Self::Edit => "edit",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Why a destination was intentionally left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Forwarded copies cannot be edited.
    Forwarded,
    /// The destination is no longer configured for this source.
    Unconfigured,
}

/// What happened for one destination.
#[derive(Debug, Clone)]
pub enum DeliveryStatus {
    /// Copies were created, in source order.
    Sent(Vec<MessageId>),
    /// A record already existed; nothing was sent.
    AlreadyDelivered,
    /// Album member held back for album completion.
    Deferred,
    /// Another worker won the album claim.
    ClaimLost,
    Edited,
    Skipped(SkipReason),
    Deleted,
    /// Indelible destination, copy kept.
    Kept,
    Failed(ChannelError),
}

impl DeliveryStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct DestinationOutcome {
    pub destination: ChatId,
    pub status: DeliveryStatus,
}

/// Result of handling one event: one outcome per destination touched.
#[derive(Debug, Clone)]
pub struct EventReport {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub source: SourceKey,
    pub outcomes: Vec<DestinationOutcome>,
}

impl EventReport {
    pub fn new(kind: EventKind, source: SourceKey) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            source,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, destination: ChatId, status: DeliveryStatus) {
        self.outcomes.push(DestinationOutcome {
            destination,
            status,
        });
    }

    /// Status for a destination, if the event touched it.
    pub fn outcome(&self, destination: ChatId) -> Option<&DeliveryStatus> {
        self.outcomes
            .iter()
            .find(|o| o.destination == destination)
            .map(|o| &o.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestinationOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    /// No destination failed.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}
