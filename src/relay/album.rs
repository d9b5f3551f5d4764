//! Album collection: groups media members until the album goes quiet.
//!
//! The Bot API delivers album members as separate messages and never says
//! when the last one arrived. An album counts as complete once no new member
//! has arrived for the quiet period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};

use crate::relay::events::RelayEvent;
use crate::types::{Album, ChatId, SourceMessage};

struct PendingAlbum {
    album: Album,
    last_seen: Instant,
}

/// In-progress albums keyed by (chat, media group).
pub struct AlbumCollector {
    quiet: Duration,
    pending: RwLock<HashMap<(ChatId, String), PendingAlbum>>,
}

impl AlbumCollector {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Track a member. Messages outside an album are ignored.
    pub async fn push(&self, msg: &SourceMessage) {
        let Some(ref group) = msg.media_group else {
            return;
        };
        let mut pending = self.pending.write().await;
        let entry = pending
            .entry((msg.chat, group.clone()))
            .or_insert_with(|| PendingAlbum {
                album: Album::new(msg.chat, group.clone()),
                last_seen: Instant::now(),
            });
        entry.album.push(msg.clone());
        entry.last_seen = Instant::now();
    }

    /// Apply an edit to a member of an album still being collected.
    ///
    /// Returns `true` if the member was pending.
    pub async fn update(&self, msg: &SourceMessage) -> bool {
        let Some(ref group) = msg.media_group else {
            return false;
        };
        let mut pending = self.pending.write().await;
        let Some(entry) = pending.get_mut(&(msg.chat, group.clone())) else {
            return false;
        };
        match entry.album.members.iter_mut().find(|m| m.id == msg.id) {
            Some(member) => {
                *member = msg.clone();
                true
            }
            None => false,
        }
    }

    /// Remove and return albums that have been quiet long enough, marked complete.
    pub async fn take_quiet(&self) -> Vec<Album> {
        let mut pending = self.pending.write().await;
        let ready: Vec<(ChatId, String)> = pending
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() >= self.quiet)
            .map(|(key, _)| key.clone())
            .collect();

        let mut albums: Vec<Album> = ready
            .into_iter()
            .filter_map(|key| pending.remove(&key))
            .map(|p| {
                let mut album = p.album;
                album.complete = true;
                album
            })
            .collect();
        albums.sort_by_key(|a| (a.chat, a.members.first().map(|m| m.id)));
        albums
    }

    /// Remove and return every album regardless of age (used on shutdown).
    pub async fn drain(&self) -> Vec<Album> {
        self.pending
            .write()
            .await
            .drain()
            .map(|(_, p)| {
                let mut album = p.album;
                album.complete = true;
                album
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}

/// Spawn a background task that emits `AlbumComplete` for quiet albums.
///
/// Stops when the event receiver is dropped.
pub fn spawn_flush_task(
    collector: Arc<AlbumCollector>,
    tick: Duration,
    events: mpsc::Sender<RelayEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            for album in collector.take_quiet().await {
                tracing::debug!(
                    chat = album.chat,
                    group = %album.group,
                    members = album.members.len(),
                    "Album complete"
                );
                if events.send(RelayEvent::AlbumComplete(album)).await.is_err() {
                    return;
                }
            }
        }
    })
}
