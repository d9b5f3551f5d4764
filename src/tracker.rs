//! Delivery tracker: persistent source to copy mapping.
//!
//! Key layout in the store:
//! - `delivery/<source-key>/<destination>`: one [`DeliveryRecord`]
//! - `album-sent/<album-key>/<destination>`: copy-once claim
//! - `album-member/<chat>:<message>`: album group of a delivered member
//!
//! Records are written with put-if-absent and shrunk with compare-and-swap,
//! so no lock is ever held, and never across a network call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, TrackerError};
use crate::rules::model::DeliveryFlags;
use crate::store::Database;
use crate::types::{ChatId, MessageId, SourceKey};

const DELIVERY_PREFIX: &str = "delivery/";
const ALBUM_SENT_PREFIX: &str = "album-sent/";
const ALBUM_MEMBER_PREFIX: &str = "album-member/";

/// Attempts for a compare-and-swap update before giving up.
const CAS_ATTEMPTS: usize = 8;

/// One source message and the copy created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRef {
    pub source: MessageId,
    pub copy: MessageId,
}

/// Copies of one source message (or album) in one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub source: SourceKey,
    pub destination: ChatId,
    /// Copies in source order; a single entry for plain messages.
    pub copies: Vec<CopyRef>,
    pub created_at: DateTime<Utc>,
    /// Destination flags in effect when the copies were created.
    pub flags: DeliveryFlags,
}

impl DeliveryRecord {
    /// Copy of a given source message, if this record holds one.
    pub fn copy_for(&self, source: MessageId) -> Option<MessageId> {
        self.copies
            .iter()
            .find(|c| c.source == source)
            .map(|c| c.copy)
    }

    /// First copy, used for single-message records.
    pub fn primary_copy(&self) -> Option<MessageId> {
        self.copies.first().map(|c| c.copy)
    }
}

/// Result of removing one member copy from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyRemoval {
    /// The copy was removed and others remain.
    Shrunk,
    /// The copy was the last one; the whole record is gone.
    Removed,
    /// No record, or the record does not hold that copy.
    Missing,
}

/// Persistent delivery state, shared by all relay workers.
pub struct DeliveryTracker {
    db: Arc<dyn Database>,
    /// Expiry applied to every key written, when history retention is configured.
    retention: Option<Duration>,
}

impl DeliveryTracker {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            retention: None,
        }
    }

    /// Expire tracker keys after `retention` (enforced by the store).
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Record the copies created for `source` in `destination`.
    ///
    /// Fails with [`TrackerError::AlreadyRecorded`] if a record exists;
    /// callers treat that as success so retried sends stay idempotent.
    pub async fn record(
        &self,
        source: &SourceKey,
        destination: ChatId,
        copies: Vec<CopyRef>,
        flags: DeliveryFlags,
    ) -> Result<DeliveryRecord, TrackerError> {
        let record = DeliveryRecord {
            source: source.clone(),
            destination,
            copies,
            created_at: Utc::now(),
            flags,
        };
        let value = serde_json::to_vec(&record).map_err(DatabaseError::from)?;
        let key = delivery_key(source, destination);

        // The member index goes first: a record must never exist without it.
        if let SourceKey::Album { chat, group } = source {
            for copy in &record.copies {
                self.db
                    .set(
                        &member_key(*chat, copy.source),
                        group.as_bytes(),
                        self.retention,
                    )
                    .await?;
            }
        }

        if !self.db.put_if_absent(&key, &value, self.retention).await? {
            debug!(source = %source, destination, "Delivery already recorded");
            return Err(TrackerError::AlreadyRecorded {
                source_key: source.to_string(),
                destination,
            });
        }

        debug!(
            source = %source,
            destination,
            copies = record.copies.len(),
            "Delivery recorded"
        );
        Ok(record)
    }

    /// All known copies of a source message or album, across destinations.
    pub async fn lookup(&self, source: &SourceKey) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let prefix = format!("{DELIVERY_PREFIX}{source}/");
        let entries = self.db.scan_prefix(prefix.as_bytes()).await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_slice::<DeliveryRecord>(&entry.value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&entry.key),
                    error = %e,
                    "Skipping unreadable delivery record"
                ),
            }
        }
        Ok(records)
    }

    /// The record for one (source, destination) pair.
    pub async fn get(
        &self,
        source: &SourceKey,
        destination: ChatId,
    ) -> Result<Option<DeliveryRecord>, DatabaseError> {
        match self.db.get(&delivery_key(source, destination)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a record after its copies were deleted on the network.
    pub async fn remove(&self, source: &SourceKey, destination: ChatId) -> Result<bool, DatabaseError> {
        let removed = self.db.delete(&delivery_key(source, destination)).await?;
        if removed {
            debug!(source = %source, destination, "Delivery record removed");
            self.cleanup_album(source).await?;
        }
        Ok(removed)
    }

    /// Remove the copy of one album member from a group record.
    pub async fn remove_copy(
        &self,
        source: &SourceKey,
        destination: ChatId,
        member: MessageId,
    ) -> Result<CopyRemoval, DatabaseError> {
        let key = delivery_key(source, destination);

        for _ in 0..CAS_ATTEMPTS {
            let Some(raw) = self.db.get(&key).await? else {
                return Ok(CopyRemoval::Missing);
            };
            let mut record: DeliveryRecord = serde_json::from_slice(&raw)?;
            let before = record.copies.len();
            record.copies.retain(|c| c.source != member);
            if record.copies.len() == before {
                return Ok(CopyRemoval::Missing);
            }

            if record.copies.is_empty() {
                if self.db.delete_if(&key, &raw).await? {
                    self.cleanup_album(source).await?;
                    return Ok(CopyRemoval::Removed);
                }
            } else {
                let value = serde_json::to_vec(&record)?;
                if self.db.compare_and_swap(&key, &raw, &value).await? {
                    return Ok(CopyRemoval::Shrunk);
                }
            }
            debug!(source = %source, destination, "Record changed concurrently, retrying");
        }

        Err(DatabaseError::Query(format!(
            "remove_copy: record {source} -> {destination} kept changing"
        )))
    }

    /// Drop member index entries once no destination holds the album anymore.
    ///
    /// The copy-once claim is kept: a deleted album must not be sent again.
    async fn cleanup_album(&self, source: &SourceKey) -> Result<(), DatabaseError> {
        let SourceKey::Album { chat, group } = source else {
            return Ok(());
        };

        if !self.lookup(source).await?.is_empty() {
            return Ok(());
        }
        let prefix = format!("{ALBUM_MEMBER_PREFIX}{chat}:");
        for entry in self.db.scan_prefix(prefix.as_bytes()).await? {
            if entry.value == group.as_bytes() {
                self.db.delete(&entry.key).await?;
            }
        }
        Ok(())
    }

    /// Album that a delivered source message was sent as part of.
    pub async fn album_for_member(
        &self,
        chat: ChatId,
        member: MessageId,
    ) -> Result<Option<SourceKey>, DatabaseError> {
        Ok(self
            .db
            .get(&member_key(chat, member))
            .await?
            .map(|group| SourceKey::album(chat, String::from_utf8_lossy(&group).into_owned())))
    }

    // ── Copy-once claims ────────────────────────────────────────────

    /// Claim the right to send `album` to `destination`. First writer wins.
    pub async fn mark_album_sent(
        &self,
        album: &SourceKey,
        destination: ChatId,
    ) -> Result<bool, DatabaseError> {
        let claimed_at = Utc::now().to_rfc3339();
        let won = self
            .db
            .put_if_absent(
                &album_claim_key(album, destination),
                claimed_at.as_bytes(),
                self.retention,
            )
            .await?;
        debug!(album = %album, destination, won, "Album claim");
        Ok(won)
    }

    pub async fn is_album_sent(
        &self,
        album: &SourceKey,
        destination: ChatId,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .db
            .get(&album_claim_key(album, destination))
            .await?
            .is_some())
    }

    /// Give a claim back after the claiming send failed for good.
    pub async fn release_album_claim(
        &self,
        album: &SourceKey,
        destination: ChatId,
    ) -> Result<(), DatabaseError> {
        self.db.delete(&album_claim_key(album, destination)).await?;
        info!(album = %album, destination, "Album claim released");
        Ok(())
    }

    // ── History ─────────────────────────────────────────────────────

    /// Delete every record created before `cutoff`. Returns the count.
    pub async fn purge_history(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let entries = self.db.scan_prefix(DELIVERY_PREFIX.as_bytes()).await?;
        let mut purged = 0;

        for entry in entries {
            let record: DeliveryRecord = match serde_json::from_slice(&entry.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&entry.key),
                        error = %e,
                        "Purging unreadable delivery record"
                    );
                    self.db.delete(&entry.key).await?;
                    purged += 1;
                    continue;
                }
            };
            if record.created_at >= cutoff {
                continue;
            }
            if self.db.delete_if(&entry.key, &entry.value).await? {
                if record.source.is_album() {
                    self.db
                        .delete(&album_claim_key(&record.source, record.destination))
                        .await?;
                }
                self.cleanup_album(&record.source).await?;
                purged += 1;
            }
        }

        if purged > 0 {
            info!(count = purged, cutoff = %cutoff, "Purged delivery history");
        }
        Ok(purged)
    }
}

fn delivery_key(source: &SourceKey, destination: ChatId) -> Vec<u8> {
    format!("{DELIVERY_PREFIX}{source}/{destination}").into_bytes()
}

fn album_claim_key(album: &SourceKey, destination: ChatId) -> Vec<u8> {
    format!("{ALBUM_SENT_PREFIX}{album}/{destination}").into_bytes()
}

fn member_key(chat: ChatId, member: MessageId) -> Vec<u8> {
    format!("{ALBUM_MEMBER_PREFIX}{chat}:{member}").into_bytes()
}
