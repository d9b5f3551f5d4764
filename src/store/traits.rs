//! `Database` trait: byte-keyed persistent store used by the relay.
//!
//! All conditional writes (`put_if_absent`, `compare_and_swap`) are single
//! atomic statements in the backend, so callers never need a process-wide
//! lock to keep delivery state consistent.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DatabaseError;

/// A stored key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Backend-agnostic key/value store with optional per-key expiry.
///
/// Expired keys behave as absent for every read and conditional write.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Read a value.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Write a value unconditionally.
    async fn set(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), DatabaseError>;

    /// Write a value only if the key is absent (or expired).
    /// Returns `true` if this call created the key.
    async fn put_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, DatabaseError>;

    /// Replace the value only if it currently equals `expected`.
    /// Returns `true` if the swap happened.
    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, DatabaseError>;

    /// Delete a key. Returns `true` if a row was removed.
    async fn delete(&self, key: &[u8]) -> Result<bool, DatabaseError>;

    /// Delete a key only if its value equals `expected`.
    async fn delete_if(&self, key: &[u8], expected: &[u8]) -> Result<bool, DatabaseError>;

    /// All live entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, DatabaseError>;

    /// Physically remove expired keys. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, DatabaseError>;
}
