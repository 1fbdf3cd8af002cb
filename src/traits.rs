use crate::error::{FetchError, PersistenceError};
use crate::types::{FeedSource, NormalizedItem, RawDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// Retrieves the raw document behind a feed URL.
#[async_trait]
pub trait FetchDocument: Send + Sync {
    /// Must not retry on its own; the caller owns retry policy.
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError>;
}

/// Source of feeds to refresh and sink for their watermarks.
#[async_trait]
pub trait FeedRegistry: Send + Sync {
    async fn list_feeds(&self) -> Result<Vec<FeedSource>, PersistenceError>;

    /// Records a successful refresh. Never moves the watermark backwards.
    async fn advance_watermark(&self, feed_id: Uuid, refreshed_at: DateTime<Utc>) -> Result<(), PersistenceError>;
}

/// Durable item storage with uniqueness on (feed id, dedup key).
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn existing_dedup_keys(&self, feed_id: Uuid) -> Result<HashSet<String>, PersistenceError>;

    /// Writes all items or none. Items whose key already exists for the feed are
    /// skipped silently; returns how many rows were actually inserted.
    async fn insert_items(&self, feed_id: Uuid, items: &[NormalizedItem]) -> Result<usize, PersistenceError>;
}
