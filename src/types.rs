use crate::error::{FailureKind, IngestError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A registered feed, as handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: Uuid,
    pub url: String,
    pub owner_id: Uuid,
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// Unparsed body of one fetch plus what the server told us about it.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub url: String,
    pub status: u16,
    pub content_length: usize,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// Publication time as best understood from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Published {
    At(DateTime<Utc>),
    /// Date text that matched none of the known formats.
    Raw(String),
}

impl Published {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Published::At(at) => Some(*at),
            Published::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            Published::At(_) => None,
            Published::Raw(raw) => Some(raw),
        }
    }
}

/// Identity used to decide whether an item has already been stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "value")]
pub enum DedupKey {
    Guid(String),
    Link(String),
    /// `sha256:<hex>` over the item's text fields, for items with neither guid nor link.
    ContentHash(String),
}

impl DedupKey {
    pub fn as_str(&self) -> &str {
        match self {
            DedupKey::Guid(key) | DedupKey::Link(key) | DedupKey::ContentHash(key) => key,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            DedupKey::Guid(_) => "guid",
            DedupKey::Link(_) => "link",
            DedupKey::ContentHash(_) => "content_hash",
        }
    }

    /// Rebuilds a key from its stored columns. Unknown sources are read as guids.
    pub fn from_parts(source: &str, value: String) -> Self {
        match source {
            "link" => DedupKey::Link(value),
            "content_hash" => DedupKey::ContentHash(value),
            _ => DedupKey::Guid(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub feed_id: Uuid,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub published: Option<Published>,
    pub dedup_key: DedupKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: Uuid,
    #[serde(flatten)]
    pub item: NormalizedItem,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredItem {
    pub fn new(item: NormalizedItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Pipeline position of one feed within a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Fetching,
    Parsing,
    Deduplicating,
    Persisting,
    WatermarkUpdate,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FeedStatus {
    Done,
    Failed { stage: Stage, kind: FailureKind },
    /// The batch was cancelled before this feed started.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResult {
    pub feed_id: Uuid,
    pub url: String,
    #[serde(flatten)]
    pub status: FeedStatus,
    pub items_found: usize,
    pub items_added: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl FeedResult {
    pub fn done(feed: &FeedSource, started_at: DateTime<Utc>, items_found: usize, items_added: usize) -> Self {
        Self {
            feed_id: feed.id,
            url: feed.url.clone(),
            status: FeedStatus::Done,
            items_found,
            items_added,
            error: None,
            started_at,
        }
    }

    pub fn failed(feed: &FeedSource, started_at: DateTime<Utc>, stage: Stage, error: &IngestError) -> Self {
        let status = match error.kind() {
            Some(kind) => FeedStatus::Failed { stage, kind },
            None => FeedStatus::Cancelled,
        };

        Self {
            feed_id: feed.id,
            url: feed.url.clone(),
            status,
            items_found: 0,
            items_added: 0,
            error: Some(error.to_string()),
            started_at,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == FeedStatus::Done
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.status {
            FeedStatus::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when storage became unavailable and the batch stopped early.
    pub aborted: bool,
    pub per_feed: BTreeMap<Uuid, FeedResult>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.per_feed.values().filter(|r| r.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.per_feed.values().filter(|r| r.failure_kind().is_some()).count()
    }

    pub fn items_added(&self) -> usize {
        self.per_feed.values().map(|r| r.items_added).sum()
    }

    pub fn get(&self, feed_id: &Uuid) -> Option<&FeedResult> {
        self.per_feed.get(feed_id)
    }
}
