#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_ingest::{
    FeedRegistry, FeedSource, FetchDocument, FetchError, ItemStore, NormalizedItem, PersistenceError, RawDocument,
    StoredItem,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const RSS_FEED: &str = include_str!("../support/rss_feed.xml");
pub const ATOM_FEED: &str = include_str!("../support/atom_feed.xml");

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// In-memory registry and item store with the same uniqueness rules as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    storage_down: AtomicBool,
    registry_down: AtomicBool,
}

#[derive(Default)]
struct MemoryState {
    feeds: Vec<FeedSource>,
    items: Vec<StoredItem>,
    rejected_feeds: HashSet<Uuid>,
}

impl MemoryStore {
    pub async fn add_feed(&self, url: &str) -> FeedSource {
        let feed = FeedSource {
            id: Uuid::new_v4(),
            url: url.to_string(),
            owner_id: Uuid::new_v4(),
            last_refreshed: None,
        };
        self.state.write().await.feeds.push(feed.clone());
        feed
    }

    pub async fn feed(&self, feed_id: Uuid) -> FeedSource {
        self.state
            .read()
            .await
            .feeds
            .iter()
            .find(|f| f.id == feed_id)
            .cloned()
            .expect("feed is registered")
    }

    pub async fn items(&self, feed_id: Uuid) -> Vec<StoredItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.item.feed_id == feed_id)
            .cloned()
            .collect()
    }

    /// Makes every insert for the feed fail with a constraint violation.
    pub async fn reject_inserts_for(&self, feed_id: Uuid) {
        self.state.write().await.rejected_feeds.insert(feed_id);
    }

    /// Item reads and writes fail as if the database were unreachable.
    pub fn set_storage_down(&self, down: bool) {
        self.storage_down.store(down, Ordering::SeqCst);
    }

    pub fn set_registry_down(&self, down: bool) {
        self.registry_down.store(down, Ordering::SeqCst);
    }

    fn check_storage(&self) -> Result<(), PersistenceError> {
        if self.storage_down.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedRegistry for MemoryStore {
    async fn list_feeds(&self) -> Result<Vec<FeedSource>, PersistenceError> {
        if self.registry_down.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("registry offline".to_string()));
        }
        Ok(self.state.read().await.feeds.clone())
    }

    async fn advance_watermark(&self, feed_id: Uuid, refreshed_at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let feed = state
            .feeds
            .iter_mut()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| PersistenceError::ConstraintViolation(format!("unknown feed {}", feed_id)))?;

        if feed.last_refreshed.map_or(true, |current| current < refreshed_at) {
            feed.last_refreshed = Some(refreshed_at);
        }
        Ok(())
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn existing_dedup_keys(&self, feed_id: Uuid) -> Result<HashSet<String>, PersistenceError> {
        self.check_storage()?;
        Ok(self
            .state
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.item.feed_id == feed_id)
            .map(|i| i.item.dedup_key.as_str().to_string())
            .collect())
    }

    async fn insert_items(&self, feed_id: Uuid, items: &[NormalizedItem]) -> Result<usize, PersistenceError> {
        self.check_storage()?;
        let mut state = self.state.write().await;

        if state.rejected_feeds.contains(&feed_id) {
            return Err(PersistenceError::ConstraintViolation(format!(
                "insert rejected for feed {}",
                feed_id
            )));
        }

        let mut keys: HashSet<String> = state
            .items
            .iter()
            .filter(|i| i.item.feed_id == feed_id)
            .map(|i| i.item.dedup_key.as_str().to_string())
            .collect();

        let mut inserted = 0;
        for item in items {
            if keys.insert(item.dedup_key.as_str().to_string()) {
                state.items.push(StoredItem::new(NormalizedItem {
                    feed_id,
                    ..item.clone()
                }));
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Body(String),
    Status(u16),
    Timeout,
    Refused,
    /// Never answers; the fetch stays in flight until its future is dropped.
    Stall,
}

/// Fetcher that answers from a per-URL script. The last reply for a URL repeats.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into_iter().collect());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Status(404)),
            None => Reply::Status(404),
        }
    }
}

#[async_trait]
impl FetchDocument for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let reply = self.next_reply(url);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Body(body) => Ok(RawDocument {
                url: url.to_string(),
                status: 200,
                content_length: body.len(),
                fetched_at: Utc::now(),
                body: body.into_bytes(),
            }),
            Reply::Status(status) => Err(FetchError::BadStatus {
                url: url.to_string(),
                status,
            }),
            Reply::Timeout => Err(FetchError::Timeout { url: url.to_string() }),
            Reply::Refused => Err(FetchError::ConnectionFailure {
                url: url.to_string(),
                message: "connection refused".to_string(),
            }),
            Reply::Stall => std::future::pending().await,
        }
    }
}
