use crate::config::IngestConfig;
use crate::dedup::filter_new;
use crate::error::{FailureKind, FetchError, IngestError, PersistenceError, Result};
use crate::parser::parse_document;
use crate::traits::{FeedRegistry, FetchDocument, ItemStore};
use crate::types::{BatchResult, FeedResult, FeedSource, RawDocument, Stage};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Drives fetch → parse → dedupe → persist → watermark for every registered feed.
///
/// Feeds are independent: a failure is recorded against the feed that caused it
/// and the rest of the batch carries on. The only exception is storage becoming
/// unreachable, which ends the batch.
pub struct Ingestor {
    registry: Arc<dyn FeedRegistry>,
    store: Arc<dyn ItemStore>,
    fetcher: Arc<dyn FetchDocument>,
    config: IngestConfig,
}

/// Last stage each feed of a batch entered, readable after its future is dropped.
#[derive(Default)]
struct StageBoard(Mutex<HashMap<Uuid, Stage>>);

impl StageBoard {
    fn record(&self, feed_id: Uuid, stage: Stage) {
        let mut stages = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stages.insert(feed_id, stage);
    }

    fn stage(&self, feed_id: Uuid) -> Option<Stage> {
        let stages = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stages.get(&feed_id).copied()
    }
}

struct FeedRun<'a> {
    feed_id: Uuid,
    stage: Stage,
    items_found: usize,
    items_added: usize,
    board: &'a StageBoard,
}

impl FeedRun<'_> {
    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.board.record(self.feed_id, stage);
    }
}

impl Ingestor {
    pub fn new(
        registry: Arc<dyn FeedRegistry>,
        store: Arc<dyn ItemStore>,
        fetcher: Arc<dyn FetchDocument>,
        config: IngestConfig,
    ) -> Self {
        Self {
            registry,
            store,
            fetcher,
            config,
        }
    }

    pub async fn refresh_all(&self) -> Result<BatchResult> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.refresh_all_with_shutdown(shutdown).await
    }

    /// Like [`refresh_all`](Self::refresh_all), but once `shutdown` reads `true`
    /// no further feeds are started. Feeds already running finish normally.
    pub async fn refresh_all_with_shutdown(&self, shutdown: watch::Receiver<bool>) -> Result<BatchResult> {
        let started_at = Utc::now();
        let feeds = self.registry.list_feeds().await?;
        let concurrency = self.config.max_concurrent_fetches.max(1);

        info!("Refreshing {} feeds ({} at a time)", feeds.len(), concurrency);

        let mut per_feed = BTreeMap::new();
        let mut aborted = false;
        let board = StageBoard::default();

        {
            let mut pipelines = stream::iter(feeds.iter())
                .map(|feed| self.run_feed(feed, &shutdown, &board))
                .buffer_unordered(concurrency);

            while let Some(result) = pipelines.next().await {
                let unavailable = result.failure_kind() == Some(FailureKind::Unavailable);
                per_feed.insert(result.feed_id, result);

                if unavailable {
                    error!("Storage unavailable, aborting remaining feeds");
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            let reason = IngestError::Persistence(PersistenceError::Unavailable(
                "batch aborted: storage unavailable".to_string(),
            ));
            // Feeds still in flight keep the stage they had reached; the rest never left pending.
            for feed in &feeds {
                per_feed.entry(feed.id).or_insert_with(|| {
                    let stage = board.stage(feed.id).unwrap_or(Stage::Pending);
                    FeedResult::failed(feed, started_at, stage, &reason)
                });
            }
        }

        let batch = BatchResult {
            started_at,
            finished_at: Utc::now(),
            aborted,
            per_feed,
        };

        info!(
            "Refresh finished: {}/{} feeds succeeded, {} new items",
            batch.succeeded(),
            feeds.len(),
            batch.items_added()
        );
        Ok(batch)
    }

    /// Runs one feed's pipeline to completion or failure; never errors itself.
    pub async fn refresh_feed(&self, feed: &FeedSource, shutdown: &watch::Receiver<bool>) -> FeedResult {
        self.run_feed(feed, shutdown, &StageBoard::default()).await
    }

    async fn run_feed(&self, feed: &FeedSource, shutdown: &watch::Receiver<bool>, board: &StageBoard) -> FeedResult {
        let started_at = Utc::now();

        if *shutdown.borrow() {
            debug!("Skipping feed {}: batch cancelled", feed.id);
            return FeedResult::failed(feed, started_at, Stage::Pending, &IngestError::Cancelled);
        }

        let span = info_span!("feed", feed_id = %feed.id, url = %feed.url);
        let mut run = FeedRun {
            feed_id: feed.id,
            stage: Stage::Pending,
            items_found: 0,
            items_added: 0,
            board,
        };

        match self.run_pipeline(feed, started_at, &mut run).instrument(span.clone()).await {
            Ok(()) => {
                span.in_scope(|| {
                    info!("Found {} items, stored {} new", run.items_found, run.items_added);
                });
                FeedResult::done(feed, started_at, run.items_found, run.items_added)
            }
            Err(e) => {
                span.in_scope(|| {
                    error!("Failed during {:?}: {}", run.stage, e);
                });
                FeedResult::failed(feed, started_at, run.stage, &e)
            }
        }
    }

    async fn run_pipeline(&self, feed: &FeedSource, started_at: DateTime<Utc>, run: &mut FeedRun<'_>) -> Result<()> {
        run.enter(Stage::Fetching);
        let document = self.fetch_with_retry(&feed.url).await?;

        run.enter(Stage::Parsing);
        let items = parse_document(feed.id, &document)?;
        drop(document);
        run.items_found = items.len();

        run.enter(Stage::Deduplicating);
        let existing = self.store.existing_dedup_keys(feed.id).await?;
        let fresh = filter_new(feed.id, items, &existing);

        run.enter(Stage::Persisting);
        if !fresh.is_empty() {
            run.items_added = self.store.insert_items(feed.id, &fresh).await?;
        }

        run.enter(Stage::WatermarkUpdate);
        self.registry.advance_watermark(feed.id, started_at).await?;

        run.enter(Stage::Done);
        Ok(())
    }

    async fn fetch_with_retry(&self, url: &str) -> std::result::Result<RawDocument, FetchError> {
        let delay = self.config.retry_delay;
        let mut backoff = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(url).await {
                Ok(document) => return Ok(document),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = backoff.next_backoff().unwrap_or(delay);
                    warn!("Attempt {} failed for {}: {}; retrying in {:?}", attempt, url, e, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
