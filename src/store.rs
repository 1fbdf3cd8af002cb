use crate::error::PersistenceError;
use crate::traits::{FeedRegistry, ItemStore};
use crate::types::{DedupKey, FeedSource, NormalizedItem, Published, StoredItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS feeds (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        url TEXT NOT NULL,
        refreshed TIMESTAMP WITH TIME ZONE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_items (
        id UUID PRIMARY KEY,
        feed_id UUID NOT NULL REFERENCES feeds (id) ON DELETE CASCADE,
        dedup_key TEXT NOT NULL,
        dedup_source TEXT NOT NULL,
        title TEXT,
        url TEXT,
        description TEXT,
        content TEXT,
        published_at TIMESTAMP WITH TIME ZONE,
        published_raw TEXT,
        read BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS feed_items_feed_id_dedup_key ON feed_items (feed_id, dedup_key)",
    "CREATE INDEX IF NOT EXISTS feed_items_unread ON feed_items (feed_id) WHERE read = FALSE",
];

/// Postgres-backed feed registry and item store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn setup_schema(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema is up to date");
        Ok(())
    }

    /// Unread items across a user's feeds, newest first.
    pub async fn unread_items(&self, user_id: Uuid, limit: i64) -> Result<Vec<StoredItem>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT fi.*
            FROM feed_items fi
            JOIN feeds f ON f.id = fi.feed_id
            WHERE fi.read = FALSE AND f.user_id = $1
            ORDER BY fi.published_at DESC NULLS LAST, fi.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_item_from_row).collect()
    }
}

fn stored_item_from_row(row: &PgRow) -> Result<StoredItem, PersistenceError> {
    let published_at: Option<DateTime<Utc>> = row.try_get("published_at")?;
    let published_raw: Option<String> = row.try_get("published_raw")?;
    let published = match (published_at, published_raw) {
        (Some(at), _) => Some(Published::At(at)),
        (None, Some(raw)) => Some(Published::Raw(raw)),
        (None, None) => None,
    };

    let dedup_source: String = row.try_get("dedup_source")?;

    Ok(StoredItem {
        id: row.try_get("id")?,
        item: NormalizedItem {
            feed_id: row.try_get("feed_id")?,
            title: row.try_get("title")?,
            link: row.try_get("url")?,
            description: row.try_get("description")?,
            content: row.try_get("content")?,
            published,
            dedup_key: DedupKey::from_parts(&dedup_source, row.try_get("dedup_key")?),
        },
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl FeedRegistry for PgStore {
    async fn list_feeds(&self) -> Result<Vec<FeedSource>, PersistenceError> {
        let rows = sqlx::query("SELECT id, user_id, url, refreshed FROM feeds ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        let mut feeds = Vec::with_capacity(rows.len());
        for row in rows {
            feeds.push(FeedSource {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                owner_id: row.try_get("user_id")?,
                last_refreshed: row.try_get("refreshed")?,
            });
        }

        Ok(feeds)
    }

    async fn advance_watermark(&self, feed_id: Uuid, refreshed_at: DateTime<Utc>) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET refreshed = $2
            WHERE id = $1 AND (refreshed IS NULL OR refreshed < $2)
            "#,
        )
        .bind(feed_id)
        .bind(refreshed_at)
        .execute(&self.pool)
        .await?;

        debug!("Advanced watermark of feed {} to {}", feed_id, refreshed_at);
        Ok(())
    }
}

#[async_trait]
impl ItemStore for PgStore {
    async fn existing_dedup_keys(&self, feed_id: Uuid) -> Result<HashSet<String>, PersistenceError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT dedup_key FROM feed_items WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(keys.into_iter().collect())
    }

    async fn insert_items(&self, feed_id: Uuid, items: &[NormalizedItem]) -> Result<usize, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut stored_count = 0;

        for item in items {
            let published_at = item.published.as_ref().and_then(Published::instant);
            let published_raw = item.published.as_ref().and_then(Published::raw);

            let result = sqlx::query(
                r#"
                INSERT INTO feed_items (
                    id, feed_id, dedup_key, dedup_source, title, url,
                    description, content, published_at, published_raw
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (feed_id, dedup_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(feed_id)
            .bind(item.dedup_key.as_str())
            .bind(item.dedup_key.source())
            .bind(item.title.as_deref())
            .bind(item.link.as_deref())
            .bind(item.description.as_deref())
            .bind(item.content.as_deref())
            .bind(published_at)
            .bind(published_raw)
            .execute(&mut *tx)
            .await?;

            stored_count += result.rows_affected() as usize;
        }

        tx.commit().await?;

        info!("Stored {} new items out of {} for feed {}", stored_count, items.len(), feed_id);
        Ok(stored_count)
    }
}
