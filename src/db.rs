use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::SqlitePoolOptions, FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction,
};

use crate::error::StoreError;
use crate::feed::ParsedEntry;
use crate::reconcile::EntryStore;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Feed {
    pub id: i64,
    pub feed_url: String,
    pub feed_title: String,
    pub feed_subtitle: Option<String>,
    pub site_url: Option<String>,
    pub site_favicon_url: Option<String>,
    pub site_favicon: Option<String>,
    pub category_id: Option<i64>,
    /// Entries created after this instant are shown as new
    pub last_read_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub feed_url: String,
    pub feed_title: String,
    pub feed_subtitle: Option<String>,
    pub site_url: Option<String>,
    pub site_favicon_url: Option<String>,
    pub site_favicon: Option<String>,
    pub category_id: Option<i64>,
    pub last_read_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Metadata fetched by a feed refresh. `None` site and favicon fields keep
/// the stored values.
#[derive(Debug, Clone)]
pub struct FeedRefresh {
    pub feed_title: String,
    pub feed_subtitle: Option<String>,
    pub site_url: Option<String>,
    pub site_favicon_url: Option<String>,
    pub site_favicon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub feed_id: i64,
    pub title: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewEntry {
    pub fn from_parsed(feed_id: i64, parsed: &ParsedEntry, now: DateTime<Utc>) -> Self {
        Self {
            feed_id,
            title: parsed.title.clone(),
            author: parsed.author.clone(),
            summary: parsed.summary.clone(),
            link: parsed.link.clone(),
            published_at: parsed.published_at,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: Entry,
    pub is_new: bool,
}

pub fn never_read_watermark() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 1, 1, 1)
        .single()
        .unwrap_or_default()
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        // SQLite allows a single writer; per-feed transactions queue here
        // while network work stays concurrent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                feed_url TEXT NOT NULL,
                feed_title TEXT NOT NULL,
                feed_subtitle TEXT,
                site_url TEXT,
                site_favicon_url TEXT,
                site_favicon TEXT,
                category_id INTEGER,
                last_read_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                deleted_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id),
                title TEXT NOT NULL,
                author TEXT,
                summary TEXT,
                link TEXT NOT NULL,
                published_at TEXT,
                read_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                deleted_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_feed_link
            ON entries(feed_id, link)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<FeedTransaction, StoreError> {
        Ok(FeedTransaction {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn list_active_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT * FROM feeds WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        get_feed(&mut conn, feed_id).await
    }

    pub async fn get_feed_by_url(&self, feed_url: &str) -> Result<Option<Feed>, StoreError> {
        let feed = sqlx::query_as::<_, Feed>(
            "SELECT * FROM feeds WHERE feed_url = ? AND deleted_at IS NULL ORDER BY id LIMIT 1",
        )
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn soft_delete_feed(&self, feed_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE feeds SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    pub async fn get_entry(&self, entry_id: i64) -> Result<Option<Entry>, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            "SELECT * FROM entries WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn count_live_entries(&self, feed_id: i64) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entries WHERE feed_id = ? AND deleted_at IS NULL",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Pages start at 1. Moves the feed's watermark to `now`.
    pub async fn list_entries_for_feed(
        &self,
        feed_id: i64,
        page: i64,
        per_page: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntryView>, StoreError> {
        let mut conn = self.pool.acquire().await?;

        let feed = get_feed(&mut conn, feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(feed_id))?;

        // A page this far out cannot hold rows, so nothing is shown or marked seen
        let offset = match page.max(1).checked_sub(1).and_then(|p| p.checked_mul(per_page)) {
            Some(offset) => offset,
            None => return Ok(Vec::new()),
        };
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT * FROM entries
            WHERE feed_id = ? AND deleted_at IS NULL
            ORDER BY published_at DESC NULLS LAST, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(feed_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;

        let views = entries
            .into_iter()
            .map(|entry| EntryView {
                is_new: entry.created_at > feed.last_read_at,
                entry,
            })
            .collect();

        sqlx::query("UPDATE feeds SET last_read_at = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&mut *conn)
            .await?;

        Ok(views)
    }

    pub async fn mark_entry_read(&self, entry_id: i64, now: DateTime<Utc>) -> Result<Entry, StoreError> {
        let mut entry = self
            .get_entry(entry_id)
            .await?
            .ok_or(StoreError::EntryNotFound(entry_id))?;

        if entry.read_at.is_none() {
            entry.read_at = Some(now);
            let mut conn = self.pool.acquire().await?;
            update_entry(&mut conn, &entry).await?;
        }

        Ok(entry)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct FeedTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl FeedTransaction {
    pub async fn create_feed(&mut self, feed: &NewFeed) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO feeds (feed_url, feed_title, feed_subtitle, site_url, site_favicon_url,
                               site_favicon, category_id, last_read_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&feed.feed_url)
        .bind(&feed.feed_title)
        .bind(&feed.feed_subtitle)
        .bind(&feed.site_url)
        .bind(&feed.site_favicon_url)
        .bind(&feed.site_favicon)
        .bind(feed.category_id)
        .bind(feed.last_read_at)
        .bind(feed.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Never touches the watermark, category or URL.
    pub async fn refresh_feed_metadata(
        &mut self,
        feed_id: i64,
        refresh: &FeedRefresh,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET feed_title = ?, feed_subtitle = ?,
                site_url = COALESCE(?, site_url),
                site_favicon_url = COALESCE(?, site_favicon_url),
                site_favicon = COALESCE(?, site_favicon),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&refresh.feed_title)
        .bind(&refresh.feed_subtitle)
        .bind(&refresh.site_url)
        .bind(&refresh.site_favicon_url)
        .bind(&refresh.site_favicon)
        .bind(now)
        .bind(feed_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    pub async fn touch_feed(&mut self, feed_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE feeds SET updated_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(feed_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EntryStore for FeedTransaction {
    async fn get_entry_by_link(
        &mut self,
        feed_id: i64,
        link: &str,
    ) -> Result<Option<Entry>, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            SELECT * FROM entries
            WHERE feed_id = ? AND link = ? AND deleted_at IS NULL
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(feed_id)
        .bind(link)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(entry)
    }

    async fn create_entry(&mut self, entry: &NewEntry) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO entries (feed_id, title, author, summary, link, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.feed_id)
        .bind(&entry.title)
        .bind(&entry.author)
        .bind(&entry.summary)
        .bind(&entry.link)
        .bind(entry.published_at)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_entry(&mut self, entry: &Entry) -> Result<(), StoreError> {
        update_entry(&mut self.tx, entry).await
    }
}

async fn get_feed(conn: &mut SqliteConnection, feed_id: i64) -> Result<Option<Feed>, StoreError> {
    let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ? AND deleted_at IS NULL")
        .bind(feed_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(feed)
}

async fn update_entry(conn: &mut SqliteConnection, entry: &Entry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE entries
        SET title = ?, author = ?, summary = ?, link = ?, published_at = ?, feed_id = ?,
            read_at = ?, created_at = ?, updated_at = ?, deleted_at = ?
        WHERE id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(&entry.title)
    .bind(&entry.author)
    .bind(&entry.summary)
    .bind(&entry.link)
    .bind(entry.published_at)
    .bind(entry.feed_id)
    .bind(entry.read_at)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .bind(entry.deleted_at)
    .bind(entry.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
