use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::db::{never_read_watermark, Database, Feed, FeedRefresh, NewFeed};
use crate::error::{FeedFailure, StoreError, SyncError};
use crate::favicon::FaviconResolver;
use crate::feed::{FeedFetcher, ParsedEntry};
use crate::outcome::{Outcome, SkipReason};
use crate::reconcile::{reconcile_entries, ReconcileStats};
use crate::transport::Transport;

#[derive(Debug)]
pub struct FeedSync {
    pub feed_id: i64,
    pub feed_url: String,
    pub result: Result<Outcome<ReconcileStats>, StoreError>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub synced: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: Vec<(i64, SkipReason)>,
    pub not_dispatched: usize,
}

/// Each feed synchronizes independently: it is fetched, then its entries are
/// reconciled inside a transaction of its own. A failure in one feed never
/// rolls back or cancels another.
pub struct Updater {
    db: Arc<Database>,
    fetcher: FeedFetcher,
    favicons: FaviconResolver,
    max_concurrent: usize,
    refreshing: AtomicBool,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Updater {
    pub fn new(db: Arc<Database>, transport: Transport, max_concurrent: usize) -> Self {
        Self {
            db,
            fetcher: FeedFetcher::new(transport.clone()),
            favicons: FaviconResolver::new(transport),
            max_concurrent: max_concurrent.max(1),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Unreachable or unparseable feeds are skipped. Storage failures are
    /// collected and returned together once every dispatched feed finished.
    /// A cycle requested while another is running does nothing.
    pub async fn run_sync_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, SyncError> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Sync cycle already in progress, skipping");
            return Ok(CycleReport::default());
        }
        let _guard = CycleGuard(&self.refreshing);

        self.do_sync_cycle(shutdown).await
    }

    async fn do_sync_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, SyncError> {
        let feeds = self.db.list_active_feeds().await?;
        let total = feeds.len();
        info!(feeds = total, concurrency = self.max_concurrent, "Starting sync cycle");

        let results: Vec<FeedSync> = stream::iter(feeds)
            .take_while(|_| future::ready(!*shutdown.borrow()))
            .map(|feed| self.sync_feed(feed))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut report = CycleReport {
            not_dispatched: total - results.len(),
            ..Default::default()
        };
        let mut failed = Vec::new();

        for sync in results {
            match sync.result {
                Ok(Outcome::Ok(stats)) => {
                    report.synced += 1;
                    report.created += stats.created;
                    report.updated += stats.updated;
                }
                Ok(Outcome::Skipped(reason)) => report.skipped.push((sync.feed_id, reason)),
                Err(error) => failed.push(FeedFailure {
                    feed_id: sync.feed_id,
                    feed_url: sync.feed_url,
                    error,
                }),
            }
        }

        if report.not_dispatched > 0 {
            info!(
                not_dispatched = report.not_dispatched,
                "Shutdown requested, remaining feeds left for next start"
            );
        }

        if !failed.is_empty() {
            return Err(SyncError::Cycle {
                attempted: total - report.not_dispatched,
                failed,
            });
        }

        info!(
            synced = report.synced,
            skipped = report.skipped.len(),
            created = report.created,
            updated = report.updated,
            "Sync cycle complete"
        );
        Ok(report)
    }

    async fn sync_feed(&self, feed: Feed) -> FeedSync {
        debug!(feed_id = feed.id, url = %feed.feed_url, "Fetching feed");

        let parsed = match self.fetcher.fetch(&feed.feed_url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    feed_id = feed.id,
                    url = %feed.feed_url,
                    error = %e,
                    "Failed to fetch feed, retrying next cycle"
                );
                return FeedSync {
                    feed_id: feed.id,
                    feed_url: feed.feed_url,
                    result: Ok(Outcome::Skipped(e.into())),
                };
            }
        };

        let result = self.save_entries(feed.id, &parsed.to_entries()).await;
        if let Err(e) = &result {
            error!(feed_id = feed.id, url = %feed.feed_url, error = %e, "Failed to save entries");
        }

        FeedSync {
            feed_id: feed.id,
            feed_url: feed.feed_url,
            result: result.map(Outcome::Ok),
        }
    }

    async fn save_entries(
        &self,
        feed_id: i64,
        entries: &[ParsedEntry],
    ) -> Result<ReconcileStats, StoreError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let stats = reconcile_entries(&mut tx, feed_id, entries, now).await?;
        tx.touch_feed(feed_id, now).await?;
        tx.commit().await?;

        debug!(feed_id, created = stats.created, updated = stats.updated, "Saved entries");
        Ok(stats)
    }

    pub async fn create_feed_from_url(
        &self,
        url: &str,
        category_id: Option<i64>,
    ) -> Result<i64, SyncError> {
        if self.db.get_feed_by_url(url).await?.is_some() {
            return Err(SyncError::AlreadySubscribed(url.to_string()));
        }

        let parsed = self.fetcher.fetch(url).await?;
        let metadata = parsed.to_metadata();

        let favicon = self
            .favicons
            .resolve_for(metadata.site_url.as_deref(), url)
            .await;
        if let Outcome::Skipped(reason) = &favicon {
            info!(url, %reason, "No favicon for new feed");
        }
        let favicon = favicon.ok();

        let now = Utc::now();
        let new_feed = NewFeed {
            feed_url: url.to_string(),
            feed_title: metadata.title,
            feed_subtitle: metadata.subtitle,
            site_url: metadata.site_url,
            site_favicon_url: favicon.as_ref().map(|f| f.url.clone()),
            site_favicon: favicon.map(|f| f.content),
            category_id,
            last_read_at: never_read_watermark(),
            created_at: now,
        };

        let mut tx = self.db.begin().await?;
        let feed_id = tx.create_feed(&new_feed).await?;
        let stats = reconcile_entries(&mut tx, feed_id, &parsed.to_entries(), now).await?;
        tx.commit().await?;

        info!(feed_id, url, entries = stats.created, "Created feed");
        Ok(feed_id)
    }

    /// A favicon that cannot be downloaded is kept as is.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<ReconcileStats, SyncError> {
        let feed = self
            .db
            .get_feed(feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(feed_id))?;

        let parsed = self.fetcher.fetch(&feed.feed_url).await?;
        let metadata = parsed.to_metadata();

        let favicon = match feed.site_favicon_url.as_deref() {
            Some(icon_url) => self.favicons.download(icon_url).await,
            None => {
                self.favicons
                    .resolve_for(metadata.site_url.as_deref(), &feed.feed_url)
                    .await
            }
        };
        if let Outcome::Skipped(reason) = &favicon {
            warn!(feed_id, %reason, "Cannot download favicon, keeping previous one");
        }
        let favicon = favicon.ok();

        let refresh = FeedRefresh {
            feed_title: metadata.title,
            feed_subtitle: metadata.subtitle,
            site_url: metadata.site_url,
            site_favicon_url: favicon.as_ref().map(|f| f.url.clone()),
            site_favicon: favicon.map(|f| f.content),
        };

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        tx.refresh_feed_metadata(feed_id, &refresh, now).await?;
        let stats = reconcile_entries(&mut tx, feed_id, &parsed.to_entries(), now).await?;
        tx.commit().await?;

        info!(feed_id, created = stats.created, updated = stats.updated, "Refreshed feed");
        Ok(stats)
    }

    pub async fn seed_subscriptions(&self, feeds: &[FeedConfig]) -> usize {
        let mut created = 0;
        for feed in feeds {
            match self.create_feed_from_url(&feed.url, feed.category_id).await {
                Ok(_) => created += 1,
                Err(SyncError::AlreadySubscribed(_)) => {
                    debug!(url = %feed.url, "Configured feed already subscribed");
                }
                Err(e) => warn!(url = %feed.url, error = %e, "Cannot subscribe configured feed"),
            }
        }
        created
    }
}

/// Ticks are spaced evenly from the start, so a long cycle shortens the idle
/// gap after it; ticks missed entirely are dropped. The first cycle starts
/// immediately.
pub async fn start_background_sync(
    updater: Arc<Updater>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                info!("Starting scheduled sync");
                if let Err(e) = updater.run_sync_cycle(&shutdown).await {
                    error!("Scheduled sync failed: {}", e);
                }
            }
        }
    }

    info!("Background sync stopped");
}
