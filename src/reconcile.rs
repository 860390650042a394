use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{Entry, NewEntry};
use crate::error::StoreError;
use crate::feed::ParsedEntry;

/// Entry persistence as seen by reconciliation.
#[async_trait]
pub trait EntryStore: Send {
    /// `Ok(None)` means no live entry with this link exists in the feed.
    async fn get_entry_by_link(
        &mut self,
        feed_id: i64,
        link: &str,
    ) -> Result<Option<Entry>, StoreError>;

    async fn create_entry(&mut self, entry: &NewEntry) -> Result<i64, StoreError>;

    async fn update_entry(&mut self, entry: &Entry) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
}

/// Creates or updates each parsed entry, keyed by `(feed_id, link)`, in the
/// order given.
///
/// Existing entries keep their identity, `created_at` and `read_at`; only
/// their content fields and `updated_at` change. The first storage error
/// aborts the run.
pub async fn reconcile_entries<S>(
    store: &mut S,
    feed_id: i64,
    entries: &[ParsedEntry],
    now: DateTime<Utc>,
) -> Result<ReconcileStats, StoreError>
where
    S: EntryStore + ?Sized,
{
    let mut stats = ReconcileStats::default();

    for parsed in entries {
        match store.get_entry_by_link(feed_id, &parsed.link).await? {
            None => {
                store
                    .create_entry(&NewEntry::from_parsed(feed_id, parsed, now))
                    .await?;
                stats.created += 1;
            }
            Some(existing) => {
                store.update_entry(&merge(existing, parsed, now)).await?;
                stats.updated += 1;
            }
        }
    }

    Ok(stats)
}

fn merge(mut existing: Entry, parsed: &ParsedEntry, now: DateTime<Utc>) -> Entry {
    existing.title = parsed.title.clone();
    existing.author = parsed.author.clone();
    existing.summary = parsed.summary.clone();
    existing.published_at = parsed.published_at;
    existing.updated_at = Some(now);
    existing
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// In-memory store that can be told to fail lookups for one link.
    #[derive(Default)]
    struct MemoryStore {
        entries: Vec<Entry>,
        fail_lookup_for: Option<String>,
        calls: Vec<String>,
    }

    impl MemoryStore {
        fn live_count(&self, feed_id: i64) -> usize {
            self.entries
                .iter()
                .filter(|e| e.feed_id == feed_id && e.deleted_at.is_none())
                .count()
        }
    }

    #[async_trait]
    impl EntryStore for MemoryStore {
        async fn get_entry_by_link(
            &mut self,
            feed_id: i64,
            link: &str,
        ) -> Result<Option<Entry>, StoreError> {
            self.calls.push(format!("get {}", link));
            if self.fail_lookup_for.as_deref() == Some(link) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(self
                .entries
                .iter()
                .find(|e| e.feed_id == feed_id && e.link == link && e.deleted_at.is_none())
                .cloned())
        }

        async fn create_entry(&mut self, entry: &NewEntry) -> Result<i64, StoreError> {
            self.calls.push(format!("create {}", entry.link));
            let id = self.entries.len() as i64 + 1;
            self.entries.push(Entry {
                id,
                feed_id: entry.feed_id,
                title: entry.title.clone(),
                author: entry.author.clone(),
                summary: entry.summary.clone(),
                link: entry.link.clone(),
                published_at: entry.published_at,
                read_at: None,
                created_at: entry.created_at,
                updated_at: None,
                deleted_at: None,
            });
            Ok(id)
        }

        async fn update_entry(&mut self, entry: &Entry) -> Result<(), StoreError> {
            self.calls.push(format!("update {}", entry.link));
            let slot = self
                .entries
                .iter_mut()
                .find(|e| e.id == entry.id)
                .ok_or(StoreError::EntryNotFound(entry.id))?;
            *slot = entry.clone();
            Ok(())
        }
    }

    fn parsed(link: &str, title: &str) -> ParsedEntry {
        ParsedEntry {
            title: title.to_string(),
            author: None,
            summary: Some(format!("{} body", title)),
            link: link.to_string(),
            published_at: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_first_run_creates_every_entry() {
        let mut store = MemoryStore::default();
        let entries = vec![parsed("https://ex.com/1", "one"), parsed("https://ex.com/2", "two")];

        let stats = reconcile_entries(&mut store, 1, &entries, t0()).await.unwrap();

        assert_eq!(stats, ReconcileStats { created: 2, updated: 0 });
        assert_eq!(store.live_count(1), 2);
        assert!(store.entries.iter().all(|e| e.created_at == t0()));
        assert!(store.entries.iter().all(|e| e.feed_id == 1));
    }

    #[tokio::test]
    async fn test_reconciling_twice_is_idempotent() {
        let mut store = MemoryStore::default();
        let entries = vec![parsed("https://ex.com/1", "one"), parsed("https://ex.com/2", "two")];

        reconcile_entries(&mut store, 1, &entries, t0()).await.unwrap();
        let stats = reconcile_entries(&mut store, 1, &entries, t1()).await.unwrap();

        assert_eq!(stats, ReconcileStats { created: 0, updated: 2 });
        assert_eq!(store.live_count(1), 2);
    }

    #[tokio::test]
    async fn test_update_preserves_creation_and_read_state() {
        let mut store = MemoryStore::default();
        reconcile_entries(&mut store, 1, &[parsed("https://ex.com/1", "old")], t0())
            .await
            .unwrap();

        let mut changed = parsed("https://ex.com/1", "new");
        changed.author = Some("Ann".to_string());
        changed.published_at = Some(t1());
        reconcile_entries(&mut store, 1, &[changed], t1()).await.unwrap();

        let entry = &store.entries[0];
        assert_eq!(entry.id, 1);
        assert_eq!(entry.title, "new");
        assert_eq!(entry.summary.as_deref(), Some("new body"));
        assert_eq!(entry.author.as_deref(), Some("Ann"));
        assert_eq!(entry.published_at, Some(t1()));
        assert_eq!(entry.created_at, t0());
        assert_eq!(entry.updated_at, Some(t1()));
        assert_eq!(entry.read_at, None);
    }

    #[tokio::test]
    async fn test_update_keeps_existing_read_marker() {
        let mut store = MemoryStore::default();
        reconcile_entries(&mut store, 1, &[parsed("https://ex.com/1", "old")], t0())
            .await
            .unwrap();
        store.entries[0].read_at = Some(t0());

        reconcile_entries(&mut store, 1, &[parsed("https://ex.com/1", "new")], t1())
            .await
            .unwrap();

        assert_eq!(store.entries[0].read_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_same_link_in_other_feed_is_separate() {
        let mut store = MemoryStore::default();
        let entries = vec![parsed("https://shared.example/a", "a")];

        reconcile_entries(&mut store, 1, &entries, t0()).await.unwrap();
        let stats = reconcile_entries(&mut store, 2, &entries, t0()).await.unwrap();

        assert_eq!(stats.created, 1);
        assert_eq!(store.live_count(1), 1);
        assert_eq!(store.live_count(2), 1);
    }

    #[tokio::test]
    async fn test_soft_deleted_entry_is_not_matched() {
        let mut store = MemoryStore::default();
        reconcile_entries(&mut store, 1, &[parsed("https://ex.com/1", "a")], t0())
            .await
            .unwrap();
        store.entries[0].deleted_at = Some(t0());

        let stats = reconcile_entries(&mut store, 1, &[parsed("https://ex.com/1", "a")], t1())
            .await
            .unwrap();

        assert_eq!(stats.created, 1);
        assert_eq!(store.live_count(1), 1);
    }

    #[tokio::test]
    async fn test_lookup_error_aborts_remaining_entries() {
        let mut store = MemoryStore {
            fail_lookup_for: Some("https://ex.com/2".to_string()),
            ..Default::default()
        };
        let entries = vec![
            parsed("https://ex.com/1", "one"),
            parsed("https://ex.com/2", "two"),
            parsed("https://ex.com/3", "three"),
        ];

        let result = reconcile_entries(&mut store, 1, &entries, t0()).await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(
            store.calls,
            vec!["get https://ex.com/1", "create https://ex.com/1", "get https://ex.com/2"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_links_in_one_batch_collapse() {
        let mut store = MemoryStore::default();
        let entries = vec![parsed("https://ex.com/1", "first"), parsed("https://ex.com/1", "second")];

        let stats = reconcile_entries(&mut store, 1, &entries, t0()).await.unwrap();

        assert_eq!(stats, ReconcileStats { created: 1, updated: 1 });
        assert_eq!(store.live_count(1), 1);
        assert_eq!(store.entries[0].title, "second");
    }
}
