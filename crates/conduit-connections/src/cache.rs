use conduit_query::TableInfo;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const SCHEMA_CACHE_TTL: Duration = Duration::from_millis(60_000);

#[derive(Default)]
struct Entries {
    tables: HashMap<String, (Vec<TableInfo>, Instant)>,
    /// Bumped by every invalidation
    generation: u64,
}

/// Per-connection table listings with a fixed time-to-live.
///
/// Callers read [`SchemaCache::generation`] before fetching and hand it back
/// to [`SchemaCache::put`]; a listing fetched across an invalidation is
/// dropped instead of stored.
pub struct SchemaCache {
    ttl: Duration,
    entries: RwLock<Entries>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(SCHEMA_CACHE_TTL)
    }
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Fresh entry only; anything older than the TTL counts as absent
    pub async fn get(&self, connection_id: &str) -> Option<Vec<TableInfo>> {
        let entries = self.entries.read().await;
        let (tables, stored_at) = entries.tables.get(connection_id)?;
        if stored_at.elapsed() < self.ttl {
            Some(tables.clone())
        } else {
            None
        }
    }

    pub async fn generation(&self) -> u64 {
        self.entries.read().await.generation
    }

    /// Store a listing fetched at `generation`. Returns false when an
    /// invalidation happened in between and the listing was discarded.
    pub async fn put(&self, connection_id: &str, tables: Vec<TableInfo>, generation: u64) -> bool {
        let mut entries = self.entries.write().await;
        if entries.generation != generation {
            return false;
        }
        let ttl = self.ttl;
        entries
            .tables
            .retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
        entries
            .tables
            .insert(connection_id.to_string(), (tables, Instant::now()));
        true
    }

    pub async fn invalidate(&self, connection_id: &str) {
        let mut entries = self.entries.write().await;
        entries.generation += 1;
        entries.tables.remove(connection_id);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.generation += 1;
        entries.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> TableInfo {
        TableInfo {
            name: name.to_string(),
            schema: None,
            columns: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = SchemaCache::default();
        cache.put("c1", vec![table("users")], 0).await;

        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert_eq!(cache.get("c1").await.unwrap()[0].name, "users");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("c1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let cache = SchemaCache::new(Duration::from_secs(10));
        cache.put("a", vec![table("x")], 0).await;
        cache.put("b", vec![table("y")], 0).await;

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());

        cache.clear().await;
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_listing_fetched_across_invalidation_is_dropped() {
        let cache = SchemaCache::default();
        let generation = cache.generation().await;

        // Invalidated while the caller was still fetching
        cache.invalidate("c1").await;
        assert!(!cache.put("c1", vec![table("stale")], generation).await);
        assert!(cache.get("c1").await.is_none());

        let generation = cache.generation().await;
        cache.clear().await;
        assert!(!cache.put("c1", vec![table("stale")], generation).await);

        let generation = cache.generation().await;
        assert!(cache.put("c1", vec![table("fresh")], generation).await);
        assert_eq!(cache.get("c1").await.unwrap()[0].name, "fresh");
    }
}
