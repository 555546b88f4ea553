use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// An active query persisted so another process instance can reconstruct it
/// and recompute diffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredQuery {
    pub id: String,
    pub entity_key: String,
    pub definition: serde_json::Value,
}

/// Storage contract for active-query state in horizontally-scaled
/// deployments. The broker only consumes this interface; hosts supply a
/// durable implementation when they need one.
#[async_trait]
pub trait QueryStorage: Send + Sync {
    async fn save(&self, query: StoredQuery) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Invoke `apply` for every stored query over the given entity.
    async fn for_each_matching(
        &self,
        entity_key: &str,
        apply: &(dyn Fn(StoredQuery) + Send + Sync),
    ) -> Result<()>;

    /// Refresh liveness for the given query ids and return the subset this
    /// store does not know (expired or never seen). Clients resubscribe
    /// those from scratch.
    async fn keep_alive_and_return_unknown_ids(&self, ids: &[String]) -> Result<Vec<String>>;
}

struct StoredEntry {
    query: StoredQuery,
    last_keep_alive: Instant,
}

/// In-memory reference implementation with keep-alive based expiry.
#[derive(Clone)]
pub struct InMemoryQueryStorage {
    queries: Arc<RwLock<HashMap<String, StoredEntry>>>,
    expire_after: Duration,
}

impl InMemoryQueryStorage {
    pub fn new() -> Self {
        Self {
            queries: Arc::new(RwLock::new(HashMap::new())),
            expire_after: Duration::from_secs(300),
        }
    }

    pub fn with_expiry(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }
}

#[async_trait]
impl QueryStorage for InMemoryQueryStorage {
    async fn save(&self, query: StoredQuery) -> Result<()> {
        let mut queries = self.queries.write().await;
        debug!("storing query {} for entity {}", query.id, query.entity_key);
        queries.insert(
            query.id.clone(),
            StoredEntry {
                query,
                last_keep_alive: Instant::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.queries.write().await.remove(id);
        Ok(())
    }

    async fn for_each_matching(
        &self,
        entity_key: &str,
        apply: &(dyn Fn(StoredQuery) + Send + Sync),
    ) -> Result<()> {
        // Clone matches out so the callback never runs under the lock.
        let matches: Vec<StoredQuery> = {
            let queries = self.queries.read().await;
            queries
                .values()
                .filter(|entry| entry.query.entity_key == entity_key)
                .map(|entry| entry.query.clone())
                .collect()
        };
        for query in matches {
            apply(query);
        }
        Ok(())
    }

    async fn keep_alive_and_return_unknown_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut queries = self.queries.write().await;
        let now = Instant::now();
        queries.retain(|_, entry| now.duration_since(entry.last_keep_alive) < self.expire_after);

        let mut unknown = Vec::new();
        for id in ids {
            match queries.get_mut(id) {
                Some(entry) => entry.last_keep_alive = now,
                None => unknown.push(id.clone()),
            }
        }
        Ok(unknown)
    }
}

impl Default for InMemoryQueryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn query(id: &str, entity_key: &str) -> StoredQuery {
        StoredQuery {
            id: id.to_string(),
            entity_key: entity_key.to_string(),
            definition: json!({"orderBy": [{"field": "name"}]}),
        }
    }

    #[tokio::test]
    async fn test_keep_alive_reports_unknown_ids() {
        let storage = InMemoryQueryStorage::new();
        storage.save(query("q1", "orders")).await.unwrap();

        let unknown = storage
            .keep_alive_and_return_unknown_ids(&["q1".to_string(), "q2".to_string()])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["q2".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_queries_become_unknown() {
        let storage = InMemoryQueryStorage::new().with_expiry(Duration::from_millis(10));
        storage.save(query("q1", "orders")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let unknown = storage
            .keep_alive_and_return_unknown_ids(&["q1".to_string()])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["q1".to_string()]);
    }

    #[tokio::test]
    async fn test_for_each_matching_filters_by_entity() {
        let storage = InMemoryQueryStorage::new();
        storage.save(query("q1", "orders")).await.unwrap();
        storage.save(query("q2", "customers")).await.unwrap();

        let seen = Mutex::new(Vec::new());
        storage
            .for_each_matching("orders", &|q| seen.lock().unwrap().push(q.id))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["q1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let storage = InMemoryQueryStorage::new();
        storage.save(query("q1", "orders")).await.unwrap();
        storage.remove("q1").await.unwrap();
        storage.remove("q1").await.unwrap();

        let unknown = storage
            .keep_alive_and_return_unknown_ids(&["q1".to_string()])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["q1".to_string()]);
    }
}
