// src/cache.rs
use crate::schema::ParseSchema;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cache sitting in front of the storage adapter's schema reads.
///
/// Any conforming implementation (in-memory, remote, no-op) can be plugged in.
#[async_trait]
pub trait SchemaCache: Send + Sync {
    async fn get_all_classes(&self) -> Option<Vec<ParseSchema>>;

    async fn set_all_classes(&self, schemas: Vec<ParseSchema>);

    async fn get_one_schema(&self, class_name: &str) -> Option<ParseSchema>;

    async fn set_one_schema(&self, class_name: &str, schema: ParseSchema);

    async fn clear(&self);
}

/// Process-local schema cache with an optional time-to-live.
#[derive(Debug, Default)]
pub struct InMemorySchemaCache {
    ttl: Option<Duration>,
    all_classes: RwLock<Option<(Instant, Vec<ParseSchema>)>>,
    one_schemas: RwLock<HashMap<String, (Instant, ParseSchema)>>,
}

impl InMemorySchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        InMemorySchemaCache {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    fn is_fresh(&self, stored_at: Instant) -> bool {
        self.ttl.map_or(true, |ttl| stored_at.elapsed() < ttl)
    }
}

#[async_trait]
impl SchemaCache for InMemorySchemaCache {
    async fn get_all_classes(&self) -> Option<Vec<ParseSchema>> {
        let guard = self.all_classes.read();
        match guard.as_ref() {
            Some((stored_at, schemas)) if self.is_fresh(*stored_at) => Some(schemas.clone()),
            _ => None,
        }
    }

    async fn set_all_classes(&self, schemas: Vec<ParseSchema>) {
        *self.all_classes.write() = Some((Instant::now(), schemas));
    }

    async fn get_one_schema(&self, class_name: &str) -> Option<ParseSchema> {
        if let Some((stored_at, schema)) = self.one_schemas.read().get(class_name) {
            if self.is_fresh(*stored_at) {
                return Some(schema.clone());
            }
        }
        let guard = self.all_classes.read();
        match guard.as_ref() {
            Some((stored_at, schemas)) if self.is_fresh(*stored_at) => schemas
                .iter()
                .find(|schema| schema.class_name == class_name)
                .cloned(),
            _ => None,
        }
    }

    async fn set_one_schema(&self, class_name: &str, schema: ParseSchema) {
        self.one_schemas
            .write()
            .insert(class_name.to_string(), (Instant::now(), schema));
    }

    async fn clear(&self) {
        *self.all_classes.write() = None;
        self.one_schemas.write().clear();
    }
}

/// Never stores anything; every read falls through to the adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchemaCache;

#[async_trait]
impl SchemaCache for NoopSchemaCache {
    async fn get_all_classes(&self) -> Option<Vec<ParseSchema>> {
        None
    }

    async fn set_all_classes(&self, _schemas: Vec<ParseSchema>) {}

    async fn get_one_schema(&self, _class_name: &str) -> Option<ParseSchema> {
        None
    }

    async fn set_one_schema(&self, _class_name: &str, _schema: ParseSchema) {}

    async fn clear(&self) {}
}

/// A small string-keyed cache, used for session-token -> user and user -> role lookups.
#[derive(Debug)]
pub struct KeyValueCache<V> {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> KeyValueCache<V> {
    pub fn new(ttl: Option<Duration>) -> Self {
        KeyValueCache {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let guard = self.entries.read();
        let (stored_at, value) = guard.get(key)?;
        if self.ttl.is_some_and(|ttl| stored_at.elapsed() >= ttl) {
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.entries
            .write()
            .insert(key.into(), (Instant::now(), value));
    }

    pub fn del(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for KeyValueCache<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_schema_falls_back_to_all_classes() {
        let cache = InMemorySchemaCache::new();
        cache
            .set_all_classes(vec![ParseSchema::new("Post"), ParseSchema::new("Comment")])
            .await;
        assert_eq!(
            cache.get_one_schema("Comment").await.map(|s| s.class_name),
            Some("Comment".to_string())
        );
        cache.clear().await;
        assert!(cache.get_one_schema("Comment").await.is_none());
        assert!(cache.get_all_classes().await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let cache = InMemorySchemaCache::with_ttl(Duration::from_millis(0));
        cache.set_all_classes(vec![ParseSchema::new("Post")]).await;
        assert!(cache.get_all_classes().await.is_none());
    }

    #[tokio::test]
    async fn test_noop_cache_never_hits() {
        let cache = NoopSchemaCache;
        cache.set_all_classes(vec![ParseSchema::new("Post")]).await;
        cache.set_one_schema("Post", ParseSchema::new("Post")).await;
        assert!(cache.get_all_classes().await.is_none());
        assert!(cache.get_one_schema("Post").await.is_none());
    }

    #[test]
    fn test_key_value_cache() {
        let cache: KeyValueCache<Vec<String>> = KeyValueCache::default();
        cache.put("u1", vec!["role:Admin".to_string()]);
        assert_eq!(cache.get("u1"), Some(vec!["role:Admin".to_string()]));
        cache.del("u1");
        assert!(cache.get("u1").is_none());
        cache.put("u2", vec![]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
