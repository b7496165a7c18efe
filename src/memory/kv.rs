//! Generic key-value adapter.
//!
//! Any store implementing [`KvStore`] becomes a [`MemoryBackend`]. Records
//! live under namespaced, colon-separated keys:
//!
//! - `{ns}:fact:{user_id}:{category}:{key}`
//! - `{ns}:episode:{user_id}:{episode_id}`
//! - `{ns}:affinity:{user_id}:{personality_name}`
//!
//! Key components are percent-escaped so a prefix scan on `{ns}:fact:{user}:`
//! can never match another user's records.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::codec::{ArrayOptions, decode_record};
use crate::config::{BackendKind, OptimizationConfig};
use crate::error::{MemoryError, Result};
use crate::memory::backend::{MemoryBackend, affinity_wire};
use crate::memory::types::{Affinity, Episode, Fact, FactCategory};

/// Upper bound on compare-and-swap retries for one affinity update.
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// What a store reported about itself at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvProbe {
    /// Prefix scans are served from an ordered index rather than a full
    /// keyspace walk.
    pub ordered_scan: bool,
}

/// Minimal key-value surface the adapter needs.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Check the store is reachable and describe its scan capability.
    async fn probe(&self) -> Result<KvProbe>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// True iff the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in no particular order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Atomically set `key` to `new` iff its current value equals
    /// `expected` (`None` meaning absent). True iff the swap happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: Bytes)
    -> Result<bool>;
}

/// Escape `%` and `:` so components cannot forge key boundaries.
pub(crate) fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
    out
}

/// [`MemoryBackend`] over any [`KvStore`].
pub struct KvBackend<S> {
    store: S,
    namespace: String,
    optimization: OptimizationConfig,
}

impl<S: KvStore> KvBackend<S> {
    /// Probe the store once and keep the result for the backend's lifetime.
    pub async fn new(
        store: S,
        namespace: &str,
        optimization: OptimizationConfig,
    ) -> Result<Self> {
        let probe = store.probe().await?;
        if !probe.ordered_scan {
            warn!(
                backend = %store.kind(),
                namespace,
                "store has no ordered key index; reads fall back to scan-and-filter (degraded performance)"
            );
        }
        Ok(Self {
            store,
            namespace: namespace.to_owned(),
            optimization,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn fact_prefix(&self, user_id: &str, category: Option<FactCategory>) -> String {
        let mut prefix = format!("{}:fact:{}:", self.namespace, escape_component(user_id));
        if let Some(category) = category {
            prefix.push_str(category.as_str());
            prefix.push(':');
        }
        prefix
    }

    fn fact_key(&self, user_id: &str, category: FactCategory, key: &str) -> String {
        format!(
            "{}{}",
            self.fact_prefix(user_id, Some(category)),
            escape_component(key)
        )
    }

    fn episode_prefix(&self, user_id: Option<&str>) -> String {
        match user_id {
            Some(user) => format!("{}:episode:{}:", self.namespace, escape_component(user)),
            None => format!("{}:episode:", self.namespace),
        }
    }

    fn affinity_key(&self, user_id: &str, personality_name: &str) -> String {
        format!(
            "{}:affinity:{}:{}",
            self.namespace,
            escape_component(user_id),
            escape_component(personality_name)
        )
    }

    fn decode_options(&self) -> ArrayOptions {
        ArrayOptions {
            preserve_nulls: self.optimization.preserve_nulls,
        }
    }

    /// Prefix scan, sorted by key so results are deterministic.
    async fn scan_sorted(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut entries = self.store.scan_prefix(prefix).await?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(key, value)| Ok((key.clone(), utf8(&key, value)?)))
            .collect()
    }
}

fn utf8(key: &str, value: Bytes) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|e| MemoryError::Backend(format!("value at `{key}` is not UTF-8: {e}")))
}

fn decode_episode(payload: &str, options: ArrayOptions) -> Result<Episode> {
    let record = decode_record(payload, options)?;
    Ok(Episode::from_record(&record)?)
}

fn decode_affinity(payload: &[u8], options: ArrayOptions) -> Result<Affinity> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| MemoryError::Backend(format!("affinity value is not UTF-8: {e}")))?;
    let record = decode_record(text, options)?;
    Ok(Affinity::from_record(&record)?)
}

#[async_trait]
impl<S: KvStore> MemoryBackend for KvBackend<S> {
    fn kind(&self) -> BackendKind {
        self.store.kind()
    }

    async fn put_fact(&self, fact: &Fact, payload: String) -> Result<()> {
        let key = self.fact_key(&fact.user_id, fact.category, &fact.key);
        self.store.put(&key, Bytes::from(payload)).await
    }

    async fn list_facts(
        &self,
        user_id: &str,
        category: Option<FactCategory>,
    ) -> Result<Vec<String>> {
        let prefix = self.fact_prefix(user_id, category);
        Ok(self
            .scan_sorted(&prefix)
            .await?
            .into_iter()
            .map(|(_, payload)| payload)
            .collect())
    }

    async fn remove_fact(&self, user_id: &str, category: FactCategory, key: &str) -> Result<bool> {
        self.store
            .delete(&self.fact_key(user_id, category, key))
            .await
    }

    async fn put_episode(&self, episode: &Episode, payload: String) -> Result<()> {
        let key = format!(
            "{}{}",
            self.episode_prefix(Some(&episode.user_id)),
            escape_component(&episode.id)
        );
        self.store.put(&key, Bytes::from(payload)).await
    }

    async fn list_episodes(
        &self,
        user_id: &str,
        min_importance: Option<f64>,
    ) -> Result<Vec<String>> {
        let options = self.decode_options();
        let mut matching = Vec::new();
        for (_, payload) in self.scan_sorted(&self.episode_prefix(Some(user_id))).await? {
            let keep = match min_importance {
                Some(min) => decode_episode(&payload, options)?.importance >= min,
                None => true,
            };
            if keep {
                matching.push(payload);
            }
        }
        Ok(matching)
    }

    async fn delete_episodes_before(
        &self,
        user_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let options = self.decode_options();
        let mut removed = 0;
        for (key, payload) in self.scan_sorted(&self.episode_prefix(user_id)).await? {
            if decode_episode(&payload, options)?.timestamp < cutoff
                && self.store.delete(&key).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn add_affinity_points(
        &self,
        user_id: &str,
        personality_name: &str,
        delta: i64,
        interaction_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Affinity> {
        let key = self.affinity_key(user_id, personality_name);
        let options = self.decode_options();
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let previous = current
                .as_deref()
                .map(|payload| decode_affinity(payload, options))
                .transpose()?;
            let next = Affinity::accumulate(
                previous.as_ref(),
                user_id,
                personality_name,
                delta,
                interaction_type,
                at,
            );
            let wire = Bytes::from(affinity_wire(&next, &self.optimization));
            if self
                .store
                .compare_and_swap(&key, current.as_deref(), wire)
                .await?
            {
                return Ok(next);
            }
            debug!(key = %key, attempt, "affinity compare-and-swap lost a race; retrying");
            tokio::task::yield_now().await;
        }
        warn!(key = %key, attempts = MAX_CAS_ATTEMPTS, "affinity update gave up under contention");
        Err(MemoryError::Backend(format!(
            "affinity update for `{key}` lost {MAX_CAS_ATTEMPTS} compare-and-swap races"
        )))
    }

    async fn get_affinity(
        &self,
        user_id: &str,
        personality_name: &str,
    ) -> Result<Option<Affinity>> {
        self.store
            .get(&self.affinity_key(user_id, personality_name))
            .await?
            .as_deref()
            .map(|payload| decode_affinity(payload, self.decode_options()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::memory_kv::MemoryKv;
    use crate::memory::types::{EpisodeParams, EpisodeType, FactParams, now, parse_timestamp};

    async fn backend() -> KvBackend<MemoryKv> {
        KvBackend::new(MemoryKv::new(), "test", OptimizationConfig::default())
            .await
            .expect("backend")
    }

    #[test]
    fn escaping_keeps_separators_out_of_components() {
        assert_eq!(escape_component("plain"), "plain");
        assert_eq!(escape_component("a:b"), "a%3Ab");
        assert_eq!(escape_component("50%:"), "50%25%3A");
    }

    #[tokio::test]
    async fn users_with_colons_do_not_collide() {
        let backend = backend().await;
        let tricky = FactParams::new("u1:preferences", FactCategory::Work, "k", 1, 0.5)
            .into_fact(now())
            .expect("fact");
        backend.put_fact(&tricky, "tricky".into()).await.expect("put");
        assert!(backend.list_facts("u1", None).await.expect("list").is_empty());
        assert_eq!(
            backend.list_facts("u1:preferences", None).await.expect("list"),
            vec!["tricky".to_owned()]
        );
    }

    #[tokio::test]
    async fn category_filter_uses_prefix() {
        let backend = backend().await;
        for (category, key) in [
            (FactCategory::Work, "employer"),
            (FactCategory::Hobbies, "sport"),
        ] {
            let fact = FactParams::new("u1", category, key, "x", 0.5)
                .into_fact(now())
                .expect("fact");
            backend.put_fact(&fact, key.into()).await.expect("put");
        }
        assert_eq!(
            backend
                .list_facts("u1", Some(FactCategory::Hobbies))
                .await
                .expect("list"),
            vec!["sport".to_owned()]
        );
        assert_eq!(backend.list_facts("u1", None).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn episode_filtering_decodes_payloads() {
        let backend = backend().await;
        let episode = EpisodeParams::new("u1", EpisodeType::Milestone, "t", "s", 7.0, "positive")
            .into_episode(parse_timestamp("2025-06-01T00:00:00Z").expect("ts"))
            .expect("episode");
        let wire = crate::codec::encode_compact_object(&episode.to_record());
        backend.put_episode(&episode, wire.clone()).await.expect("put");

        assert_eq!(
            backend.list_episodes("u1", Some(7.0)).await.expect("list"),
            vec![wire]
        );
        assert!(
            backend
                .list_episodes("u1", Some(7.5))
                .await
                .expect("list")
                .is_empty()
        );

        let cutoff = parse_timestamp("2026-01-01T00:00:00Z").expect("ts");
        assert_eq!(
            backend.delete_episodes_before(None, cutoff).await.expect("cleanup"),
            1
        );
    }

    #[tokio::test]
    async fn reads_use_the_configured_array_options() {
        let preserving = KvBackend::new(
            MemoryKv::new(),
            "test",
            OptimizationConfig {
                preserve_nulls: true,
                ..OptimizationConfig::default()
            },
        )
        .await
        .expect("backend");
        assert!(preserving.decode_options().preserve_nulls);
        assert!(!backend().await.decode_options().preserve_nulls);

        let episode = EpisodeParams::new("u1", EpisodeType::Routine, "t", "s", 4.0, "neutral")
            .into_episode(now())
            .expect("episode");
        let wire = crate::codec::encode_compact_object(&episode.to_record());
        preserving.put_episode(&episode, wire.clone()).await.expect("put");
        assert_eq!(
            preserving.list_episodes("u1", Some(4.0)).await.expect("list"),
            vec![wire]
        );
    }

    #[tokio::test]
    async fn corrupt_episode_payload_is_an_error_not_empty() {
        let backend = backend().await;
        let episode = EpisodeParams::new("u1", EpisodeType::Routine, "t", "s", 1.0, "neutral")
            .into_episode(now())
            .expect("episode");
        backend
            .put_episode(&episode, "not json".into())
            .await
            .expect("put");
        let err = backend
            .list_episodes("u1", Some(0.0))
            .await
            .expect_err("corrupt");
        assert!(matches!(err, MemoryError::Codec(_)));
    }

    #[tokio::test]
    async fn affinity_is_stored_compacted_when_enabled() {
        let backend = backend().await;
        let a = backend
            .add_affinity_points("u1", "nova", 30, "chat", now())
            .await
            .expect("add");
        let raw = backend
            .store()
            .get("test:affinity:u1:nova")
            .await
            .expect("get")
            .expect("present");
        let text = std::str::from_utf8(&raw).expect("utf8");
        assert!(text.contains("\"pts\":30"), "{text}");
        assert_eq!(backend.get_affinity("u1", "nova").await.expect("get"), Some(a));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_affinity_updates_are_not_lost() {
        let backend = Arc::new(backend().await);
        let mut tasks = Vec::new();
        for _ in 0..15 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                backend
                    .add_affinity_points("u1", "nova", 5, "chat", now())
                    .await
            }));
        }
        for t in tasks {
            t.await.expect("join").expect("add");
        }
        let points = backend
            .get_affinity("u1", "nova")
            .await
            .expect("get")
            .map(|a| a.points);
        assert_eq!(points, Some(75));
    }
}
