//! The storage interface every backend adapter implements, and the factory
//! that picks one from configuration.
//!
//! Backends deal in opaque wire payloads for facts and episodes: the
//! [`MemoryStore`](super::store::MemoryStore) facade decides the encoding and
//! decodes on the way out. Affinity is the exception, because its update is
//! a read-modify-write that must happen at the datastore boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{BackendConfig, BackendKind, OptimizationConfig, StoreConfig};
use crate::error::{MemoryError, Result};
use crate::memory::kv::KvBackend;
use crate::memory::memory_kv::MemoryKv;
use crate::memory::redis_kv::RedisKv;
use crate::memory::sqlite::{SqliteBackend, SqliteHandle};
use crate::memory::types::{Affinity, Episode, Fact, FactCategory};

tokio::task_local! {
    /// When the facade call running on this task gives up. Blocking
    /// adapters read it so work abandoned by a timeout cannot commit later.
    pub(crate) static CALL_DEADLINE: tokio::time::Instant;
}

/// Deadline of the enclosing facade call, if any.
pub(crate) fn call_deadline() -> Option<std::time::Instant> {
    CALL_DEADLINE
        .try_with(|deadline| deadline.into_std())
        .ok()
}

/// Uniform create/read/delete semantics over one datastore family.
///
/// Every list operation returns `Ok(vec![])` only for a confirmed empty
/// result; failures to reach or read the datastore are errors.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Upsert by `(user_id, category, key)`, fully replacing any prior row.
    async fn put_fact(&self, fact: &Fact, payload: String) -> Result<()>;

    /// Payloads of the user's facts, optionally restricted to one category.
    async fn list_facts(
        &self,
        user_id: &str,
        category: Option<FactCategory>,
    ) -> Result<Vec<String>>;

    /// True iff a fact existed and was removed.
    async fn remove_fact(&self, user_id: &str, category: FactCategory, key: &str) -> Result<bool>;

    /// Append an episode. Episode ids are never reused.
    async fn put_episode(&self, episode: &Episode, payload: String) -> Result<()>;

    /// Payloads of the user's episodes with `importance >= min_importance`.
    async fn list_episodes(&self, user_id: &str, min_importance: Option<f64>)
    -> Result<Vec<String>>;

    /// Remove episodes strictly older than `cutoff`, for one user or all.
    async fn delete_episodes_before(
        &self,
        user_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;

    /// Accumulate `delta` points without losing concurrent updates.
    async fn add_affinity_points(
        &self,
        user_id: &str,
        personality_name: &str,
        delta: i64,
        interaction_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Affinity>;

    async fn get_affinity(&self, user_id: &str, personality_name: &str)
    -> Result<Option<Affinity>>;
}

/// Construct the adapter named by `config`. Probing, connection and
/// credential checks all happen here, never on first use.
pub async fn open_backend(config: &StoreConfig) -> Result<Arc<dyn MemoryBackend>> {
    config.validate()?;
    let optimization = config.optimization.clone();
    let backend: Arc<dyn MemoryBackend> = match &config.backend {
        BackendConfig::SqliteFlexible(sqlite) => {
            let handle = SqliteHandle::open(&sqlite.path, sqlite.busy_timeout_ms)?;
            Arc::new(SqliteBackend::new(handle, sqlite).await?)
        }
        BackendConfig::RedisFlexible(redis) => {
            let store = RedisKv::connect(redis).await?;
            Arc::new(KvBackend::new(store, &redis.namespace, optimization).await?)
        }
        BackendConfig::InMemory(memory) => Arc::new(
            KvBackend::new(MemoryKv::new(), &memory.namespace, optimization).await?,
        ),
        BackendConfig::DynamodbFlexible(_)
        | BackendConfig::PostgresqlFlexible(_)
        | BackendConfig::MongodbFlexible(_) => {
            return Err(unsupported(config.backend.kind()));
        }
    };
    info!(backend = %backend.kind(), "memory backend ready");
    Ok(backend)
}

fn unsupported(kind: BackendKind) -> MemoryError {
    MemoryError::Configuration(format!(
        "backend `{kind}` is recognised but no adapter is compiled into this build"
    ))
}

/// Wire form for backends that store affinity rows as opaque values.
pub(crate) fn affinity_wire(affinity: &Affinity, optimization: &OptimizationConfig) -> String {
    let record = affinity.to_record();
    if crate::codec::should_compress(&record, optimization) {
        crate::codec::encode_compact_object(&record)
    } else {
        crate::codec::encode_plain(&record)
    }
}
