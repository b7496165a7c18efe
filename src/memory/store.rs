//! `MemoryStore`: the one API collaborators use, whatever the backend and
//! whether or not compaction is on.
//!
//! Writes pick a wire form with [`should_compress`]; reads accept every wire
//! form, so records written under either setting stay readable after it
//! flips. Every call is validated before I/O and bounded by the configured
//! timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::codec::{
    ArrayOptions, SizeReduction, decode_record, encode_compact, encode_compact_object,
    encode_plain, get_size_reduction, should_compress,
};
use crate::config::{BackendKind, OptimizationConfig, StoreConfig};
use crate::error::{MemoryError, Result};
use crate::memory::backend::{CALL_DEADLINE, MemoryBackend, open_backend};
use crate::memory::types::{
    Affinity, Episode, EpisodeParams, Fact, FactCategory, FactParams, MemoryStats, now,
    validate_identity, validate_importance,
};

/// Optimization-transparent facade over a [`MemoryBackend`].
///
/// Cheap to clone; clones share the backend handle.
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    optimization: OptimizationConfig,
    timeout: Duration,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("backend", &self.backend.kind())
            .field("optimization", &self.optimization)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MemoryStore {
    /// Validate `config` and construct its backend. Configuration problems
    /// surface here, never on first use.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let backend = open_backend(config).await?;
        Ok(Self::with_backend(
            backend,
            config.optimization.clone(),
            config.timeout(),
        ))
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(
        backend: Arc<dyn MemoryBackend>,
        optimization: OptimizationConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            optimization,
            timeout,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn optimization(&self) -> &OptimizationConfig {
        &self.optimization
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        match tokio::time::timeout_at(deadline, CALL_DEADLINE.scope(deadline, fut)).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    fn decode_options(&self) -> ArrayOptions {
        ArrayOptions {
            preserve_nulls: self.optimization.preserve_nulls,
        }
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    /// Upsert a fact by `(user_id, category, key)`, replacing any prior
    /// record at that identity.
    pub async fn save_fact(&self, params: FactParams) -> Result<Fact> {
        let fact = params.into_fact(now())?;
        let record = fact.to_record();
        let compact = should_compress(&record, &self.optimization);
        let payload = if compact {
            encode_compact(&record)
        } else {
            encode_plain(&record)
        };
        debug!(
            user_id = %fact.user_id,
            category = %fact.category,
            key = %fact.key,
            compact,
            bytes = payload.len(),
            "saving fact"
        );
        self.bounded("save_fact", self.backend.put_fact(&fact, payload))
            .await?;
        Ok(fact)
    }

    /// The user's facts, optionally for one category. Empty means the
    /// datastore confirmed there are none.
    pub async fn get_facts(
        &self,
        user_id: &str,
        category: Option<FactCategory>,
    ) -> Result<Vec<Fact>> {
        validate_identity("user_id", user_id)?;
        let payloads = self
            .bounded("get_facts", self.backend.list_facts(user_id, category))
            .await?;
        let options = self.decode_options();
        payloads
            .iter()
            .map(|payload| -> Result<Fact> {
                let record = decode_record(payload, options)?;
                Ok(Fact::from_record(&record)?)
            })
            .collect()
    }

    /// True iff the fact existed and was removed.
    pub async fn delete_fact(
        &self,
        user_id: &str,
        category: FactCategory,
        key: &str,
    ) -> Result<bool> {
        validate_identity("user_id", user_id)?;
        validate_identity("key", key)?;
        self.bounded(
            "delete_fact",
            self.backend.remove_fact(user_id, category, key),
        )
        .await
    }

    /// Size accounting for `fact`'s canonical compact wire form.
    pub fn encoding_report(&self, fact: &Fact) -> SizeReduction {
        let report = get_size_reduction(&fact.to_record(), None);
        debug!(
            original = report.original_size,
            encoded = report.encoded_size,
            percent = report.reduction_percent,
            "fact encoding report"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Episodes
    // -----------------------------------------------------------------------

    /// Append an episode and return it with its generated id.
    pub async fn save_episode(&self, params: EpisodeParams) -> Result<Episode> {
        let episode = params.into_episode(now())?;
        let record = episode.to_record();
        let compact = should_compress(&record, &self.optimization);
        let payload = if compact {
            encode_compact_object(&record)
        } else {
            encode_plain(&record)
        };
        debug!(
            user_id = %episode.user_id,
            episode_id = %episode.id,
            compact,
            bytes = payload.len(),
            "saving episode"
        );
        self.bounded("save_episode", self.backend.put_episode(&episode, payload))
            .await?;
        Ok(episode)
    }

    /// The user's episodes, keeping only `importance >= min_importance`
    /// when given.
    pub async fn get_episodes(
        &self,
        user_id: &str,
        min_importance: Option<f64>,
    ) -> Result<Vec<Episode>> {
        validate_identity("user_id", user_id)?;
        if let Some(min) = min_importance {
            validate_importance(min)?;
        }
        let payloads = self
            .bounded(
                "get_episodes",
                self.backend.list_episodes(user_id, min_importance),
            )
            .await?;
        let options = self.decode_options();
        payloads
            .iter()
            .map(|payload| -> Result<Episode> {
                let record = decode_record(payload, options)?;
                Ok(Episode::from_record(&record)?)
            })
            .collect()
    }

    /// Bulk cleanup: remove episodes strictly older than `cutoff`, for one
    /// user or all users. Returns how many were removed.
    pub async fn delete_episodes_before(
        &self,
        user_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        if let Some(user_id) = user_id {
            validate_identity("user_id", user_id)?;
        }
        let removed = self
            .bounded(
                "delete_episodes_before",
                self.backend.delete_episodes_before(user_id, cutoff),
            )
            .await?;
        debug!(removed, %cutoff, "episode cleanup");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Affinity
    // -----------------------------------------------------------------------

    /// Add `points_delta` (may be negative) to the relationship score.
    /// Points are clamped to `[0, 100]` and the level recomputed.
    pub async fn update_affinity(
        &self,
        user_id: &str,
        personality_name: &str,
        points_delta: i64,
        interaction_type: &str,
    ) -> Result<Affinity> {
        validate_identity("user_id", user_id)?;
        validate_identity("personality_name", personality_name)?;
        let affinity = self
            .bounded(
                "update_affinity",
                self.backend.add_affinity_points(
                    user_id,
                    personality_name,
                    points_delta,
                    interaction_type,
                    now(),
                ),
            )
            .await?;
        debug!(
            user_id,
            personality_name,
            delta = points_delta,
            points = affinity.points,
            level = %affinity.level,
            "affinity updated"
        );
        Ok(affinity)
    }

    pub async fn get_affinity(
        &self,
        user_id: &str,
        personality_name: &str,
    ) -> Result<Option<Affinity>> {
        validate_identity("user_id", user_id)?;
        validate_identity("personality_name", personality_name)?;
        self.bounded(
            "get_affinity",
            self.backend.get_affinity(user_id, personality_name),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub async fn get_memory_stats(&self, user_id: &str) -> Result<MemoryStats> {
        let facts = self.get_facts(user_id, None).await?;
        let episodes = self.get_episodes(user_id, None).await?;
        Ok(MemoryStats::from_records(&facts, &episodes))
    }
}
