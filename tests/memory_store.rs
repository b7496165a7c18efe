#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use flexmem::config::{InMemoryConfig, SqliteConfig};
use flexmem::memory::{
    AffinityLevel, EpisodeParams, EpisodeType, FactCategory, FactParams, MemoryStore,
    SqliteBackend, SqliteHandle,
};
use flexmem::{BackendConfig, BackendKind, MemoryError, OptimizationConfig, StoreConfig};
use serde_json::json;

fn sqlite_config(db: &Path, compaction: bool) -> StoreConfig {
    let toml = format!(
        r#"
timeout_secs = 10

[optimization]
enabled = {compaction}
min_fields_for_compression = 3

[backend.sqlite_flexible]
path = '{}'
auto_migrate = true
"#,
        db.display()
    );
    StoreConfig::from_toml_str(&toml).expect("parse config")
}

fn in_memory_config() -> StoreConfig {
    StoreConfig::new(BackendConfig::InMemory(InMemoryConfig::default()))
}

#[tokio::test]
async fn saved_fact_is_returned_on_every_backend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let configs = [
        sqlite_config(&dir.path().join("memory.db"), true),
        sqlite_config(&dir.path().join("plain.db"), false),
        in_memory_config(),
    ];
    for config in configs {
        let store = MemoryStore::open(&config).await.expect("open");
        store
            .save_fact(FactParams::new(
                "u1",
                FactCategory::Preferences,
                "lang",
                "Python",
                0.9,
            ))
            .await
            .expect("save");

        let facts = store.get_facts("u1", None).await.expect("get");
        assert_eq!(facts.len(), 1, "backend {}", store.backend_kind());
        assert_eq!(facts[0].key, "lang");
        assert_eq!(facts[0].value, json!("Python"));
        assert_eq!(facts[0].confidence, 0.9);
    }
}

#[tokio::test]
async fn records_survive_a_compaction_toggle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("memory.db");

    let compact = MemoryStore::open(&sqlite_config(&db, true))
        .await
        .expect("open compact");
    let fact = compact
        .save_fact(
            FactParams::new(
                "u1",
                FactCategory::Relationships,
                "sister",
                json!({"name": "Maya", "city": "Lisbon"}),
                0.8,
            )
            .with_tags(["family", "travel"])
            .with_source("onboarding"),
        )
        .await
        .expect("save");
    let episode = compact
        .save_episode(EpisodeParams::new(
            "u1",
            EpisodeType::EmotionalMoment,
            "Bad day",
            "User felt overwhelmed at work",
            6.0,
            "negative",
        ))
        .await
        .expect("episode");
    drop(compact);

    let plain = MemoryStore::open(&sqlite_config(&db, false))
        .await
        .expect("open plain");
    assert_eq!(plain.get_facts("u1", None).await.expect("facts"), vec![fact]);
    assert_eq!(
        plain.get_episodes("u1", None).await.expect("episodes"),
        vec![episode]
    );
}

#[tokio::test]
async fn user_values_keep_their_keys_with_compaction_on_and_off() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut plain_in_memory = in_memory_config();
    plain_in_memory.optimization.enabled = false;
    let configs = [
        sqlite_config(&dir.path().join("compact.db"), true),
        sqlite_config(&dir.path().join("plain.db"), false),
        in_memory_config(),
        plain_in_memory,
    ];
    for config in configs {
        let store = MemoryStore::open(&config).await.expect("open");
        let value = json!({"k": 3, "v": "dark", "sum": [{"ts": 1}]});
        let metadata = json!({"src": "voice", "ts": "yesterday"});
        store
            .save_fact(FactParams::new(
                "u1",
                FactCategory::Preferences,
                "theme",
                value.clone(),
                0.7,
            ))
            .await
            .expect("save fact");
        store
            .save_episode(
                EpisodeParams::new(
                    "u1",
                    EpisodeType::Conversation,
                    "Settings",
                    "Talked about themes",
                    3.0,
                    "neutral",
                )
                .with_metadata(metadata.clone()),
            )
            .await
            .expect("save episode");

        let context = format!(
            "backend {} compaction {}",
            store.backend_kind(),
            store.optimization().enabled
        );
        let facts = store.get_facts("u1", None).await.expect("facts");
        assert_eq!(facts[0].value, value, "{context}");
        let episodes = store.get_episodes("u1", None).await.expect("episodes");
        assert_eq!(episodes[0].metadata.as_ref(), Some(&metadata), "{context}");
    }
}

#[tokio::test]
async fn episodes_filter_by_importance_and_clean_up() {
    let store = MemoryStore::open(&in_memory_config()).await.expect("open");
    for (title, importance) in [("low", 1.0), ("mid", 5.0), ("high", 9.0)] {
        store
            .save_episode(EpisodeParams::new(
                "u1",
                EpisodeType::Conversation,
                title,
                "chat",
                importance,
                "neutral",
            ))
            .await
            .expect("save");
    }
    let important = store.get_episodes("u1", Some(5.0)).await.expect("get");
    let mut titles: Vec<_> = important.iter().map(|e| e.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, ["high", "mid"]);

    let past = chrono::Utc::now() - ChronoDuration::days(1);
    assert_eq!(
        store.delete_episodes_before(None, past).await.expect("none old"),
        0
    );
    let future = chrono::Utc::now() + ChronoDuration::days(1);
    assert_eq!(
        store
            .delete_episodes_before(Some("u1"), future)
            .await
            .expect("cleanup"),
        3
    );
    assert!(store.get_episodes("u1", None).await.expect("get").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_affinity_updates_are_not_lost_across_connections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("memory.db");
    // Two stores, two connections: the same shape as two processes.
    let first = MemoryStore::open(&sqlite_config(&db, true))
        .await
        .expect("open first");
    let second = MemoryStore::open(&sqlite_config(&db, true))
        .await
        .expect("open second");

    let mut tasks = Vec::new();
    for i in 0..14 {
        let store = if i % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        tasks.push(tokio::spawn(async move {
            store.update_affinity("u1", "Nova", 5, "chat").await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("update");
    }

    let affinity = first
        .get_affinity("u1", "Nova")
        .await
        .expect("get")
        .expect("row");
    assert_eq!(affinity.points, 70);
    assert_eq!(affinity.level, AffinityLevel::CloseFriend);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_affinity_updates_clamp_at_one_hundred() {
    let store = Arc::new(MemoryStore::open(&in_memory_config()).await.expect("open"));
    let mut tasks = Vec::new();
    for _ in 0..30 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store.update_affinity("u1", "Nova", 5, "chat").await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("update");
    }
    let affinity = store
        .get_affinity("u1", "Nova")
        .await
        .expect("get")
        .expect("row");
    assert_eq!(affinity.points, 100);
    assert_eq!(affinity.level, AffinityLevel::BestFriend);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_affinity_update_does_not_commit_later() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SqliteConfig {
        path: dir.path().join("memory.db"),
        auto_migrate: true,
        ..SqliteConfig::default()
    };
    let handle = SqliteHandle::open(&config.path, config.busy_timeout_ms).expect("open");
    let backend = SqliteBackend::new(handle, &config).await.expect("backend");
    let store = MemoryStore::with_backend(
        Arc::new(backend),
        OptimizationConfig::default(),
        Duration::from_millis(200),
    );

    let writer = rusqlite::Connection::open(&config.path).expect("open writer");
    writer
        .execute_batch("BEGIN IMMEDIATE")
        .expect("hold write lock");

    let err = store
        .update_affinity("u1", "Nova", 5, "chat")
        .await
        .expect_err("write lock is held");
    assert!(err.is_retryable(), "{err}");

    tokio::time::sleep(Duration::from_millis(400)).await;
    writer.execute_batch("COMMIT").expect("release write lock");

    store
        .update_affinity("u1", "Nova", 5, "chat")
        .await
        .expect("retry");
    let affinity = store
        .get_affinity("u1", "Nova")
        .await
        .expect("get")
        .expect("row");
    assert_eq!(affinity.points, 5);
}

#[tokio::test]
async fn unmigrated_database_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig::new(BackendConfig::SqliteFlexible(SqliteConfig {
        path: dir.path().join("empty.db"),
        ..SqliteConfig::default()
    }));
    let err = MemoryStore::open(&config).await.err().expect("must fail");
    assert!(matches!(err, MemoryError::Configuration(_)), "{err}");
}

#[tokio::test]
async fn stats_match_saved_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::open(&sqlite_config(&dir.path().join("memory.db"), true))
        .await
        .expect("open");
    assert_eq!(store.backend_kind(), BackendKind::SqliteFlexible);

    store
        .save_fact(FactParams::new("u1", FactCategory::Health, "allergy", "peanuts", 1.0))
        .await
        .expect("save");
    store
        .save_fact(FactParams::new("u1", FactCategory::Health, "sleep", 7, 0.6))
        .await
        .expect("save");
    let milestone = store
        .save_episode(EpisodeParams::new(
            "u1",
            EpisodeType::Milestone,
            "New job",
            "Started at the hospital",
            8.0,
            "positive",
        ))
        .await
        .expect("episode");

    let stats = store.get_memory_stats("u1").await.expect("stats");
    assert_eq!(stats.total_facts, 2);
    assert_eq!(stats.fact_categories.get("health"), Some(&2));
    assert_eq!(stats.total_episodes, 1);
    assert_eq!(stats.most_important_episode, Some(milestone));
}
