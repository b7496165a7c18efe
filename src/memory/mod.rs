//! Per-user memory storage.
//!
//! Sub-modules:
//! - `types`: facts, episodes, affinity, their enums and validation.
//! - `backend`: the `MemoryBackend` interface and the backend factory.
//! - `store`: the `MemoryStore` facade collaborators call.
//!
//! Adapters:
//! - `sqlite` + `schema`: relational reference adapter and its schema probe.
//! - `kv`: generic key-value adapter over a `KvStore`.
//! - `memory_kv`, `redis_kv`: in-process and Redis `KvStore`s.

pub mod backend;
pub mod kv;
pub mod memory_kv;
pub mod redis_kv;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod types;

pub use backend::{MemoryBackend, open_backend};
pub use kv::{KvBackend, KvStore};
pub use memory_kv::MemoryKv;
pub use redis_kv::RedisKv;
pub use sqlite::{SqliteBackend, SqliteHandle};
pub use store::MemoryStore;
pub use types::{
    Affinity, AffinityLevel, Episode, EpisodeParams, EpisodeType, Fact, FactCategory, FactParams,
    MemoryStats,
};
