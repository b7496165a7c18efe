//! flexmem: per-user memory storage with compact encoding and versioned
//! schema migrations.
//!
//! # Architecture
//!
//! - **Codec**: reversible key-alias, positional-array and minification
//!   stages (`codec`).
//! - **Backends**: one adapter per datastore family behind
//!   [`memory::MemoryBackend`], chosen once from [`StoreConfig`].
//! - **Facade**: [`MemoryStore`] validates, encodes, bounds every call with a
//!   timeout and decodes on the way out.
//! - **Migrations**: [`migrations::MigrationManager`] versions the relational
//!   schema out-of-band.

pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod migrations;

pub use codec::CodecError;
pub use config::{BackendConfig, BackendKind, OptimizationConfig, StoreConfig};
pub use error::{MemoryError, Result};
pub use memory::MemoryStore;
pub use migrations::MigrationManager;
