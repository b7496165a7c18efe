//! Configuration for the memory store.
//!
//! A [`StoreConfig`] names exactly one backend from a closed set, plus the
//! compact-encoding switches and the per-call timeout:
//!
//! ```toml
//! timeout_secs = 30
//!
//! [optimization]
//! enabled = true
//! min_fields_for_compression = 3
//!
//! [backend.sqlite_flexible]
//! path = "/var/lib/app/memory.db"
//! auto_migrate = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default namespace prefix for key-value backends.
pub const DEFAULT_NAMESPACE: &str = "flexmem";

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which datastore family backs the store, and where it lives.
    pub backend: BackendConfig,
    /// Compact-encoding switches.
    #[serde(default)]
    pub optimization: OptimizationConfig,
    /// Timeout applied to every storage call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Compact-encoding switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Master switch. When off, records are stored as plain full-key JSON.
    pub enabled: bool,
    /// Records with fewer populated fields than this are stored plain.
    pub min_fields_for_compression: usize,
    /// Keep `null` positions as explicit nulls when decoding arrays.
    pub preserve_nulls: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_fields_for_compression: 3,
            preserve_nulls: false,
        }
    }
}

/// Backend selection. The TOML key under `[backend]` names the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendConfig {
    DynamodbFlexible(RemoteBackendConfig),
    SqliteFlexible(SqliteConfig),
    PostgresqlFlexible(RemoteBackendConfig),
    RedisFlexible(RedisConfig),
    MongodbFlexible(RemoteBackendConfig),
    InMemory(InMemoryConfig),
}

/// Stable identifier for each backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DynamodbFlexible,
    SqliteFlexible,
    PostgresqlFlexible,
    RedisFlexible,
    MongodbFlexible,
    InMemory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DynamodbFlexible => "dynamodb_flexible",
            Self::SqliteFlexible => "sqlite_flexible",
            Self::PostgresqlFlexible => "postgresql_flexible",
            Self::RedisFlexible => "redis_flexible",
            Self::MongodbFlexible => "mongodb_flexible",
            Self::InMemory => "in_memory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::DynamodbFlexible(_) => BackendKind::DynamodbFlexible,
            Self::SqliteFlexible(_) => BackendKind::SqliteFlexible,
            Self::PostgresqlFlexible(_) => BackendKind::PostgresqlFlexible,
            Self::RedisFlexible(_) => BackendKind::RedisFlexible,
            Self::MongodbFlexible(_) => BackendKind::MongodbFlexible,
            Self::InMemory(_) => BackendKind::InMemory,
        }
    }
}

/// Explicit addressing scheme for one table. Skips the construction-time
/// probe for that table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchemaOverride {
    pub partition_key: String,
    #[serde(default)]
    pub sort_key: Vec<String>,
}

/// SQLite (`sqlite_flexible`) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file. `:memory:` opens a private in-memory database.
    pub path: PathBuf,
    pub facts_table: String,
    pub episodes_table: String,
    pub affinity_table: String,
    /// Apply pending migrations before probing the schema.
    pub auto_migrate: bool,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Per-table overrides, keyed by table name.
    pub key_schema: BTreeMap<String, KeySchemaOverride>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            facts_table: "facts".to_owned(),
            episodes_table: "episodes".to_owned(),
            affinity_table: "affinity".to_owned(),
            auto_migrate: false,
            busy_timeout_ms: 5_000,
            key_schema: BTreeMap::new(),
        }
    }
}

impl SqliteConfig {
    /// True iff every table name matches what the built-in migrations create.
    pub fn uses_migrated_tables(&self) -> bool {
        let defaults = Self::default();
        self.facts_table == defaults.facts_table
            && self.episodes_table == defaults.episodes_table
            && self.affinity_table == defaults.affinity_table
    }
}

/// Redis (`redis_flexible`) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://cache.internal:6379/0`.
    pub url: String,
    /// Prefix for every key this store writes.
    pub namespace: String,
    /// Environment variable holding the password. Construction fails if it
    /// is named here but unset.
    pub password_env: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            password_env: None,
        }
    }
}

/// In-process (`in_memory`) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    pub namespace: String,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

/// Settings shared by the cloud/document families.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    /// Table, collection, or database name.
    pub location: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub key_schema: Option<KeySchemaOverride>,
}

impl StoreConfig {
    /// Config for the given backend with default optimization and timeout.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            optimization: OptimizationConfig::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Configuration`] if the file cannot be read,
    /// parsed, or fails [`StoreConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MemoryError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validates this configuration.
    ///
    /// Checks:
    /// - `timeout_secs` must be greater than 0
    /// - `min_fields_for_compression` must be greater than 0
    /// - the backend location must be present
    /// - SQLite table names must be plain identifiers
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(MemoryError::Configuration(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.optimization.min_fields_for_compression == 0 {
            return Err(MemoryError::Configuration(
                "min_fields_for_compression must be greater than 0".into(),
            ));
        }
        match &self.backend {
            BackendConfig::SqliteFlexible(c) => {
                if c.path.as_os_str().is_empty() {
                    return Err(MemoryError::Configuration(
                        "sqlite_flexible requires a database path".into(),
                    ));
                }
                for table in [&c.facts_table, &c.episodes_table, &c.affinity_table] {
                    validate_identifier(table)?;
                }
                if c.auto_migrate && !c.uses_migrated_tables() {
                    return Err(MemoryError::Configuration(
                        "auto_migrate creates `facts`, `episodes` and `affinity`; \
                         renamed tables must be migrated separately"
                            .into(),
                    ));
                }
                for (table, schema) in &c.key_schema {
                    validate_identifier(table)?;
                    validate_identifier(&schema.partition_key)?;
                    for column in &schema.sort_key {
                        validate_identifier(column)?;
                    }
                }
            }
            BackendConfig::RedisFlexible(c) => {
                if c.url.trim().is_empty() {
                    return Err(MemoryError::Configuration(
                        "redis_flexible requires a url".into(),
                    ));
                }
                validate_namespace(&c.namespace)?;
            }
            BackendConfig::InMemory(c) => validate_namespace(&c.namespace)?,
            BackendConfig::DynamodbFlexible(c)
            | BackendConfig::PostgresqlFlexible(c)
            | BackendConfig::MongodbFlexible(c) => {
                if c.location.trim().is_empty() {
                    return Err(MemoryError::Configuration(format!(
                        "{} requires a location",
                        self.backend.kind()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MemoryError::Configuration(format!(
            "`{name}` is not a valid SQL identifier"
        )))
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(':') {
        return Err(MemoryError::Configuration(format!(
            "namespace `{namespace}` must be non-empty and contain no ':'"
        )));
    }
    Ok(())
}
