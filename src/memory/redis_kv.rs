//! Redis KV store backing the `redis_flexible` backend.
//!
//! One [`ConnectionManager`] per process, cloned per call; it reconnects on
//! its own and is safe for concurrent use. Compare-and-swap is a server-side
//! Lua script, so it is atomic across processes.

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo, Script};
use tracing::{debug, info};

use crate::config::{BackendKind, RedisConfig};
use crate::error::{MemoryError, Result};
use crate::memory::kv::{KvProbe, KvStore};

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// KEYS[1] = key, ARGV[1] = "1" if a current value is expected,
/// ARGV[2] = expected value, ARGV[3] = new value.
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then return 0 end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
    cas: Script,
}

impl RedisKv {
    /// Resolve credentials, connect and PING. Any failure here is a
    /// [`MemoryError::Configuration`].
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| MemoryError::Configuration(format!("invalid redis url: {e}")))?;
        if let Some(password) = resolve_password(config.password_env.as_deref())? {
            info.redis.password = Some(password);
        }

        let client = redis::Client::open(info)
            .map_err(|e| MemoryError::Configuration(format!("redis client: {e}")))?;
        let conn = client.get_connection_manager().await.map_err(|e| {
            MemoryError::Configuration(format!("redis at {} is not reachable: {e}", config.url))
        })?;
        let store = Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        };
        store.probe().await.map_err(|e| {
            MemoryError::Configuration(format!("redis at {} is not ready: {e}", config.url))
        })?;
        info!(namespace = %config.namespace, "redis store connected");
        Ok(store)
    }
}

/// `Ok(None)` when no variable is configured; an error when one is named
/// but unset.
fn resolve_password(env_var: Option<&str>) -> Result<Option<String>> {
    let Some(var) = env_var else {
        return Ok(None);
    };
    std::env::var(var).map(Some).map_err(|_| {
        MemoryError::Configuration(format!(
            "redis password variable `{var}` is not set"
        ))
    })
}

/// Escape glob metacharacters for SCAN MATCH.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl KvStore for RedisKv {
    fn kind(&self) -> BackendKind {
        BackendKind::RedisFlexible
    }

    async fn probe(&self) -> Result<KvProbe> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "redis probe");
        // SCAN MATCH walks the whole keyspace.
        Ok(KvProbe {
            ordered_scan: false,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, &value[..]).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let mut conn = self.conn.clone();
        let pattern = escape_glob(prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        // Keys deleted between SCAN and MGET come back as nil.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, Bytes::from(v))))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(&new[..])
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("ns:fact:u1:"), "ns:fact:u1:*");
        assert_eq!(escape_glob("ns:fact:a*b?[c]:"), r"ns:fact:a\*b\?\[c\]:*");
    }

    #[test]
    fn named_but_unset_password_is_configuration_error() {
        let err = resolve_password(Some("FLEXMEM_TEST_SURELY_UNSET_PASSWORD"))
            .expect_err("unset");
        assert!(matches!(err, MemoryError::Configuration(_)));
        assert_eq!(resolve_password(None).expect("none"), None);
    }

    #[tokio::test]
    async fn invalid_url_is_configuration_error() {
        let config = RedisConfig {
            url: "not a url".into(),
            ..RedisConfig::default()
        };
        let err = RedisKv::connect(&config).await.err().expect("invalid");
        assert!(matches!(err, MemoryError::Configuration(_)), "{err}");
    }

    /// Runs only when `FLEXMEM_REDIS_URL` points at a disposable server.
    #[tokio::test]
    async fn live_round_trip() {
        let Ok(url) = std::env::var("FLEXMEM_REDIS_URL") else {
            return;
        };
        let kv = RedisKv::connect(&RedisConfig {
            url,
            namespace: "flexmem-test".into(),
            password_env: None,
        })
        .await
        .expect("connect");
        let key = format!("flexmem-test:{}", uuid::Uuid::new_v4());
        assert!(
            kv.compare_and_swap(&key, None, Bytes::from_static(b"a"))
                .await
                .expect("cas")
        );
        assert!(
            !kv.compare_and_swap(&key, None, Bytes::from_static(b"b"))
                .await
                .expect("cas")
        );
        let found = kv.scan_prefix(&key).await.expect("scan");
        assert_eq!(found, vec![(key.clone(), Bytes::from_static(b"a"))]);
        assert!(kv.delete(&key).await.expect("delete"));
    }
}
