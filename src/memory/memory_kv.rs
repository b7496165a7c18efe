//! In-process KV store backing the `in_memory` backend.
//!
//! Ordered by key, so prefix scans are range reads. Compare-and-swap runs
//! under the write lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::config::BackendKind;
use crate::error::Result;
use crate::memory::kv::{KvProbe, KvStore};

#[derive(Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    async fn probe(&self) -> Result<KvProbe> {
        Ok(KvProbe { ordered_scan: true })
    }

    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    #[instrument(skip(self, value), fields(value_len = value.len()), level = "trace")]
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.data.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    #[instrument(skip(self), level = "trace")]
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let data = self.data.read().await;
        Ok(data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    #[instrument(skip(self, expected, new), level = "trace")]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
    ) -> Result<bool> {
        let mut data = self.data.write().await;
        if data.get(key).map(|v| &v[..]) != expected {
            return Ok(false);
        }
        data.insert(key.to_owned(), new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_delete() {
        let kv = MemoryKv::new();
        assert!(kv.get("a").await.expect("get").is_none());
        kv.put("a", Bytes::from_static(b"1")).await.expect("put");
        assert_eq!(kv.get("a").await.expect("get"), Some(Bytes::from_static(b"1")));
        assert!(kv.delete("a").await.expect("delete"));
        assert!(!kv.delete("a").await.expect("delete"));
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn scan_prefix_is_bounded() {
        let kv = MemoryKv::new();
        for key in ["ns:fact:u1:a", "ns:fact:u1:b", "ns:fact:u10:a", "ns:fact:u2:a"] {
            kv.put(key, Bytes::from(key.to_owned())).await.expect("put");
        }
        let keys: Vec<String> = kv
            .scan_prefix("ns:fact:u1:")
            .await
            .expect("scan")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["ns:fact:u1:a", "ns:fact:u1:b"]);
        assert_eq!(kv.len().await, 4);
    }

    #[tokio::test]
    async fn compare_and_swap_checks_current_value() {
        let kv = MemoryKv::new();
        assert!(
            kv.compare_and_swap("k", None, Bytes::from_static(b"v1"))
                .await
                .expect("cas")
        );
        assert!(
            !kv.compare_and_swap("k", None, Bytes::from_static(b"v2"))
                .await
                .expect("cas")
        );
        assert!(
            kv.compare_and_swap("k", Some(&b"v1"[..]), Bytes::from_static(b"v2"))
                .await
                .expect("cas")
        );
        assert_eq!(kv.get("k").await.expect("get"), Some(Bytes::from_static(b"v2")));
    }
}
