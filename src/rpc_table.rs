use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};

use crate::rpc::{HomaRpc, RpcId, RpcKey};

pub type RpcRef = Arc<Mutex<HomaRpc>>;

#[derive(Default)]
struct RpcTableInner {
    rpcs: FxHashMap<RpcKey, RpcRef>,
    /// client ids are unique per endpoint, so the application can refer to them by id only
    client_ids: FxHashMap<RpcId, RpcKey>,
}

/// The RPCs of one endpoint.
///
/// Lookups only clone the [RpcRef] and release the table lock before the RPC is locked. Code
///  that holds an RPC's lock may still access the table (e.g. to remove the RPC), but never the
///  other way around.
#[derive(Default)]
pub struct RpcTable {
    inner: RwLock<RpcTableInner>,
}

impl RpcTable {
    pub fn new() -> RpcTable {
        Default::default()
    }

    pub async fn insert(&self, rpc: HomaRpc) -> RpcRef {
        let key = rpc.key;
        let is_client = rpc.is_client();
        let rpc = Arc::new(Mutex::new(rpc));

        let mut inner = self.inner.write().await;
        inner.rpcs.insert(key, rpc.clone());
        if is_client {
            inner.client_ids.insert(key.id, key);
        }
        rpc
    }

    /// Returns the RPC for `key`, creating it if it does not exist. The flag is true if the RPC
    ///  was created by this call.
    pub async fn get_or_create(&self, key: RpcKey, create: impl FnOnce() -> HomaRpc) -> (RpcRef, bool) {
        if let Some(rpc) = self.get(&key).await {
            return (rpc, false);
        }

        let mut inner = self.inner.write().await;
        match inner.rpcs.entry(key) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let rpc = create();
                let is_client = rpc.is_client();
                let rpc = e.insert(Arc::new(Mutex::new(rpc))).clone();
                if is_client {
                    inner.client_ids.insert(key.id, key);
                }
                (rpc, true)
            }
        }
    }

    pub async fn get(&self, key: &RpcKey) -> Option<RpcRef> {
        self.inner.read().await
            .rpcs.get(key)
            .cloned()
    }

    pub async fn find_client(&self, id: RpcId) -> Option<RpcRef> {
        let inner = self.inner.read().await;
        inner.client_ids.get(&id)
            .and_then(|key| inner.rpcs.get(key))
            .cloned()
    }

    pub async fn remove(&self, key: &RpcKey) -> Option<RpcRef> {
        let mut inner = self.inner.write().await;
        if inner.client_ids.get(&key.id) == Some(key) {
            inner.client_ids.remove(&key.id);
        }
        inner.rpcs.remove(key)
    }

    /// All RPCs at the time of the call; the table is not locked while the caller works on them
    pub async fn snapshot(&self) -> Vec<RpcRef> {
        self.inner.read().await
            .rpcs.values()
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rpcs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomaConfig;
    use bytes::Bytes;
    use std::net::SocketAddr;

    fn key(port: u16, id: u64) -> RpcKey {
        RpcKey { peer: SocketAddr::from(([10, 0, 0, 1], port)), id: RpcId(id) }
    }

    #[tokio::test]
    async fn test_insert_find_remove() {
        let table = RpcTable::new();
        table.insert(HomaRpc::new_client(key(1, 2), Bytes::from_static(b"x"), 0, &HomaConfig::default(), 0)).await;
        table.insert(HomaRpc::new_server(key(1, 3), 1)).await;

        assert_eq!(table.len().await, 2);
        assert!(table.find_client(RpcId(2)).await.is_some());
        assert!(table.find_client(RpcId(3)).await.is_none());
        assert!(table.get(&key(1, 3)).await.is_some());
        assert!(table.get(&key(2, 3)).await.is_none());

        assert!(table.remove(&key(1, 2)).await.is_some());
        assert!(table.find_client(RpcId(2)).await.is_none());
        assert!(table.remove(&key(1, 2)).await.is_none());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let table = RpcTable::new();
        let (first, created) = table.get_or_create(key(5, 101), || HomaRpc::new_server(key(5, 101), 0)).await;
        assert!(created);
        let (second, created) = table.get_or_create(key(5, 101), || panic!("must not create twice")).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create() {
        let table = Arc::new(RpcTable::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.get_or_create(key(7, 11), || HomaRpc::new_server(key(7, 11), 0)).await.1
            }));
        }
        let mut num_created = 0;
        for h in handles {
            if h.await.unwrap() {
                num_created += 1;
            }
        }
        assert_eq!(num_created, 1);
        assert_eq!(table.len().await, 1);
    }
}
