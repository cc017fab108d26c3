// Row-level store over cluster, host and event entities.
//
// Mutations go through `begin_exclusive`, which hands out a
// transaction holding the per-cluster row lock. Everything staged on
// the transaction becomes visible only at `commit`; dropping the
// transaction without committing rolls the staged changes back. Reads
// outside a transaction see the last committed state.

pub mod object_store;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Cluster, Event, EventSeverity, Host};

struct ClusterRow {
    lock: Arc<Mutex<()>>,
    cluster: Cluster,
    hosts: BTreeMap<Uuid, Host>,
}

#[derive(Default)]
struct StoreInner {
    clusters: RwLock<HashMap<Uuid, ClusterRow>>,
    events: RwLock<Vec<Event>>,
}

#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub fn insert_cluster(&self, cluster: Cluster) -> ApiResult<()> {
        let mut clusters = self.inner.clusters.write().unwrap();
        if clusters.contains_key(&cluster.id) {
            return Err(ApiError::Conflict(format!(
                "cluster {} is already registered",
                cluster.id
            )));
        }
        clusters.insert(
            cluster.id,
            ClusterRow {
                lock: Arc::new(Mutex::new(())),
                cluster,
                hosts: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn get_cluster(&self, id: Uuid) -> ApiResult<Cluster> {
        let clusters = self.inner.clusters.read().unwrap();
        clusters
            .get(&id)
            .map(|row| row.cluster.clone())
            .ok_or_else(|| ApiError::not_found("cluster", id))
    }

    /// Cluster plus its hosts, ordered by host id.
    pub fn get_cluster_with_hosts(&self, id: Uuid) -> ApiResult<(Cluster, Vec<Host>)> {
        let clusters = self.inner.clusters.read().unwrap();
        clusters
            .get(&id)
            .map(|row| (row.cluster.clone(), row.hosts.values().cloned().collect()))
            .ok_or_else(|| ApiError::not_found("cluster", id))
    }

    pub fn list_clusters(&self) -> Vec<Cluster> {
        let clusters = self.inner.clusters.read().unwrap();
        let mut out: Vec<Cluster> = clusters.values().map(|row| row.cluster.clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Ids of clusters that have at least one host, ordered by id.
    /// The monitor pages over this list.
    pub fn cluster_ids_with_hosts(&self) -> Vec<Uuid> {
        let clusters = self.inner.clusters.read().unwrap();
        let mut ids: Vec<Uuid> = clusters
            .values()
            .filter(|row| !row.hosts.is_empty())
            .map(|row| row.cluster.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn get_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Host> {
        let clusters = self.inner.clusters.read().unwrap();
        let row = clusters
            .get(&cluster_id)
            .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
        row.hosts
            .get(&host_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("host", host_id))
    }

    pub fn list_hosts(&self, cluster_id: Uuid) -> ApiResult<Vec<Host>> {
        let clusters = self.inner.clusters.read().unwrap();
        let row = clusters
            .get(&cluster_id)
            .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
        Ok(row.hosts.values().cloned().collect())
    }

    /// Acquire the cluster row for exclusive mutation. Serializes all
    /// writers of the same cluster, the monitor included.
    pub async fn begin_exclusive(&self, cluster_id: Uuid) -> ApiResult<ClusterTx> {
        let lock = {
            let clusters = self.inner.clusters.read().unwrap();
            clusters
                .get(&cluster_id)
                .map(|row| row.lock.clone())
                .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?
        };
        let guard = lock.lock_owned().await;
        // Snapshot after the lock is held so the transaction starts
        // from the latest committed state.
        let (cluster, hosts) = {
            let clusters = self.inner.clusters.read().unwrap();
            let row = clusters
                .get(&cluster_id)
                .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
            (row.cluster.clone(), row.hosts.clone())
        };
        Ok(ClusterTx {
            store: self.clone(),
            _guard: guard,
            cluster,
            hosts,
        })
    }

    /// Delete the cluster and cascade to its hosts. Takes the row lock
    /// so an in-flight transaction cannot commit into a removed row.
    pub async fn remove_cluster(&self, cluster_id: Uuid) -> ApiResult<(Cluster, Vec<Host>)> {
        let lock = {
            let clusters = self.inner.clusters.read().unwrap();
            clusters
                .get(&cluster_id)
                .map(|row| row.lock.clone())
                .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?
        };
        let _guard = lock.lock_owned().await;
        let mut clusters = self.inner.clusters.write().unwrap();
        let row = clusters
            .remove(&cluster_id)
            .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
        Ok((row.cluster, row.hosts.into_values().collect()))
    }

    pub fn add_event(
        &self,
        cluster_id: Uuid,
        host_id: Option<Uuid>,
        severity: EventSeverity,
        message: impl Into<String>,
    ) {
        let mut events = self.inner.events.write().unwrap();
        events.push(Event::new(cluster_id, host_id, severity, message));
    }

    pub fn list_events(&self, cluster_id: Uuid, host_id: Option<Uuid>) -> Vec<Event> {
        let events = self.inner.events.read().unwrap();
        events
            .iter()
            .filter(|e| e.cluster_id == cluster_id)
            .filter(|e| host_id.is_none() || e.host_id == host_id)
            .cloned()
            .collect()
    }
}

/// An exclusive transaction over one cluster row and its hosts.
pub struct ClusterTx {
    store: Store,
    _guard: OwnedMutexGuard<()>,
    pub cluster: Cluster,
    hosts: BTreeMap<Uuid, Host>,
}

impl ClusterTx {
    /// Hosts ordered by id.
    pub fn hosts(&self) -> Vec<&Host> {
        self.hosts.values().collect()
    }

    pub fn hosts_snapshot(&self) -> Vec<Host> {
        self.hosts.values().cloned().collect()
    }

    pub fn host_ids(&self) -> Vec<Uuid> {
        self.hosts.keys().copied().collect()
    }

    pub fn host(&self, host_id: Uuid) -> ApiResult<&Host> {
        self.hosts
            .get(&host_id)
            .ok_or_else(|| ApiError::not_found("host", host_id))
    }

    pub fn host_mut(&mut self, host_id: Uuid) -> ApiResult<&mut Host> {
        self.hosts
            .get_mut(&host_id)
            .ok_or_else(|| ApiError::not_found("host", host_id))
    }

    pub fn contains_host(&self, host_id: Uuid) -> bool {
        self.hosts.contains_key(&host_id)
    }

    pub fn insert_host(&mut self, host: Host) {
        self.hosts.insert(host.id, host);
    }

    pub fn remove_host(&mut self, host_id: Uuid) -> ApiResult<Host> {
        self.hosts
            .remove(&host_id)
            .ok_or_else(|| ApiError::not_found("host", host_id))
    }

    /// Apply a mutation to every host, in id order.
    pub fn for_each_host_mut<F, E>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&Cluster, &mut Host) -> Result<(), E>,
    {
        for host in self.hosts.values_mut() {
            f(&self.cluster, host)?;
        }
        Ok(())
    }

    /// Publish the staged state. Dropping the transaction instead
    /// discards it.
    pub fn commit(mut self) -> ApiResult<()> {
        self.cluster.updated_at = Utc::now();
        let mut clusters = self.store.inner.clusters.write().unwrap();
        let row = clusters
            .get_mut(&self.cluster.id)
            .ok_or_else(|| ApiError::not_found("cluster", self.cluster.id))?;
        row.cluster = self.cluster.clone();
        row.hosts = std::mem::take(&mut self.hosts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateClusterRequest;

    fn cluster_fixture() -> Cluster {
        let params = CreateClusterRequest {
            name: "demo".to_string(),
            base_dns_domain: None,
            openshift_version: None,
            cluster_network_cidr: None,
            cluster_network_host_prefix: None,
            service_network_cidr: None,
            api_vip: None,
            ingress_vip: None,
            ssh_public_key: None,
            pull_secret: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        };
        Cluster::new(Uuid::new_v4(), params, "admin".to_string(), String::new())
    }

    #[tokio::test]
    async fn uncommitted_transaction_rolls_back() {
        let store = Store::new();
        let cluster = cluster_fixture();
        let id = cluster.id;
        store.insert_cluster(cluster).unwrap();

        {
            let mut tx = store.begin_exclusive(id).await.unwrap();
            tx.cluster.name = "changed".to_string();
            // dropped without commit
        }
        assert_eq!(store.get_cluster(id).unwrap().name, "demo");

        let mut tx = store.begin_exclusive(id).await.unwrap();
        tx.cluster.name = "changed".to_string();
        tx.commit().unwrap();
        assert_eq!(store.get_cluster(id).unwrap().name, "changed");
    }

    #[tokio::test]
    async fn exclusive_transactions_serialize() {
        let store = Store::new();
        let cluster = cluster_fixture();
        let id = cluster.id;
        store.insert_cluster(cluster).unwrap();

        let tx = store.begin_exclusive(id).await.unwrap();
        let store2 = store.clone();
        let contender = tokio::spawn(async move {
            let mut tx2 = store2.begin_exclusive(id).await.unwrap();
            tx2.cluster.status_info = "second".to_string();
            tx2.commit().unwrap();
        });
        // The contender cannot make progress until the first
        // transaction resolves.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(tx);
        contender.await.unwrap();
        assert_eq!(store.get_cluster(id).unwrap().status_info, "second");
    }

    #[tokio::test]
    async fn cascade_delete_removes_hosts() {
        let store = Store::new();
        let cluster = cluster_fixture();
        let id = cluster.id;
        store.insert_cluster(cluster).unwrap();

        let mut tx = store.begin_exclusive(id).await.unwrap();
        tx.insert_host(Host::new(Uuid::new_v4(), id, String::new()));
        tx.commit().unwrap();

        let (_, hosts) = store.remove_cluster(id).await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(store.get_cluster(id).is_err());
    }
}
