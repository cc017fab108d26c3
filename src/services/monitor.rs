// Background monitor: the leader periodically re-evaluates every
// active cluster and host so time- and quorum-based transitions happen
// without external traffic. Each host refresh runs in its own short
// transaction; a tick is abandoned as soon as leadership is lost.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{ClusterStatus, Host, HostStatus, LogsState};
use crate::services::cluster_service::ClusterService;
use crate::services::host_service::HostService;
use crate::store::Store;

pub trait LeaderElector: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-instance deployments are always the leader.
pub struct AlwaysLeader;

impl LeaderElector for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct MonitorService {
    store: Store,
    host_service: HostService,
    cluster_service: ClusterService,
    leader: Arc<dyn LeaderElector>,
    interval: std::time::Duration,
    batch_size: usize,
}

impl MonitorService {
    pub fn new(
        store: Store,
        host_service: HostService,
        cluster_service: ClusterService,
        leader: Arc<dyn LeaderElector>,
        interval: std::time::Duration,
        batch_size: usize,
    ) -> Self {
        MonitorService {
            store,
            host_service,
            cluster_service,
            leader,
            interval,
            batch_size,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// Hosts that already failed or were cancelled stay monitored only
    /// while log collection is still expected.
    fn skip_monitoring(host: &Host) -> bool {
        matches!(host.status, HostStatus::Error | HostStatus::Cancelled)
            && matches!(
                host.logs_state,
                LogsState::Completed | LogsState::Timeout | LogsState::Empty
            )
    }

    pub async fn tick(&self) {
        if !self.leader.is_leader() {
            tracing::debug!("not a leader, skipping monitor tick");
            return;
        }
        tracing::debug!("running monitor tick");
        let cluster_ids = self.store.cluster_ids_with_hosts();
        for batch in cluster_ids.chunks(self.batch_size.max(1)) {
            for cluster_id in batch {
                if !self.leader.is_leader() {
                    tracing::debug!("leadership lost, abandoning monitor tick");
                    return;
                }
                if let Err(e) = self.monitor_cluster(*cluster_id).await {
                    tracing::error!("failed to monitor cluster {}: {}", cluster_id, e);
                }
            }
        }
    }

    async fn monitor_cluster(&self, cluster_id: Uuid) -> ApiResult<()> {
        let host_ids: Vec<Uuid> = {
            let (_, hosts) = self.store.get_cluster_with_hosts(cluster_id)?;
            hosts.iter().map(|h| h.id).collect()
        };

        for host_id in host_ids {
            if !self.leader.is_leader() {
                return Ok(());
            }
            if let Err(e) = self.refresh_one_host(cluster_id, host_id).await {
                tracing::error!("failed to refresh host {} state: {}", host_id, e);
            }
        }

        // cluster-level aggregation in its own transaction
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let hosts = tx.hosts_snapshot();
        match tx.cluster.status {
            ClusterStatus::Insufficient
            | ClusterStatus::PendingForInput
            | ClusterStatus::Ready => {
                self.cluster_service.refresh_status(&mut tx.cluster, &hosts)?;
            }
            ClusterStatus::Installing | ClusterStatus::InstallingPendingUserAction => {
                self.cluster_service.refresh_installing(&mut tx.cluster, &hosts)?;
            }
            _ => {}
        }
        tx.commit()
    }

    async fn refresh_one_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<()> {
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        if !tx.contains_host(host_id) {
            return Ok(()); // deregistered since the listing
        }
        let cluster = tx.cluster.clone();
        let hosts = tx.hosts_snapshot();
        let peers_prepared = hosts.iter().filter(|h| h.id != host_id).all(|h| {
            matches!(
                h.status,
                HostStatus::PreparingForInstallation
                    | HostStatus::PreparingSuccessful
                    | HostStatus::Disabled
            )
        });
        let host = tx.host_mut(host_id)?;
        if Self::skip_monitoring(host) {
            return Ok(());
        }
        match host.status {
            status if status.is_discovery() => {
                self.host_service
                    .refresh_status(&cluster, &hosts, host, Utc::now())?;
            }
            HostStatus::PreparingForInstallation if peers_prepared => {
                self.host_service.promote_prepared(host)?;
            }
            _ => {}
        }
        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateClusterRequest, Cluster};
    use chrono::Duration;

    fn fixture() -> (Store, MonitorService) {
        let store = Store::new();
        let host_service = HostService::new(store.clone(), Duration::hours(1));
        let cluster_service = ClusterService::new(store.clone());
        let monitor = MonitorService::new(
            store.clone(),
            host_service,
            cluster_service,
            Arc::new(AlwaysLeader),
            std::time::Duration::from_secs(10),
            100,
        );
        (store, monitor)
    }

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
        Cluster::new(Uuid::new_v4(), params, String::new(), String::new())
    }

    #[tokio::test]
    async fn tick_disconnects_silent_hosts() {
        let (store, monitor) = fixture();
        let cluster = cluster_fixture();
        let cluster_id = cluster.id;
        store.insert_cluster(cluster).unwrap();
        let mut tx = store.begin_exclusive(cluster_id).await.unwrap();
        let mut host = Host::new(Uuid::new_v4(), cluster_id, String::new());
        host.checked_in_at = Utc::now() - Duration::hours(2);
        let host_id = host.id;
        tx.insert_host(host);
        tx.commit().unwrap();

        monitor.tick().await;

        let host = store.get_host(cluster_id, host_id).unwrap();
        assert_eq!(host.status, HostStatus::Disconnected);
    }

    #[tokio::test]
    async fn tick_promotes_prepared_peers() {
        let (store, monitor) = fixture();
        let cluster = cluster_fixture();
        let cluster_id = cluster.id;
        store.insert_cluster(cluster).unwrap();
        let mut tx = store.begin_exclusive(cluster_id).await.unwrap();
        tx.cluster.status = ClusterStatus::PreparingForInstallation;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut host = Host::new(Uuid::new_v4(), cluster_id, String::new());
            host.status = HostStatus::PreparingForInstallation;
            ids.push(host.id);
            tx.insert_host(host);
        }
        tx.commit().unwrap();

        monitor.tick().await;

        for id in ids {
            let host = store.get_host(cluster_id, id).unwrap();
            assert_eq!(host.status, HostStatus::PreparingSuccessful);
        }
    }
}
