// Cluster state machine. Like the host service, mutators work on the
// transaction's cluster copy and the orchestrator commits.

use chrono::Utc;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::models::{Cluster, ClusterStatus, EventSeverity, Host, HostStatus};
use crate::services::{connectivity, validation};
use crate::store::Store;

#[derive(Clone)]
pub struct ClusterService {
    store: Store,
}

impl ClusterService {
    pub fn new(store: Store) -> Self {
        ClusterService { store }
    }

    fn move_status(&self, cluster: &mut Cluster, status: ClusterStatus, info: impl Into<String>) {
        let info = info.into();
        if cluster.status != status {
            tracing::info!(
                "cluster {}: {} -> {} ({})",
                cluster.id,
                cluster.status,
                status,
                info
            );
            self.store.add_event(
                cluster.id,
                None,
                EventSeverity::Info,
                format!(
                    "Updated status of cluster {} from \"{}\" to \"{}\" ({})",
                    cluster.name, cluster.status, status, info
                ),
            );
            cluster.status = status;
            cluster.status_updated_at = Utc::now();
        }
        cluster.status_info = info;
        cluster.updated_at = Utc::now();
    }

    /// Whether new hosts may join in the cluster's current state.
    pub fn accepts_registration(&self, cluster: &Cluster) -> ApiResult<()> {
        match cluster.status {
            ClusterStatus::Insufficient
            | ClusterStatus::Ready
            | ClusterStatus::PendingForInput
            | ClusterStatus::AddingHosts => Ok(()),
            status => Err(ApiError::Forbidden(format!(
                "Cluster {} is in status {} and can not accept new host registrations",
                cluster.id, status
            ))),
        }
    }

    pub fn verify_updatability(&self, cluster: &Cluster) -> ApiResult<()> {
        match cluster.status {
            ClusterStatus::Insufficient | ClusterStatus::Ready | ClusterStatus::PendingForInput => {
                Ok(())
            }
            status => Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and can not be updated",
                cluster.id, status
            ))),
        }
    }

    /// Pre-install re-evaluation: toggles among insufficient,
    /// pending-for-input and ready, and refreshes the stored
    /// validation and majority-group summaries.
    pub fn refresh_status(&self, cluster: &mut Cluster, hosts: &[Host]) -> ApiResult<ClusterStatus> {
        if !matches!(
            cluster.status,
            ClusterStatus::Insufficient | ClusterStatus::PendingForInput | ClusterStatus::Ready
        ) {
            return Ok(cluster.status);
        }
        let validations = validation::evaluate_cluster(cluster, hosts);
        cluster.validations_info = serde_json::to_string(&validations).unwrap_or_default();

        if !cluster.machine_network_cidr.is_empty() {
            let participating: Vec<Host> = hosts
                .iter()
                .filter(|h| h.status != HostStatus::Disabled)
                .cloned()
                .collect();
            let majority =
                connectivity::create_majority_group(&cluster.machine_network_cidr, &participating)
                    .unwrap_or_default();
            cluster.connectivity_majority_groups =
                json!({ &cluster.machine_network_cidr: majority }).to_string();
        }

        if validation::any_failure(&validations) {
            let reasons = validation::failure_messages(&validations).join("; ");
            self.move_status(cluster, ClusterStatus::Insufficient, reasons);
        } else if validation::all_success(&validations) {
            self.move_status(cluster, ClusterStatus::Ready, "Cluster ready to be installed");
        } else {
            let reasons = validation::failure_messages(&validations).join("; ");
            self.move_status(cluster, ClusterStatus::PendingForInput, reasons);
        }
        Ok(cluster.status)
    }

    pub fn is_ready_for_installation(&self, cluster: &Cluster) -> (bool, String) {
        if cluster.status == ClusterStatus::Ready {
            (true, String::new())
        } else {
            (
                false,
                format!(
                    "cluster is in status {}: {}",
                    cluster.status, cluster.status_info
                ),
            )
        }
    }

    pub fn prepare_for_installation(&self, cluster: &mut Cluster) -> ApiResult<()> {
        if cluster.status != ClusterStatus::Ready {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and can not begin installation",
                cluster.id, cluster.status
            )));
        }
        self.move_status(
            cluster,
            ClusterStatus::PreparingForInstallation,
            "Preparing cluster for installation",
        );
        Ok(())
    }

    /// Second stage of the install handoff. A cluster cancelled in the
    /// meantime refuses the transition.
    pub fn install(&self, cluster: &mut Cluster) -> ApiResult<()> {
        if cluster.status != ClusterStatus::PreparingForInstallation {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and can not start installation",
                cluster.id, cluster.status
            )));
        }
        cluster.install_started_at = Some(Utc::now());
        self.move_status(cluster, ClusterStatus::Installing, "Installation in progress");
        Ok(())
    }

    pub fn handle_pre_install_error(&self, cluster: &mut Cluster, error: &ApiError) {
        // A user cancellation beat the handoff; leave it be.
        if cluster.status == ClusterStatus::Cancelled {
            tracing::info!(
                "cluster {} was cancelled during the install handoff",
                cluster.id
            );
            return;
        }
        self.store.add_event(
            cluster.id,
            None,
            EventSeverity::Error,
            format!("Failed to prepare the installation: {}", error),
        );
        self.move_status(
            cluster,
            ClusterStatus::Error,
            format!("failed to prepare the installation: {}", error),
        );
    }

    /// Installing-family aggregation driven by host progress: pending
    /// user action surfaces on the cluster, and once every master is
    /// installed the cluster moves to finalizing.
    pub fn refresh_installing(&self, cluster: &mut Cluster, hosts: &[Host]) -> ApiResult<()> {
        if !matches!(
            cluster.status,
            ClusterStatus::Installing | ClusterStatus::InstallingPendingUserAction
        ) {
            return Ok(());
        }
        let pending_user_action = hosts
            .iter()
            .any(|h| h.status == HostStatus::InstallingPendingUserAction);
        if pending_user_action {
            self.move_status(
                cluster,
                ClusterStatus::InstallingPendingUserAction,
                "Installation is waiting for user action on a host",
            );
            return Ok(());
        }
        if cluster.status == ClusterStatus::InstallingPendingUserAction {
            self.move_status(cluster, ClusterStatus::Installing, "Installation in progress");
        }
        let masters: Vec<&Host> = hosts
            .iter()
            .filter(|h| h.status != HostStatus::Disabled)
            .filter(|h| h.role == crate::models::HostRole::Master)
            .collect();
        if !masters.is_empty() && masters.iter().all(|h| h.status == HostStatus::Installed) {
            self.move_status(
                cluster,
                ClusterStatus::Finalizing,
                "Control plane is installed, finalizing the cluster",
            );
        }
        Ok(())
    }

    /// The external finalizer confirms (or fails) the installation.
    /// Success additionally requires the merged ingress kubeconfig to
    /// be in place; the orchestrator verifies that before calling.
    pub fn complete_installation(
        &self,
        cluster: &mut Cluster,
        success: bool,
        error_info: Option<String>,
    ) -> ApiResult<()> {
        if cluster.status != ClusterStatus::Finalizing {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and its installation can not be completed",
                cluster.id, cluster.status
            )));
        }
        if success {
            cluster.install_completed_at = Some(Utc::now());
            self.move_status(cluster, ClusterStatus::Installed, "Cluster is installed");
        } else {
            let info = error_info.unwrap_or_else(|| "installation failed".to_string());
            self.store
                .add_event(cluster.id, None, EventSeverity::Error, info.clone());
            self.move_status(cluster, ClusterStatus::Error, info);
        }
        Ok(())
    }

    pub fn cancel_installation(&self, cluster: &mut Cluster, reason: &str) -> ApiResult<()> {
        if !cluster.status.is_installing() {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and its installation can not be cancelled",
                cluster.id, cluster.status
            )));
        }
        self.move_status(cluster, ClusterStatus::Cancelled, reason.to_string());
        Ok(())
    }

    pub fn reset_cluster(&self, cluster: &mut Cluster, reason: &str) -> ApiResult<()> {
        if !matches!(
            cluster.status,
            ClusterStatus::Cancelled | ClusterStatus::Error
        ) {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and can not be reset",
                cluster.id, cluster.status
            )));
        }
        cluster.install_started_at = None;
        cluster.install_completed_at = None;
        self.move_status(cluster, ClusterStatus::Insufficient, reason.to_string());
        Ok(())
    }

    /// VIPs arriving from a DHCP allocation report. Only meaningful
    /// before the installation starts.
    pub fn set_vips(&self, cluster: &mut Cluster, api_vip: &str, ingress_vip: &str) -> ApiResult<()> {
        if !matches!(
            cluster.status,
            ClusterStatus::Insufficient | ClusterStatus::PendingForInput | ClusterStatus::Ready
        ) {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and its VIPs can not change",
                cluster.id, cluster.status
            )));
        }
        if cluster.api_vip != api_vip || cluster.ingress_vip != ingress_vip {
            cluster.api_vip = api_vip.to_string();
            cluster.ingress_vip = ingress_vip.to_string();
            cluster.updated_at = Utc::now();
            self.store.add_event(
                cluster.id,
                None,
                EventSeverity::Info,
                format!(
                    "Cluster VIPs allocated by DHCP: api {} ingress {}",
                    api_vip, ingress_vip
                ),
            );
        }
        Ok(())
    }

    pub fn allow_ingress_cert_upload(&self, cluster: &Cluster) -> ApiResult<()> {
        match cluster.status {
            ClusterStatus::Finalizing | ClusterStatus::Installed => Ok(()),
            status => Err(ApiError::BadInput(format!(
                "Cluster {} is in status {} and the ingress certificate can not be uploaded",
                cluster.id, status
            ))),
        }
    }

    pub fn allow_kubeconfig_download(&self, cluster: &Cluster) -> ApiResult<()> {
        if cluster.status != ClusterStatus::Installed {
            return Err(ApiError::Conflict(format!(
                "Cluster {} is in status {}, the kubeconfig is available only after installation",
                cluster.id, cluster.status
            )));
        }
        Ok(())
    }

    pub fn allow_file_download(&self, cluster: &Cluster) -> ApiResult<()> {
        match cluster.status {
            ClusterStatus::Installing
            | ClusterStatus::Finalizing
            | ClusterStatus::Installed
            | ClusterStatus::InstallingPendingUserAction
            | ClusterStatus::Error
            | ClusterStatus::Cancelled => Ok(()),
            status => Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and its files are not available yet",
                cluster.id, status
            ))),
        }
    }

    pub fn allow_credentials(&self, cluster: &Cluster) -> ApiResult<()> {
        match cluster.status {
            ClusterStatus::Finalizing | ClusterStatus::Installed => Ok(()),
            status => Err(ApiError::Conflict(format!(
                "Cluster {} is in status {} and credentials are not available",
                cluster.id, status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateClusterRequest, HostRole};
    use uuid::Uuid;

    fn service() -> ClusterService {
        ClusterService::new(Store::new())
    }

    fn cluster() -> Cluster {
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

    #[test]
    fn install_requires_preparing_state() {
        let svc = service();
        let mut c = cluster();
        assert!(svc.install(&mut c).is_err());
        c.status = ClusterStatus::PreparingForInstallation;
        svc.install(&mut c).unwrap();
        assert_eq!(c.status, ClusterStatus::Installing);
        assert!(c.install_started_at.is_some());
    }

    #[test]
    fn cancel_is_limited_to_the_installing_family() {
        let svc = service();
        let mut c = cluster();
        assert!(svc.cancel_installation(&mut c, "user").is_err());
        c.status = ClusterStatus::Installing;
        svc.cancel_installation(&mut c, "user").unwrap();
        assert_eq!(c.status, ClusterStatus::Cancelled);
    }

    #[test]
    fn reset_only_from_terminal_failures() {
        let svc = service();
        let mut c = cluster();
        c.status = ClusterStatus::Installing;
        assert!(svc.reset_cluster(&mut c, "user").is_err());
        c.status = ClusterStatus::Cancelled;
        svc.reset_cluster(&mut c, "user").unwrap();
        assert_eq!(c.status, ClusterStatus::Insufficient);
    }

    #[test]
    fn pre_install_error_does_not_clobber_a_cancellation() {
        let svc = service();
        let mut c = cluster();
        c.status = ClusterStatus::Cancelled;
        svc.handle_pre_install_error(&mut c, &ApiError::Internal("dns down".to_string()));
        assert_eq!(c.status, ClusterStatus::Cancelled);

        c.status = ClusterStatus::PreparingForInstallation;
        svc.handle_pre_install_error(&mut c, &ApiError::Internal("dns down".to_string()));
        assert_eq!(c.status, ClusterStatus::Error);
    }

    #[test]
    fn masters_installed_moves_to_finalizing() {
        let svc = service();
        let mut c = cluster();
        c.status = ClusterStatus::Installing;
        let mut hosts = Vec::new();
        for _ in 0..3 {
            let mut h = Host::new(Uuid::new_v4(), c.id, String::new());
            h.role = HostRole::Master;
            h.status = HostStatus::Installed;
            hosts.push(h);
        }
        svc.refresh_installing(&mut c, &hosts).unwrap();
        assert_eq!(c.status, ClusterStatus::Finalizing);
    }

    #[test]
    fn pending_user_action_surfaces_and_clears() {
        let svc = service();
        let mut c = cluster();
        c.status = ClusterStatus::Installing;
        let mut h = Host::new(Uuid::new_v4(), c.id, String::new());
        h.role = HostRole::Master;
        h.status = HostStatus::InstallingPendingUserAction;
        svc.refresh_installing(&mut c, &[h.clone()]).unwrap();
        assert_eq!(c.status, ClusterStatus::InstallingPendingUserAction);

        h.status = HostStatus::InstallingInProgress;
        svc.refresh_installing(&mut c, &[h]).unwrap();
        assert_eq!(c.status, ClusterStatus::Installing);
    }
}
