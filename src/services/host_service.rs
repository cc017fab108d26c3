// Host state machine. Mutators operate on the transaction's host copy;
// the caller commits. Status changes are recorded as events.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    Cluster, ConnectivityReport, EventSeverity, FreeNetworksAddresses, Host, HostProgressReport,
    HostRole, HostStage, HostStatus, Inventory, StepType,
};
use crate::services::validation::{self, ValidationStatus};
use crate::store::Store;

const BOOTSTRAP_STAGES: &[HostStage] = &[
    HostStage::StartingInstallation,
    HostStage::WaitingForControlPlane,
    HostStage::WritingImageToDisk,
    HostStage::Rebooting,
    HostStage::WaitingForUserAction,
    HostStage::Configuring,
    HostStage::Done,
];

const MASTER_STAGES: &[HostStage] = &[
    HostStage::StartingInstallation,
    HostStage::WritingImageToDisk,
    HostStage::Rebooting,
    HostStage::WaitingForUserAction,
    HostStage::Configuring,
    HostStage::Joined,
    HostStage::Done,
];

const WORKER_STAGES: &[HostStage] = &[
    HostStage::StartingInstallation,
    HostStage::WritingImageToDisk,
    HostStage::Rebooting,
    HostStage::WaitingForUserAction,
    HostStage::Configuring,
    HostStage::Joined,
    HostStage::Done,
];

#[derive(Clone)]
pub struct HostService {
    store: Store,
    disconnection_timeout: Duration,
}

impl HostService {
    pub fn new(store: Store, disconnection_timeout: Duration) -> Self {
        HostService {
            store,
            disconnection_timeout,
        }
    }

    fn move_status(&self, host: &mut Host, status: HostStatus, info: impl Into<String>) {
        let info = info.into();
        if host.status != status {
            tracing::info!(
                "host {} in cluster {}: {} -> {} ({})",
                host.id,
                host.cluster_id,
                host.status,
                status,
                info
            );
            self.store.add_event(
                host.cluster_id,
                Some(host.id),
                EventSeverity::Info,
                format!(
                    "Host {}: updated status from \"{}\" to \"{}\" ({})",
                    host.hostname(),
                    host.status,
                    status,
                    info
                ),
            );
            host.status = status;
            host.status_updated_at = Utc::now();
        }
        host.status_info = info;
        host.updated_at = Utc::now();
    }

    /// Re-registration of a known host id: the agent restarted or the
    /// image was rebooted. Allowed only while the host is still in
    /// discovery; resets the discovery data.
    pub fn re_register(&self, host: &mut Host) -> ApiResult<()> {
        if !host.status.is_discovery() {
            return Err(ApiError::Forbidden(format!(
                "Host {} is in status {} and can not be registered again",
                host.id, host.status
            )));
        }
        host.inventory.clear();
        host.connectivity.clear();
        host.free_addresses.clear();
        host.progress = Default::default();
        host.bootstrap = false;
        host.checked_in_at = Utc::now();
        self.move_status(
            host,
            HostStatus::Discovering,
            "waiting for host to send hardware details",
        );
        Ok(())
    }

    pub fn update_inventory(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        host: &mut Host,
        inventory_json: &str,
    ) -> ApiResult<()> {
        if !host.status.is_discovery() {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not update inventory",
                host.id, host.status
            )));
        }
        let _: Inventory = serde_json::from_str(inventory_json).map_err(|e| {
            ApiError::BadInput(format!("Failed to parse inventory of host {}: {}", host.id, e))
        })?;
        host.inventory = inventory_json.to_string();
        self.refresh_status(cluster, hosts, host, Utc::now())
    }

    pub fn update_connectivity_report(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        host: &mut Host,
        report_json: &str,
    ) -> ApiResult<()> {
        let _: ConnectivityReport = serde_json::from_str(report_json).map_err(|e| {
            ApiError::BadInput(format!(
                "Failed to parse connectivity report of host {}: {}",
                host.id, e
            ))
        })?;
        host.connectivity = report_json.to_string();
        self.refresh_status(cluster, hosts, host, Utc::now())
    }

    pub fn update_free_addresses(&self, host: &mut Host, report_json: &str) -> ApiResult<()> {
        let report: FreeNetworksAddresses = serde_json::from_str(report_json).map_err(|e| {
            ApiError::BadInput(format!(
                "Failed to parse free addresses of host {}: {}",
                host.id, e
            ))
        })?;
        if report.is_empty() {
            return Err(ApiError::BadInput(format!(
                "Free addresses report for host {} is empty",
                host.id
            )));
        }
        host.free_addresses = report_json.to_string();
        host.updated_at = Utc::now();
        Ok(())
    }

    /// Re-evaluate a discovery-family host against the snapshot: mark
    /// it disconnected when the agent stopped checking in, otherwise
    /// derive the status from the validation verdicts.
    pub fn refresh_status(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        host: &mut Host,
        now: DateTime<Utc>,
    ) -> ApiResult<()> {
        if !host.status.is_discovery() {
            return Ok(());
        }
        if now - host.checked_in_at >= self.disconnection_timeout {
            self.move_status(
                host,
                HostStatus::Disconnected,
                format!("host has stopped communicating since {}", host.checked_in_at),
            );
            return Ok(());
        }
        if host.inventory.is_empty() {
            self.move_status(
                host,
                HostStatus::Discovering,
                "waiting for host to send hardware details",
            );
            return Ok(());
        }
        let validations = validation::evaluate_host(cluster, hosts, host);
        if validation::any_failure(&validations) {
            let reasons = validation::failure_messages(&validations).join("; ");
            self.move_status(host, HostStatus::Insufficient, reasons);
        } else if validations
            .values()
            .any(|v| v.status == ValidationStatus::Pending)
        {
            let reasons = validation::failure_messages(&validations).join("; ");
            self.move_status(host, HostStatus::PendingForInput, reasons);
        } else {
            self.move_status(host, HostStatus::Known, "Host is ready to be installed");
        }
        Ok(())
    }

    pub fn update_role(&self, cluster: &Cluster, host: &mut Host, role: HostRole) -> ApiResult<()> {
        if cluster.status.is_installing() {
            return Err(ApiError::Conflict(format!(
                "Can not update role of host {} while cluster {} is {}",
                host.id, cluster.id, cluster.status
            )));
        }
        if !host.status.is_discovery() {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and its role can not change",
                host.id, host.status
            )));
        }
        host.role = role;
        host.updated_at = Utc::now();
        Ok(())
    }

    pub fn update_hostname(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        host: &mut Host,
        hostname: &str,
    ) -> ApiResult<()> {
        if cluster.status.is_installing() {
            return Err(ApiError::Conflict(format!(
                "Can not update hostname of host {} while cluster {} is {}",
                host.id, cluster.id, cluster.status
            )));
        }
        let shape = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("hostname pattern is valid");
        if hostname.is_empty() || hostname.len() > 253 || !shape.is_match(hostname) {
            return Err(ApiError::BadInput(format!(
                "Hostname {} is not a valid RFC-1123 name",
                hostname
            )));
        }
        let collision = hosts
            .iter()
            .any(|other| other.id != host.id && other.hostname() == hostname);
        if collision {
            return Err(ApiError::Conflict(format!(
                "Hostname {} is already in use in cluster {}",
                hostname, cluster.id
            )));
        }
        host.requested_hostname = hostname.to_string();
        host.updated_at = Utc::now();
        Ok(())
    }

    pub fn prepare_for_installation(&self, host: &mut Host) -> ApiResult<()> {
        if host.status != HostStatus::Known {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and is not ready for installation",
                host.id, host.status
            )));
        }
        self.move_status(
            host,
            HostStatus::PreparingForInstallation,
            "Host is preparing for installation",
        );
        Ok(())
    }

    /// Peers finished preparing; the host may now receive the install
    /// instruction.
    pub fn promote_prepared(&self, host: &mut Host) -> ApiResult<()> {
        if host.status != HostStatus::PreparingForInstallation {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not finish preparation",
                host.id, host.status
            )));
        }
        self.move_status(
            host,
            HostStatus::PreparingSuccessful,
            "Host finished successfully to prepare for installation",
        );
        Ok(())
    }

    /// The install transaction moved the whole cluster together, so a
    /// host still in preparing-for-installation is acceptable here.
    pub fn install(&self, host: &mut Host) -> ApiResult<()> {
        match host.status {
            HostStatus::PreparingForInstallation | HostStatus::PreparingSuccessful => {
                host.progress = Default::default();
                self.move_status(host, HostStatus::Installing, "Installation is in progress");
                Ok(())
            }
            status => Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not begin installation",
                host.id, status
            ))),
        }
    }

    pub fn set_bootstrap(&self, host: &mut Host, bootstrap: bool) {
        if host.bootstrap != bootstrap {
            host.bootstrap = bootstrap;
            host.updated_at = Utc::now();
            if bootstrap {
                self.store.add_event(
                    host.cluster_id,
                    Some(host.id),
                    EventSeverity::Info,
                    format!("Host {}: set as bootstrap", host.hostname()),
                );
            }
        }
    }

    pub fn stages_by_role(&self, role: HostRole, bootstrap: bool) -> Vec<HostStage> {
        if bootstrap {
            return BOOTSTRAP_STAGES.to_vec();
        }
        match role {
            HostRole::Master => MASTER_STAGES.to_vec(),
            _ => WORKER_STAGES.to_vec(),
        }
    }

    /// Progress is monotonic along the role's stage list; regressions
    /// and stages outside the list are rejected.
    pub fn update_install_progress(
        &self,
        host: &mut Host,
        progress: &HostProgressReport,
    ) -> ApiResult<()> {
        if !matches!(
            host.status,
            HostStatus::Installing
                | HostStatus::InstallingInProgress
                | HostStatus::InstallingPendingUserAction
        ) {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not report progress",
                host.id, host.status
            )));
        }
        let stages = self.stages_by_role(host.role, host.bootstrap);
        let new_index = stages
            .iter()
            .position(|s| *s == progress.current_stage)
            .or_else(|| (progress.current_stage == HostStage::Failed).then_some(usize::MAX))
            .ok_or_else(|| {
                ApiError::BadInput(format!(
                    "Stage {} is not part of the stages of a {} host",
                    progress.current_stage, host.role
                ))
            })?;
        if let Some(current_stage) = host.progress.current_stage {
            let current_index = stages
                .iter()
                .position(|s| *s == current_stage)
                .unwrap_or(usize::MAX);
            if new_index != usize::MAX && new_index < current_index {
                return Err(ApiError::Conflict(format!(
                    "Host {} can not regress from stage {} to {}",
                    host.id, current_stage, progress.current_stage
                )));
            }
        }
        host.progress.current_stage = Some(progress.current_stage);
        host.progress.progress_info = progress.progress_info.clone();
        host.progress.stage_updated_at = Some(Utc::now());
        match progress.current_stage {
            HostStage::Done => {
                self.move_status(host, HostStatus::Installed, "Installation completed")
            }
            HostStage::Failed => self.move_status(
                host,
                HostStatus::Error,
                format!("Installation failed: {}", progress.progress_info),
            ),
            HostStage::WaitingForUserAction => self.move_status(
                host,
                HostStatus::InstallingPendingUserAction,
                format!("Waiting for user action: {}", progress.progress_info),
            ),
            stage => self.move_status(
                host,
                HostStatus::InstallingInProgress,
                format!("Installation in progress: {}", stage),
            ),
        }
        Ok(())
    }

    /// The agent reported a failed install step.
    pub fn handle_installation_failure(&self, host: &mut Host, reason: &str) -> ApiResult<()> {
        if !host.status.is_installing() {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not fail installation",
                host.id, host.status
            )));
        }
        self.store.add_event(
            host.cluster_id,
            Some(host.id),
            EventSeverity::Error,
            format!("Host {}: installation failed: {}", host.hostname(), reason),
        );
        self.move_status(host, HostStatus::Error, format!("installation failed: {}", reason));
        Ok(())
    }

    pub fn disable(&self, host: &mut Host) -> ApiResult<()> {
        if !host.status.is_discovery() {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not be disabled",
                host.id, host.status
            )));
        }
        self.move_status(host, HostStatus::Disabled, "Host was disabled by user");
        Ok(())
    }

    pub fn enable(&self, host: &mut Host) -> ApiResult<()> {
        if host.status != HostStatus::Disabled {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not be enabled",
                host.id, host.status
            )));
        }
        host.inventory.clear();
        host.connectivity.clear();
        host.free_addresses.clear();
        self.move_status(
            host,
            HostStatus::Discovering,
            "waiting for host to send hardware details",
        );
        Ok(())
    }

    pub fn cancel_installation(&self, host: &mut Host, reason: &str) -> ApiResult<()> {
        if host.status == HostStatus::Disabled {
            return Ok(());
        }
        self.move_status(host, HostStatus::Cancelled, reason.to_string());
        Ok(())
    }

    /// Reset keeps the registration but sends the host back to the
    /// beginning of discovery.
    pub fn reset_host(&self, host: &mut Host, reason: &str) -> ApiResult<()> {
        if host.status == HostStatus::Disabled {
            return Ok(());
        }
        host.progress = Default::default();
        host.logs_state = Default::default();
        host.bootstrap = false;
        self.move_status(host, HostStatus::Discovering, reason.to_string());
        Ok(())
    }

    /// The ordered step plan for the host's current state. The step
    /// dispatcher turns these into concrete agent instructions.
    pub fn next_step_types(&self, cluster: &Cluster, host: &Host) -> Vec<StepType> {
        match host.status {
            HostStatus::Discovering => vec![StepType::Inventory],
            HostStatus::Known
            | HostStatus::Insufficient
            | HostStatus::PendingForInput
            | HostStatus::Disconnected => {
                let mut plan = vec![
                    StepType::Inventory,
                    StepType::ConnectivityCheck,
                    StepType::FreeNetworkAddresses,
                ];
                if cluster.vip_dhcp_allocation && !cluster.machine_network_cidr.is_empty() {
                    plan.push(StepType::DhcpLeaseAllocate);
                }
                plan
            }
            HostStatus::Installing => vec![StepType::Install],
            HostStatus::ResettingPendingUserAction => vec![StepType::ResetInstallation],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateClusterRequest;
    use uuid::Uuid;

    fn service() -> HostService {
        HostService::new(Store::new(), Duration::hours(1))
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

    fn installing_host(cluster_id: Uuid) -> Host {
        let mut host = Host::new(Uuid::new_v4(), cluster_id, String::new());
        host.role = HostRole::Master;
        host.status = HostStatus::Installing;
        host
    }

    #[test]
    fn progress_must_not_regress() {
        let svc = service();
        let c = cluster();
        let mut host = installing_host(c.id);

        svc.update_install_progress(
            &mut host,
            &HostProgressReport {
                current_stage: HostStage::WritingImageToDisk,
                progress_info: String::new(),
            },
        )
        .unwrap();
        assert_eq!(host.status, HostStatus::InstallingInProgress);

        let regress = svc.update_install_progress(
            &mut host,
            &HostProgressReport {
                current_stage: HostStage::StartingInstallation,
                progress_info: String::new(),
            },
        );
        assert!(matches!(regress, Err(ApiError::Conflict(_))));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let svc = service();
        let c = cluster();
        let mut host = installing_host(c.id);
        // waiting-for-control-plane belongs to the bootstrap only
        let err = svc.update_install_progress(
            &mut host,
            &HostProgressReport {
                current_stage: HostStage::WaitingForControlPlane,
                progress_info: String::new(),
            },
        );
        assert!(matches!(err, Err(ApiError::BadInput(_))));
    }

    #[test]
    fn done_stage_completes_the_host() {
        let svc = service();
        let c = cluster();
        let mut host = installing_host(c.id);
        for stage in [
            HostStage::StartingInstallation,
            HostStage::WritingImageToDisk,
            HostStage::Rebooting,
            HostStage::Configuring,
            HostStage::Joined,
            HostStage::Done,
        ] {
            svc.update_install_progress(
                &mut host,
                &HostProgressReport {
                    current_stage: stage,
                    progress_info: String::new(),
                },
            )
            .unwrap();
        }
        assert_eq!(host.status, HostStatus::Installed);
    }

    #[test]
    fn disable_is_rejected_while_installing() {
        let svc = service();
        let c = cluster();
        let mut host = installing_host(c.id);
        assert!(matches!(svc.disable(&mut host), Err(ApiError::Conflict(_))));
        assert_eq!(host.status, HostStatus::Installing);
    }

    #[test]
    fn enable_returns_to_discovering() {
        let svc = service();
        let c = cluster();
        let mut host = Host::new(Uuid::new_v4(), c.id, String::new());
        host.inventory = "{}".to_string();
        svc.disable(&mut host).unwrap();
        svc.enable(&mut host).unwrap();
        assert_eq!(host.status, HostStatus::Discovering);
        assert!(host.inventory.is_empty());
    }

    #[test]
    fn stale_check_in_disconnects() {
        let svc = service();
        let c = cluster();
        let mut host = Host::new(Uuid::new_v4(), c.id, String::new());
        let later = Utc::now() + Duration::hours(2);
        svc.refresh_status(&c, &[host.clone()], &mut host, later).unwrap();
        assert_eq!(host.status, HostStatus::Disconnected);
    }

    #[test]
    fn hostname_shape_is_enforced() {
        let svc = service();
        let c = cluster();
        let mut host = Host::new(Uuid::new_v4(), c.id, String::new());
        assert!(svc
            .update_hostname(&c, &[host.clone()], &mut host, "Not_A_Hostname")
            .is_err());
        assert!(svc
            .update_hostname(&c, &[host.clone()], &mut host, "node-0.example.com")
            .is_ok());
    }
}
