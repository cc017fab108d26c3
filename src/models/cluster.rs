use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::host::Host;

pub const DEFAULT_CLUSTER_NETWORK_CIDR: &str = "10.128.0.0/14";
pub const DEFAULT_CLUSTER_NETWORK_HOST_PREFIX: u8 = 23;
pub const DEFAULT_SERVICE_NETWORK_CIDR: &str = "172.30.0.0/16";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStatus {
    Insufficient,
    PendingForInput,
    Ready,
    PreparingForInstallation,
    Installing,
    Finalizing,
    Installed,
    AddingHosts,
    Cancelled,
    Error,
    InstallingPendingUserAction,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Insufficient => "insufficient",
            ClusterStatus::PendingForInput => "pending-for-input",
            ClusterStatus::Ready => "ready",
            ClusterStatus::PreparingForInstallation => "preparing-for-installation",
            ClusterStatus::Installing => "installing",
            ClusterStatus::Finalizing => "finalizing",
            ClusterStatus::Installed => "installed",
            ClusterStatus::AddingHosts => "adding-hosts",
            ClusterStatus::Cancelled => "cancelled",
            ClusterStatus::Error => "error",
            ClusterStatus::InstallingPendingUserAction => "installing-pending-user-action",
        }
    }

    /// The installing family: an installation is in flight and
    /// cancellation is meaningful.
    pub fn is_installing(&self) -> bool {
        matches!(
            self,
            ClusterStatus::PreparingForInstallation
                | ClusterStatus::Installing
                | ClusterStatus::Finalizing
                | ClusterStatus::InstallingPendingUserAction
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Installed | ClusterStatus::Cancelled | ClusterStatus::Error
        )
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery-image metadata kept on the cluster row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(default)]
    pub ssh_public_key: String,
    #[serde(default)]
    pub generator_version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<i64>,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub base_dns_domain: String,
    #[serde(default)]
    pub openshift_version: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub cluster_network_cidr: String,
    #[serde(default)]
    pub cluster_network_host_prefix: u8,
    #[serde(default)]
    pub service_network_cidr: String,
    #[serde(default)]
    pub machine_network_cidr: String,
    #[serde(default)]
    pub api_vip: String,
    #[serde(default)]
    pub ingress_vip: String,
    #[serde(default)]
    pub vip_dhcp_allocation: bool,
    #[serde(default)]
    pub http_proxy: String,
    #[serde(default)]
    pub https_proxy: String,
    #[serde(default)]
    pub no_proxy: String,
    #[serde(default)]
    pub ssh_public_key: String,
    // The raw secret never leaves the service; only the flag does.
    #[serde(skip_serializing, default)]
    pub pull_secret: String,
    #[serde(default)]
    pub pull_secret_set: bool,
    pub image_info: ImageInfo,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_info: String,
    pub status_updated_at: DateTime<Utc>,
    pub install_started_at: Option<DateTime<Utc>>,
    pub install_completed_at: Option<DateTime<Utc>>,
    /// JSON text: CIDR -> sorted host ids of the majority group.
    #[serde(default)]
    pub connectivity_majority_groups: String,
    /// JSON text: latest validation verdicts for the cluster snapshot.
    #[serde(default)]
    pub validations_info: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(id: Uuid, params: CreateClusterRequest, user_name: String, org_id: String) -> Self {
        let now = Utc::now();
        Cluster {
            id,
            name: params.name,
            base_dns_domain: params.base_dns_domain.unwrap_or_default(),
            openshift_version: params.openshift_version.unwrap_or_default(),
            user_name,
            org_id,
            cluster_network_cidr: params
                .cluster_network_cidr
                .unwrap_or_else(|| DEFAULT_CLUSTER_NETWORK_CIDR.to_string()),
            cluster_network_host_prefix: params
                .cluster_network_host_prefix
                .unwrap_or(DEFAULT_CLUSTER_NETWORK_HOST_PREFIX),
            service_network_cidr: params
                .service_network_cidr
                .unwrap_or_else(|| DEFAULT_SERVICE_NETWORK_CIDR.to_string()),
            machine_network_cidr: String::new(),
            api_vip: params.api_vip.unwrap_or_default(),
            ingress_vip: params.ingress_vip.unwrap_or_default(),
            vip_dhcp_allocation: false,
            http_proxy: params.http_proxy.unwrap_or_default(),
            https_proxy: params.https_proxy.unwrap_or_default(),
            no_proxy: params.no_proxy.unwrap_or_default(),
            ssh_public_key: params.ssh_public_key.unwrap_or_default(),
            pull_secret: String::new(),
            pull_secret_set: false,
            image_info: ImageInfo::default(),
            status: ClusterStatus::Insufficient,
            status_info: "cluster is insufficient".to_string(),
            status_updated_at: now,
            install_started_at: None,
            install_completed_at: None,
            connectivity_majority_groups: String::new(),
            validations_info: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_pull_secret(&mut self, pull_secret: String) {
        self.pull_secret_set = !pull_secret.is_empty();
        self.pull_secret = pull_secret;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub base_dns_domain: Option<String>,
    pub openshift_version: Option<String>,
    pub cluster_network_cidr: Option<String>,
    pub cluster_network_host_prefix: Option<u8>,
    pub service_network_cidr: Option<String>,
    pub api_vip: Option<String>,
    pub ingress_vip: Option<String>,
    pub ssh_public_key: Option<String>,
    pub pull_secret: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateClusterRequest {
    pub name: Option<String>,
    pub base_dns_domain: Option<String>,
    pub cluster_network_cidr: Option<String>,
    pub cluster_network_host_prefix: Option<u8>,
    pub service_network_cidr: Option<String>,
    pub machine_network_cidr: Option<String>,
    pub api_vip: Option<String>,
    pub ingress_vip: Option<String>,
    pub vip_dhcp_allocation: Option<bool>,
    pub ssh_public_key: Option<String>,
    pub pull_secret: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    #[serde(default)]
    pub hosts_roles: Vec<HostRoleUpdate>,
    #[serde(default)]
    pub hosts_names: Vec<HostNameUpdate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostRoleUpdate {
    pub id: Uuid,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostNameUpdate {
    pub id: Uuid,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageCreateParams {
    #[serde(default)]
    pub ssh_public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteInstallationRequest {
    pub is_success: bool,
    pub error_info: Option<String>,
}

/// CIDR -> hosts that reported an interface address inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostNetwork {
    pub cidr: String,
    pub host_ids: Vec<Uuid>,
}

/// What the cluster read endpoints return: the cluster plus its hosts
/// and the derived per-CIDR host aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterWithHosts {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub hosts: Vec<Host>,
    pub host_networks: Vec<HostNetwork>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub console_url: String,
}
