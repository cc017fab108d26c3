use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStatus {
    Discovering,
    Known,
    Disconnected,
    Insufficient,
    PendingForInput,
    PreparingForInstallation,
    PreparingSuccessful,
    Installing,
    InstallingInProgress,
    Installed,
    InstallingPendingUserAction,
    ResettingPendingUserAction,
    Cancelled,
    Error,
    Disabled,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Discovering => "discovering",
            HostStatus::Known => "known",
            HostStatus::Disconnected => "disconnected",
            HostStatus::Insufficient => "insufficient",
            HostStatus::PendingForInput => "pending-for-input",
            HostStatus::PreparingForInstallation => "preparing-for-installation",
            HostStatus::PreparingSuccessful => "preparing-successful",
            HostStatus::Installing => "installing",
            HostStatus::InstallingInProgress => "installing-in-progress",
            HostStatus::Installed => "installed",
            HostStatus::InstallingPendingUserAction => "installing-pending-user-action",
            HostStatus::ResettingPendingUserAction => "resetting-pending-user-action",
            HostStatus::Cancelled => "cancelled",
            HostStatus::Error => "error",
            HostStatus::Disabled => "disabled",
        }
    }

    /// Discovery family: the agent is reporting and the host has not
    /// yet been committed to an installation.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            HostStatus::Discovering
                | HostStatus::Known
                | HostStatus::Disconnected
                | HostStatus::Insufficient
                | HostStatus::PendingForInput
        )
    }

    pub fn is_installing(&self) -> bool {
        matches!(
            self,
            HostStatus::PreparingForInstallation
                | HostStatus::PreparingSuccessful
                | HostStatus::Installing
                | HostStatus::InstallingInProgress
                | HostStatus::InstallingPendingUserAction
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostStatus::Installed | HostStatus::Error | HostStatus::Disabled | HostStatus::Cancelled
        )
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Auto,
    Master,
    Worker,
}

impl HostRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostRole::Auto => "auto",
            HostRole::Master => "master",
            HostRole::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<HostRole> {
        match s {
            "auto" => Some(HostRole::Auto),
            "master" => Some(HostRole::Master),
            "worker" => Some(HostRole::Worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsState {
    Empty,
    Requested,
    Collecting,
    Completed,
    Timeout,
}

impl Default for LogsState {
    fn default() -> Self {
        LogsState::Empty
    }
}

/// Installation stages as reported by the agent. The per-role ordered
/// stage lists live in the host service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStage {
    StartingInstallation,
    WaitingForControlPlane,
    WritingImageToDisk,
    Rebooting,
    WaitingForUserAction,
    Configuring,
    Joined,
    Done,
    Failed,
}

impl std::fmt::Display for HostStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStage::StartingInstallation => "starting-installation",
            HostStage::WaitingForControlPlane => "waiting-for-control-plane",
            HostStage::WritingImageToDisk => "writing-image-to-disk",
            HostStage::Rebooting => "rebooting",
            HostStage::WaitingForUserAction => "waiting-for-user-action",
            HostStage::Configuring => "configuring",
            HostStage::Joined => "joined",
            HostStage::Done => "done",
            HostStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostProgressInfo {
    pub current_stage: Option<HostStage>,
    #[serde(default)]
    pub progress_info: String,
    pub stage_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostProgressReport {
    pub current_stage: HostStage,
    #[serde(default)]
    pub progress_info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub status: HostStatus,
    #[serde(default)]
    pub status_info: String,
    pub status_updated_at: DateTime<Utc>,
    pub role: HostRole,
    #[serde(default)]
    pub bootstrap: bool,
    /// Raw JSON as reported by the agent, already schema-filtered.
    #[serde(default)]
    pub inventory: String,
    #[serde(default)]
    pub connectivity: String,
    #[serde(default)]
    pub free_addresses: String,
    pub progress: HostProgressInfo,
    /// Stages the host is expected to pass, derived from role.
    #[serde(default)]
    pub progress_stages: Vec<HostStage>,
    #[serde(default)]
    pub requested_hostname: String,
    #[serde(default)]
    pub discovery_agent_version: String,
    #[serde(default)]
    pub logs_state: LogsState,
    pub checked_in_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    pub fn new(id: Uuid, cluster_id: Uuid, discovery_agent_version: String) -> Self {
        let now = Utc::now();
        Host {
            id,
            cluster_id,
            status: HostStatus::Discovering,
            status_info: "waiting for host to send hardware details".to_string(),
            status_updated_at: now,
            role: HostRole::Auto,
            bootstrap: false,
            inventory: String::new(),
            connectivity: String::new(),
            free_addresses: String::new(),
            progress: HostProgressInfo::default(),
            progress_stages: Vec::new(),
            requested_hostname: String::new(),
            discovery_agent_version,
            logs_state: LogsState::Empty,
            checked_in_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Effective hostname: the user-requested one wins over whatever
    /// the inventory discovered.
    pub fn hostname(&self) -> String {
        if !self.requested_hostname.is_empty() {
            return self.requested_hostname.clone();
        }
        self.parsed_inventory()
            .map(|i| i.hostname)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn parsed_inventory(&self) -> Option<Inventory> {
        if self.inventory.is_empty() {
            return None;
        }
        serde_json::from_str(&self.inventory).ok()
    }

    pub fn parsed_connectivity(&self) -> Option<ConnectivityReport> {
        if self.connectivity.is_empty() {
            return None;
        }
        serde_json::from_str(&self.connectivity).ok()
    }

    pub fn parsed_free_addresses(&self) -> Option<FreeNetworksAddresses> {
        if self.free_addresses.is_empty() {
            return None;
        }
        serde_json::from_str(&self.free_addresses).ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterHostRequest {
    pub host_id: Uuid,
    #[serde(default)]
    pub discovery_agent_version: String,
}

// --- agent report payloads ---------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub model_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub physical_bytes: u64,
    #[serde(default)]
    pub usable_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub drive_type: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mac_address: String,
    /// Addresses in CIDR notation, e.g. "192.168.1.10/24".
    #[serde(default)]
    pub ipv4_addresses: Vec<String>,
    #[serde(default)]
    pub ipv6_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemVendor {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub virtual_machine: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub system_vendor: SystemVendor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L2Connectivity {
    #[serde(default)]
    pub outgoing_ip_address: String,
    #[serde(default)]
    pub remote_ip_address: String,
    #[serde(default)]
    pub successful: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L3Connectivity {
    #[serde(default)]
    pub remote_ip_address: String,
    #[serde(default)]
    pub successful: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityRemoteHost {
    pub host_id: Uuid,
    #[serde(default)]
    pub l2_connectivity: Vec<L2Connectivity>,
    #[serde(default)]
    pub l3_connectivity: Vec<L3Connectivity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityReport {
    #[serde(default)]
    pub remote_hosts: Vec<ConnectivityRemoteHost>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreeNetworkAddresses {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub free_addresses: Vec<String>,
}

pub type FreeNetworksAddresses = Vec<FreeNetworkAddresses>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DhcpAllocationResponse {
    #[serde(default)]
    pub api_vip_address: String,
    #[serde(default)]
    pub ingress_vip_address: String,
}
