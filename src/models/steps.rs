use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Inventory,
    ConnectivityCheck,
    FreeNetworkAddresses,
    DhcpLeaseAllocate,
    Install,
    ResetInstallation,
    Execute,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Inventory => "inventory",
            StepType::ConnectivityCheck => "connectivity-check",
            StepType::FreeNetworkAddresses => "free-network-addresses",
            StepType::DhcpLeaseAllocate => "dhcp-lease-allocate",
            StepType::Install => "install",
            StepType::ResetInstallation => "reset-installation",
            StepType::Execute => "execute",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction for the in-band agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub step_type: StepType,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reply_timeout_s: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Steps {
    #[serde(default)]
    pub instructions: Vec<Step>,
}

/// The agent's report for one executed step.
#[derive(Debug, Clone, Deserialize)]
pub struct StepReply {
    pub step_id: String,
    pub step_type: StepType,
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugStepRequest {
    pub command: String,
}
