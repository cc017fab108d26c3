// Pure validation evaluator. State machines consult these verdicts and
// never re-derive them. For one snapshot the output is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Cluster, Host, HostRole, HostStatus};
use crate::services::{connectivity, network};

pub const MASTER_COUNT: usize = 3;

const MASTER_MIN_CPU_CORES: u32 = 4;
const MASTER_MIN_RAM_BYTES: u64 = 16 * 1024 * 1024 * 1024;
const WORKER_MIN_CPU_CORES: u32 = 2;
const WORKER_MIN_RAM_BYTES: u64 = 8 * 1024 * 1024 * 1024;

const FORBIDDEN_PLATFORMS: &[&str] = &["OpenStack Compute"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Failure,
    /// Not enough data yet; user input or another report is needed.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: String,
}

impl ValidationResult {
    fn success(message: impl Into<String>) -> Self {
        ValidationResult {
            status: ValidationStatus::Success,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        ValidationResult {
            status: ValidationStatus::Failure,
            message: message.into(),
        }
    }

    fn pending(message: impl Into<String>) -> Self {
        ValidationResult {
            status: ValidationStatus::Pending,
            message: message.into(),
        }
    }
}

pub type ValidationMap = BTreeMap<String, ValidationResult>;

pub fn all_success(validations: &ValidationMap) -> bool {
    validations
        .values()
        .all(|v| v.status == ValidationStatus::Success)
}

pub fn any_failure(validations: &ValidationMap) -> bool {
    validations
        .values()
        .any(|v| v.status == ValidationStatus::Failure)
}

pub fn failure_messages(validations: &ValidationMap) -> Vec<String> {
    validations
        .values()
        .filter(|v| v.status != ValidationStatus::Success)
        .map(|v| v.message.clone())
        .collect()
}

fn min_requirements(role: HostRole) -> (u32, u64) {
    match role {
        HostRole::Master => (MASTER_MIN_CPU_CORES, MASTER_MIN_RAM_BYTES),
        HostRole::Worker | HostRole::Auto => (WORKER_MIN_CPU_CORES, WORKER_MIN_RAM_BYTES),
    }
}

/// The hosts that count toward cluster-level quorum decisions.
fn participating<'a>(hosts: &'a [Host]) -> impl Iterator<Item = &'a Host> {
    hosts.iter().filter(|h| h.status != HostStatus::Disabled)
}

/// Host-scoped verdicts for one host against the cluster snapshot.
pub fn evaluate_host(cluster: &Cluster, hosts: &[Host], host: &Host) -> ValidationMap {
    let mut out = ValidationMap::new();

    let inventory = host.parsed_inventory();
    out.insert(
        "has-inventory".to_string(),
        match &inventory {
            Some(_) => ValidationResult::success("Valid inventory exists for the host"),
            None => ValidationResult::pending("Waiting for the host to send its inventory"),
        },
    );

    let (min_cpu, min_ram) = min_requirements(host.role);
    match &inventory {
        Some(inv) => {
            out.insert(
                "has-min-cpu".to_string(),
                if inv.cpu.count >= min_cpu {
                    ValidationResult::success("Sufficient CPU cores")
                } else {
                    ValidationResult::failure(format!(
                        "Require at least {} CPU cores for {} role, found only {}",
                        min_cpu, host.role, inv.cpu.count
                    ))
                },
            );
            out.insert(
                "has-min-memory".to_string(),
                if inv.memory.physical_bytes >= min_ram {
                    ValidationResult::success("Sufficient RAM")
                } else {
                    ValidationResult::failure(format!(
                        "Require at least {} bytes of RAM for {} role, found only {}",
                        min_ram, host.role, inv.memory.physical_bytes
                    ))
                },
            );
            out.insert(
                "valid-platform".to_string(),
                if FORBIDDEN_PLATFORMS.contains(&inv.system_vendor.product_name.as_str()) {
                    ValidationResult::failure(format!(
                        "Platform {} is not supported",
                        inv.system_vendor.product_name
                    ))
                } else {
                    ValidationResult::success("Platform is allowed")
                },
            );
        }
        None => {
            for id in ["has-min-cpu", "has-min-memory", "valid-platform"] {
                out.insert(
                    id.to_string(),
                    ValidationResult::pending("Missing inventory"),
                );
            }
        }
    }

    out.insert(
        "role-defined".to_string(),
        if host.role == HostRole::Auto {
            ValidationResult::pending("Role is not yet selected for the host")
        } else {
            ValidationResult::success(format!("Role {} is selected", host.role))
        },
    );

    let hostname = host.hostname();
    let collision = participating(hosts)
        .any(|other| other.id != host.id && other.hostname() == hostname);
    out.insert(
        "hostname-unique".to_string(),
        if collision {
            ValidationResult::failure(format!(
                "Hostname {} is not unique in the cluster",
                hostname
            ))
        } else {
            ValidationResult::success(format!("Hostname {} is unique", hostname))
        },
    );

    if cluster.machine_network_cidr.is_empty() {
        out.insert(
            "belongs-to-machine-cidr".to_string(),
            ValidationResult::pending("Machine network CIDR is not yet set"),
        );
        out.insert(
            "belongs-to-majority-group".to_string(),
            ValidationResult::pending("Machine network CIDR is not yet set"),
        );
        return out;
    }

    let in_machine_cidr = inventory
        .as_ref()
        .map(|inv| {
            inv.interfaces.iter().any(|intf| {
                intf.ipv4_addresses
                    .iter()
                    .chain(intf.ipv6_addresses.iter())
                    .any(|addr| {
                        addr.split('/')
                            .next()
                            .map(|ip| {
                                network::ip_in_cidr(ip, &cluster.machine_network_cidr)
                                    .unwrap_or(false)
                            })
                            .unwrap_or(false)
                    })
            })
        })
        .unwrap_or(false);
    out.insert(
        "belongs-to-machine-cidr".to_string(),
        if in_machine_cidr {
            ValidationResult::success(format!(
                "Host belongs to machine network CIDR {}",
                cluster.machine_network_cidr
            ))
        } else {
            ValidationResult::failure(format!(
                "Host does not belong to machine network CIDR {}",
                cluster.machine_network_cidr
            ))
        },
    );

    // Majority groups only exist from 3 hosts on; below that the
    // verdict is not evaluated at all.
    let snapshot: Vec<Host> = participating(hosts).cloned().collect();
    if snapshot.len() >= MASTER_COUNT {
        let majority = connectivity::create_majority_group(&cluster.machine_network_cidr, &snapshot)
            .unwrap_or_default();
        out.insert(
            "belongs-to-majority-group".to_string(),
            if majority.contains(&host.id) {
                ValidationResult::success("Host has connectivity to the majority of hosts")
            } else {
                ValidationResult::failure(
                    "No connectivity to the majority of hosts in the cluster",
                )
            },
        );
    }

    out
}

/// Cluster-scoped verdicts over the whole snapshot.
pub fn evaluate_cluster(cluster: &Cluster, hosts: &[Host]) -> ValidationMap {
    let mut out = ValidationMap::new();

    let cidrs_defined = !cluster.cluster_network_cidr.is_empty()
        && !cluster.service_network_cidr.is_empty()
        && cluster.cluster_network_host_prefix > 0;
    out.insert(
        "cidrs-defined".to_string(),
        if cidrs_defined {
            ValidationResult::success("Cluster and service network CIDRs are defined")
        } else {
            ValidationResult::pending("Cluster or service network CIDR is missing")
        },
    );

    out.insert(
        "machine-cidr-defined".to_string(),
        if cluster.machine_network_cidr.is_empty() {
            if cluster.vip_dhcp_allocation {
                ValidationResult::pending("Machine network CIDR must be provided for VIP DHCP allocation")
            } else {
                ValidationResult::pending("Machine network CIDR is inferred once VIPs and host interfaces match")
            }
        } else {
            ValidationResult::success(format!(
                "Machine network CIDR is {}",
                cluster.machine_network_cidr
            ))
        },
    );

    out.insert(
        "cidrs-non-overlap".to_string(),
        match network::verify_cluster_cidrs_not_overlap(
            &cluster.machine_network_cidr,
            &cluster.cluster_network_cidr,
            &cluster.service_network_cidr,
        ) {
            Ok(()) => ValidationResult::success("No CIDR overlap"),
            Err(e) => ValidationResult::failure(e.to_string()),
        },
    );

    for (id, vip) in [
        ("api-vip-defined", &cluster.api_vip),
        ("ingress-vip-defined", &cluster.ingress_vip),
    ] {
        out.insert(
            id.to_string(),
            if vip.is_empty() {
                if cluster.vip_dhcp_allocation {
                    ValidationResult::pending("Waiting for the DHCP VIP allocation report")
                } else {
                    ValidationResult::pending("VIP must be provided")
                }
            } else {
                ValidationResult::success(format!("VIP {} is defined", vip))
            },
        );
    }

    let snapshot: Vec<Host> = participating(hosts).cloned().collect();
    for (id, vip) in [
        ("api-vip-valid", &cluster.api_vip),
        ("ingress-vip-valid", &cluster.ingress_vip),
    ] {
        out.insert(
            id.to_string(),
            if vip.is_empty() || cluster.machine_network_cidr.is_empty() {
                ValidationResult::pending("VIP or machine network CIDR is not yet set")
            } else {
                match network::verify_vips(
                    &snapshot,
                    &cluster.machine_network_cidr,
                    &cluster.api_vip,
                    &cluster.ingress_vip,
                    cluster.vip_dhcp_allocation,
                ) {
                    Ok(()) => ValidationResult::success(format!("VIP {} is valid", vip)),
                    Err(e) => ValidationResult::failure(e.to_string()),
                }
            },
        );
    }

    let masters: Vec<&Host> = participating(hosts)
        .filter(|h| h.role == HostRole::Master)
        .collect();
    let masters_known = masters.iter().all(|h| h.status == HostStatus::Known);
    out.insert(
        "sufficient-masters-count".to_string(),
        if masters.len() == MASTER_COUNT && masters_known {
            ValidationResult::success(format!("Cluster has {} known master hosts", MASTER_COUNT))
        } else {
            ValidationResult::failure(format!(
                "Cluster must have exactly {} known master hosts, found {}",
                MASTER_COUNT,
                masters.len()
            ))
        },
    );

    out
}

/// Cluster names end up in DNS records, so they follow the DNS label
/// shape.
pub fn validate_cluster_name(name: &str) -> crate::error::ApiResult<()> {
    use crate::error::ApiError;
    let shape = regex::Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("name pattern is valid");
    if name.is_empty() || name.len() > 54 || !shape.is_match(name) {
        return Err(ApiError::BadInput(format!(
            "Cluster name format is not valid: '{}'. Name must consist of lower-case letters, numbers and hyphens. It must start with a letter and end with a letter or number",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuth {
    pub auth: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PullSecret {
    auths: std::collections::HashMap<String, RegistryAuth>,
}

/// Parse and check a pull secret: every registry entry must carry a
/// base64 `auth` that decodes to `user:token`.
pub fn parse_pull_secret(
    secret: &str,
) -> crate::error::ApiResult<std::collections::HashMap<String, RegistryAuth>> {
    use crate::error::ApiError;
    use base64::{engine::general_purpose, Engine as _};

    let parsed: PullSecret = serde_json::from_str(secret)
        .map_err(|e| ApiError::BadInput(format!("pull secret must be a valid json: {}", e)))?;
    if parsed.auths.is_empty() {
        return Err(ApiError::BadInput(
            "pull secret must contain auths for at least one registry".to_string(),
        ));
    }
    for (registry, entry) in &parsed.auths {
        let decoded = general_purpose::STANDARD
            .decode(entry.auth.as_bytes())
            .map_err(|_| {
                ApiError::BadInput(format!(
                    "invalid base64 auth entry for registry {}",
                    registry
                ))
            })?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            ApiError::BadInput(format!("auth entry for registry {} is not text", registry))
        })?;
        if !decoded.contains(':') {
            return Err(ApiError::BadInput(format!(
                "auth entry for registry {} must be in the form of user:token",
                registry
            )));
        }
    }
    Ok(parsed.auths)
}

pub fn validate_pull_secret(secret: &str) -> crate::error::ApiResult<()> {
    parse_pull_secret(secret).map(|_| ())
}

/// Ids of the master hosts in deterministic (sorted) order. Bootstrap
/// selection takes the last of these.
pub fn master_node_ids(hosts: &[Host]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = participating(hosts)
        .filter(|h| h.role == HostRole::Master)
        .map(|h| h.id)
        .collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cpu, CreateClusterRequest, Interface, Inventory, Memory};

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

    fn master_host(cluster_id: Uuid, address: &str) -> Host {
        let inventory = Inventory {
            hostname: format!("host-{}", address),
            cpu: Cpu {
                count: 8,
                ..Default::default()
            },
            memory: Memory {
                physical_bytes: 32 * 1024 * 1024 * 1024,
                usable_bytes: 32 * 1024 * 1024 * 1024,
            },
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                ipv4_addresses: vec![address.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut host = Host::new(Uuid::new_v4(), cluster_id, String::new());
        host.role = HostRole::Master;
        host.status = HostStatus::Known;
        host.inventory = serde_json::to_string(&inventory).unwrap();
        host
    }

    #[test]
    fn host_without_inventory_is_pending() {
        let cluster = cluster_fixture();
        let host = Host::new(Uuid::new_v4(), cluster.id, String::new());
        let result = evaluate_host(&cluster, &[host.clone()], &host);
        assert_eq!(result["has-inventory"].status, ValidationStatus::Pending);
        assert_eq!(result["has-min-cpu"].status, ValidationStatus::Pending);
    }

    #[test]
    fn small_host_fails_hardware_floors() {
        let cluster = cluster_fixture();
        let mut host = master_host(cluster.id, "192.168.1.10/24");
        let inventory = Inventory {
            cpu: Cpu {
                count: 2,
                ..Default::default()
            },
            memory: Memory {
                physical_bytes: 4 * 1024 * 1024 * 1024,
                usable_bytes: 0,
            },
            ..Default::default()
        };
        host.inventory = serde_json::to_string(&inventory).unwrap();
        let result = evaluate_host(&cluster, &[host.clone()], &host);
        assert_eq!(result["has-min-cpu"].status, ValidationStatus::Failure);
        assert_eq!(result["has-min-memory"].status, ValidationStatus::Failure);
    }

    #[test]
    fn hostname_collision_is_detected() {
        let cluster = cluster_fixture();
        let mut h1 = master_host(cluster.id, "192.168.1.10/24");
        let mut h2 = master_host(cluster.id, "192.168.1.11/24");
        h1.requested_hostname = "node-a".to_string();
        h2.requested_hostname = "node-a".to_string();
        let hosts = vec![h1.clone(), h2];
        let result = evaluate_host(&cluster, &hosts, &h1);
        assert_eq!(result["hostname-unique"].status, ValidationStatus::Failure);
    }

    #[test]
    fn cluster_with_three_known_masters_and_vips_is_valid() {
        let mut cluster = cluster_fixture();
        cluster.machine_network_cidr = "192.168.1.0/24".to_string();
        cluster.api_vip = "192.168.1.100".to_string();
        cluster.ingress_vip = "192.168.1.101".to_string();
        let hosts: Vec<Host> = ["192.168.1.10/24", "192.168.1.11/24", "192.168.1.12/24"]
            .iter()
            .map(|a| master_host(cluster.id, a))
            .collect();
        let result = evaluate_cluster(&cluster, &hosts);
        assert!(all_success(&result), "unexpected: {:?}", result);
    }

    #[test]
    fn missing_vips_keep_the_cluster_pending() {
        let cluster = cluster_fixture();
        let result = evaluate_cluster(&cluster, &[]);
        assert_eq!(result["api-vip-defined"].status, ValidationStatus::Pending);
        assert!(!all_success(&result));
    }

    #[test]
    fn cluster_name_shape() {
        assert!(validate_cluster_name("demo").is_ok());
        assert!(validate_cluster_name("demo-1").is_ok());
        assert!(validate_cluster_name("Demo").is_err());
        assert!(validate_cluster_name("-demo").is_err());
        assert!(validate_cluster_name("demo_1").is_err());
        assert!(validate_cluster_name("").is_err());
    }

    #[test]
    fn pull_secret_requires_user_token_auth() {
        // "user:token" in base64
        let good = r#"{"auths":{"cloud.openshift.com":{"auth":"dXNlcjp0b2tlbg==","email":"a@b.c"}}}"#;
        assert!(validate_pull_secret(good).is_ok());
        // "justuser" in base64, no colon
        let bad = r#"{"auths":{"cloud.openshift.com":{"auth":"anVzdHVzZXI="}}}"#;
        assert!(validate_pull_secret(bad).is_err());
        assert!(validate_pull_secret("not json").is_err());
        assert!(validate_pull_secret(r#"{"auths":{}}"#).is_err());
    }

    #[test]
    fn two_masters_are_not_enough() {
        let mut cluster = cluster_fixture();
        cluster.machine_network_cidr = "192.168.1.0/24".to_string();
        cluster.api_vip = "192.168.1.100".to_string();
        cluster.ingress_vip = "192.168.1.101".to_string();
        let hosts: Vec<Host> = ["192.168.1.10/24", "192.168.1.11/24"]
            .iter()
            .map(|a| master_host(cluster.id, a))
            .collect();
        let result = evaluate_cluster(&cluster, &hosts);
        assert_eq!(
            result["sufficient-masters-count"].status,
            ValidationStatus::Failure
        );
    }
}
