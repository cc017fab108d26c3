// CIDR and address computations backing validations, VIP handling and
// the free-address report.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Host, HostNetwork};

pub fn parse_cidr(cidr: &str) -> ApiResult<IpNetwork> {
    IpNetwork::from_str(cidr)
        .map_err(|e| ApiError::BadInput(format!("{} is not a valid CIDR: {}", cidr, e)))
}

fn bits_of(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

/// A subnet CIDR must name the network itself (no host bits), must not
/// be the unspecified address, and must leave room for at least 128
/// addresses.
pub fn verify_subnet_cidr(cidr: &str) -> ApiResult<()> {
    let network = parse_cidr(cidr)?;
    let bits = bits_of(&network);
    let prefix = network.prefix();
    if prefix < 1 || prefix > bits - 7 {
        return Err(ApiError::BadInput(format!(
            "Address mask size must be between 1 to {} and must include at least 128 addresses",
            bits - 7
        )));
    }
    if network.network().is_unspecified() {
        return Err(ApiError::BadInput(
            "Address must not be unspecified. Unspecified address is the address with all zeroes"
                .to_string(),
        ));
    }
    if network.ip() != network.network() {
        return Err(ApiError::BadInput(format!(
            "{} is not a valid network CIDR",
            cidr
        )));
    }
    Ok(())
}

/// Two CIDRs overlap when either network address is contained in the
/// other. Empty inputs are treated as not-yet-known and succeed.
pub fn verify_cidrs_not_overlap(a_cidr: &str, b_cidr: &str) -> ApiResult<()> {
    if a_cidr.is_empty() || b_cidr.is_empty() {
        return Ok(());
    }
    let a = parse_cidr(a_cidr)?;
    let b = parse_cidr(b_cidr)?;
    if a.contains(b.network()) || b.contains(a.network()) {
        return Err(ApiError::BadInput(format!(
            "CIDRS {} and {} overlap",
            a_cidr, b_cidr
        )));
    }
    Ok(())
}

pub fn verify_cluster_cidrs_not_overlap(
    machine_network_cidr: &str,
    cluster_network_cidr: &str,
    service_network_cidr: &str,
) -> ApiResult<()> {
    verify_cidrs_not_overlap(machine_network_cidr, service_network_cidr)
        .map_err(|e| ApiError::BadInput(format!("MachineNetworkCIDR and ServiceNetworkCIDR: {}", e)))?;
    verify_cidrs_not_overlap(machine_network_cidr, cluster_network_cidr)
        .map_err(|e| ApiError::BadInput(format!("MachineNetworkCIDR and ClusterNetworkCidr: {}", e)))?;
    verify_cidrs_not_overlap(service_network_cidr, cluster_network_cidr)
        .map_err(|e| ApiError::BadInput(format!("ServiceNetworkCidr and ClusterNetworkCidr: {}", e)))?;
    Ok(())
}

/// The cluster network must be able to hand every host a subnet of
/// `host_prefix` size, with room for at least 4 hosts.
pub fn verify_cluster_cidr_size(
    host_prefix: u8,
    cluster_network_cidr: &str,
    num_hosts: usize,
) -> ApiResult<()> {
    let network = parse_cidr(cluster_network_cidr)?;
    let bits = bits_of(&network);
    let cluster_prefix = network.prefix();
    if host_prefix > bits - 7 {
        return Err(ApiError::BadInput(format!(
            "Host prefix, now {}, must be less than or equal to {} to allow at least 128 addresses",
            host_prefix,
            bits - 7
        )));
    }
    let requested_num_hosts = std::cmp::max(4, num_hosts) as u64;
    let shift = host_prefix.saturating_sub(cluster_prefix) as u32;
    let possible_num_hosts = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    if requested_num_hosts > possible_num_hosts {
        return Err(ApiError::BadInput(format!(
            "Cluster network CIDR prefix {} does not contain enough addresses for {} hosts each one with {} prefix",
            cluster_prefix, requested_num_hosts, host_prefix
        )));
    }
    Ok(())
}

/// All interface networks a host reported, in CIDR notation.
fn host_interface_networks(host: &Host) -> Vec<IpNetwork> {
    let mut networks = Vec::new();
    if let Some(inventory) = host.parsed_inventory() {
        for interface in &inventory.interfaces {
            for address in interface
                .ipv4_addresses
                .iter()
                .chain(interface.ipv6_addresses.iter())
            {
                if let Ok(network) = IpNetwork::from_str(address) {
                    networks.push(network);
                }
            }
        }
    }
    networks
}

fn masked(network: &IpNetwork) -> IpNetwork {
    IpNetwork::new(network.network(), network.prefix()).expect("masking preserves the prefix")
}

pub fn parse_ip(ip: &str) -> ApiResult<IpAddr> {
    IpAddr::from_str(ip).map_err(|_| ApiError::BadInput(format!("Could not parse IP address {}", ip)))
}

/// The machine network is inferred, not configured: the smallest CIDR
/// seen on any host interface that contains both VIPs.
pub fn calculate_machine_network_cidr(
    api_vip: &str,
    ingress_vip: &str,
    hosts: &[Host],
) -> ApiResult<String> {
    let api = parse_ip(api_vip)?;
    let ingress = parse_ip(ingress_vip)?;
    let mut best: Option<IpNetwork> = None;
    for host in hosts {
        for network in host_interface_networks(host) {
            if network.contains(api) && network.contains(ingress) {
                let candidate = masked(&network);
                match best {
                    Some(current) if current.prefix() >= candidate.prefix() => {}
                    _ => best = Some(candidate),
                }
            }
        }
    }
    best.map(|n| n.to_string()).ok_or_else(|| {
        ApiError::BadInput(format!(
            "No suitable matching CIDR found for VIPs {} and {}",
            api_vip, ingress_vip
        ))
    })
}

/// VIPs must be distinct addresses inside the machine network, and the
/// machine network itself must be present on at least one host.
pub fn verify_vips(
    hosts: &[Host],
    machine_network_cidr: &str,
    api_vip: &str,
    ingress_vip: &str,
    dhcp_mode: bool,
) -> ApiResult<()> {
    let source = if dhcp_mode { "DHCP allocation" } else { "user input" };
    let machine_network = parse_cidr(machine_network_cidr)?;
    let api = parse_ip(api_vip)?;
    let ingress = parse_ip(ingress_vip)?;
    if api == ingress {
        return Err(ApiError::BadInput(format!(
            "API VIP and Ingress VIP from {} must be different, got {} for both",
            source, api_vip
        )));
    }
    for (label, vip) in [("api-vip", api), ("ingress-vip", ingress)] {
        if !machine_network.contains(vip) {
            return Err(ApiError::BadInput(format!(
                "{} <{}> does not belong to machine-network-cidr <{}>",
                label, vip, machine_network_cidr
            )));
        }
    }
    let observed = hosts.iter().any(|host| {
        host_interface_networks(host)
            .iter()
            .any(|network| masked(network) == masked(&machine_network))
    });
    if !observed {
        return Err(ApiError::BadInput(format!(
            "machine-network-cidr <{}> is not present on any host interface",
            machine_network_cidr
        )));
    }
    Ok(())
}

pub fn ip_in_cidr(ip: &str, cidr: &str) -> ApiResult<bool> {
    let address = parse_ip(ip)?;
    let network = parse_cidr(cidr)?;
    Ok(network.contains(address))
}

/// Big-endian numeric value of a dotted-quad IPv4 string; 0 for
/// anything unparseable. Monotone on valid addresses, which makes it
/// the sort key for free-address listings.
pub fn ip_as_uint(ip: &str) -> u64 {
    match std::net::Ipv4Addr::from_str(ip) {
        Ok(addr) => u32::from(addr) as u64,
        Err(_) => 0,
    }
}

/// Intersection across hosts of the free addresses each one reported
/// for `network`, optionally narrowed to addresses starting with
/// `prefix`.
pub fn make_free_addresses_set(
    hosts: &[Host],
    network: &str,
    prefix: Option<&str>,
) -> HashSet<String> {
    let mut result: Option<HashSet<String>> = None;
    for host in hosts {
        let mut host_set: HashSet<String> = HashSet::new();
        if let Some(report) = host.parsed_free_addresses() {
            for entry in report {
                if entry.network == network {
                    host_set.extend(entry.free_addresses.iter().cloned());
                }
            }
        }
        result = Some(match result {
            None => host_set,
            Some(acc) => acc.intersection(&host_set).cloned().collect(),
        });
    }
    let mut set = result.unwrap_or_default();
    if let Some(prefix) = prefix {
        set.retain(|a| a.starts_with(prefix));
    }
    set
}

/// Prefix selection: a non-negative limit keeps the first `limit`
/// entries, anything else keeps the whole list.
pub fn apply_limit(mut addresses: Vec<String>, limit: Option<i64>) -> Vec<String> {
    if let Some(limit) = limit {
        if limit >= 0 && (limit as usize) < addresses.len() {
            addresses.truncate(limit as usize);
        }
    }
    addresses
}

/// CIDR -> hosts that reported an address inside it, for the cluster
/// read endpoints.
pub fn host_networks(hosts: &[Host]) -> Vec<HostNetwork> {
    let mut by_cidr: std::collections::BTreeMap<String, Vec<Uuid>> =
        std::collections::BTreeMap::new();
    for host in hosts {
        for network in host_interface_networks(host) {
            by_cidr
                .entry(masked(&network).to_string())
                .or_default()
                .push(host.id);
        }
    }
    by_cidr
        .into_iter()
        .map(|(cidr, mut host_ids)| {
            host_ids.sort();
            host_ids.dedup();
            HostNetwork { cidr, host_ids }
        })
        .collect()
}
