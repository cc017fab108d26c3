// Majority-group computation over the hosts' directed L2
// reachability reports. A majority group is the largest subset of
// hosts with full mesh connectivity on a given CIDR.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{ConnectivityReport, Host};

type GroupSet = BTreeSet<Uuid>;

/// Mutual-connectivity lookup between host pairs. Keys are ordered so
/// each unordered pair has one entry tracking both directions.
#[derive(Default)]
struct ConnectivityMap {
    edges: HashMap<(Uuid, Uuid), (bool, bool)>,
}

impl ConnectivityMap {
    fn key(from: Uuid, to: Uuid) -> (Uuid, Uuid) {
        if from < to {
            (from, to)
        } else {
            (to, from)
        }
    }

    fn add(&mut self, from: Uuid, to: Uuid) {
        let key = Self::key(from, to);
        let value = self.edges.entry(key).or_default();
        if from == key.0 {
            value.0 = true;
        } else {
            value.1 = true;
        }
    }

    fn is_connected(&self, from: Uuid, to: Uuid) -> bool {
        matches!(self.edges.get(&Self::key(from, to)), Some((true, true)))
    }
}

/// Directed adjacency on `cidr`: an edge u->v exists when some report
/// of u toward v carries a successful probe from an outgoing address
/// inside the CIDR.
fn build_connectivity_map(cidr: &IpNetwork, hosts: &[Host]) -> ApiResult<ConnectivityMap> {
    let mut map = ConnectivityMap::default();
    for host in hosts {
        if host.connectivity.is_empty() {
            continue;
        }
        let report: ConnectivityReport = serde_json::from_str(&host.connectivity).map_err(|e| {
            ApiError::internal(format!(
                "could not parse connectivity report of host {}: {}",
                host.id, e
            ))
        })?;
        for remote in &report.remote_hosts {
            for l2 in &remote.l2_connectivity {
                let ip = match std::net::IpAddr::from_str(&l2.outgoing_ip_address) {
                    Ok(ip) => ip,
                    Err(_) => continue,
                };
                if cidr.contains(ip) && l2.successful {
                    map.add(host.id, remote.host_id);
                    break;
                }
            }
        }
    }
    Ok(map)
}

struct GroupCandidate {
    set: GroupSet,
    me: Uuid,
}

/// A host's candidate set: itself plus every host it has mutual
/// connectivity with.
fn host_group_candidate(host: &Host, hosts: &[Host], map: &ConnectivityMap) -> GroupCandidate {
    let mut set = GroupSet::new();
    set.insert(host.id);
    for other in hosts {
        if map.is_connected(host.id, other.id) {
            set.insert(other.id);
        }
    }
    GroupCandidate { set, me: host.id }
}

/// Deduplicated candidate sets, closed under pairwise intersection
/// (intersections below 3 members are dropped), filtered down to the
/// fully-meshed ones and sorted by descending size then member ids.
fn create_connectivity_groups(candidates: &[GroupCandidate]) -> Vec<GroupSet> {
    let mut groups: Vec<GroupSet> = Vec::new();
    for candidate in candidates {
        let mut pending: Vec<GroupSet> = vec![candidate.set.clone()];
        for group in &groups {
            let intersection: GroupSet = candidate.set.intersection(group).copied().collect();
            if intersection.len() >= 3 {
                pending.push(intersection);
            }
        }
        for set in pending {
            if !groups.contains(&set) {
                groups.push(set);
            }
        }
    }

    // A set is fully meshed when every member's candidate set covers
    // it: each count hit below is one member host vouching for the
    // whole group.
    let mut meshed: Vec<GroupSet> = groups
        .into_iter()
        .filter(|group| {
            let count = candidates
                .iter()
                .filter(|c| group.contains(&c.me) && c.set.is_superset(group))
                .count();
            count == group.len()
        })
        .collect();

    meshed.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| a.iter().cmp(b.iter()))
    });
    meshed
}

/// The majority group for a CIDR: the first (largest) fully-meshed
/// group, or empty when no group of at least 3 hosts exists.
pub fn create_majority_group(cidr: &str, hosts: &[Host]) -> ApiResult<Vec<Uuid>> {
    let network = IpNetwork::from_str(cidr)
        .map_err(|e| ApiError::BadInput(format!("{} is not a valid CIDR: {}", cidr, e)))?;
    let map = build_connectivity_map(&network, hosts)?;
    let candidates: Vec<GroupCandidate> = hosts
        .iter()
        .map(|h| host_group_candidate(h, hosts, &map))
        .filter(|c| c.set.len() >= 3)
        .collect();
    let groups = create_connectivity_groups(&candidates);
    Ok(groups
        .into_iter()
        .next()
        .map(|g| g.into_iter().collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectivityRemoteHost, L2Connectivity};

    fn host_with_connectivity(id: Uuid, cluster_id: Uuid, peers: &[(Uuid, &str, bool)]) -> Host {
        let report = ConnectivityReport {
            remote_hosts: peers
                .iter()
                .map(|(peer, ip, ok)| ConnectivityRemoteHost {
                    host_id: *peer,
                    l2_connectivity: vec![L2Connectivity {
                        outgoing_ip_address: ip.to_string(),
                        remote_ip_address: String::new(),
                        successful: *ok,
                    }],
                    l3_connectivity: Vec::new(),
                })
                .collect(),
        };
        let mut host = Host::new(id, cluster_id, String::new());
        host.connectivity = serde_json::to_string(&report).unwrap();
        host
    }

    fn sorted_ids(n: usize) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn full_mesh_of_three_is_the_majority() {
        let cluster_id = Uuid::new_v4();
        let ids = sorted_ids(3);
        let hosts: Vec<Host> = ids
            .iter()
            .map(|id| {
                let peers: Vec<(Uuid, &str, bool)> = ids
                    .iter()
                    .filter(|p| *p != id)
                    .map(|p| (*p, "192.168.1.10", true))
                    .collect();
                host_with_connectivity(*id, cluster_id, &peers)
            })
            .collect();

        let group = create_majority_group("192.168.1.0/24", &hosts).unwrap();
        assert_eq!(group, ids);
    }

    #[test]
    fn majority_of_three_among_five() {
        let cluster_id = Uuid::new_v4();
        let ids = sorted_ids(5);
        let meshed = &ids[..3];
        let mut hosts: Vec<Host> = meshed
            .iter()
            .map(|id| {
                let peers: Vec<(Uuid, &str, bool)> = meshed
                    .iter()
                    .filter(|p| *p != id)
                    .map(|p| (*p, "192.168.1.10", true))
                    .collect();
                host_with_connectivity(*id, cluster_id, &peers)
            })
            .collect();
        // h4 and h5 are isolated: no successful probes at all
        for id in &ids[3..] {
            hosts.push(host_with_connectivity(*id, cluster_id, &[]));
        }

        let group = create_majority_group("192.168.1.0/24", &hosts).unwrap();
        assert_eq!(group, meshed.to_vec());
    }

    #[test]
    fn one_way_connectivity_is_not_enough() {
        let cluster_id = Uuid::new_v4();
        let ids = sorted_ids(3);
        // h0 -> h1 and h0 -> h2 succeed, nothing answers back
        let hosts = vec![
            host_with_connectivity(
                ids[0],
                cluster_id,
                &[(ids[1], "192.168.1.10", true), (ids[2], "192.168.1.10", true)],
            ),
            host_with_connectivity(ids[1], cluster_id, &[]),
            host_with_connectivity(ids[2], cluster_id, &[]),
        ];
        let group = create_majority_group("192.168.1.0/24", &hosts).unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn probes_outside_the_cidr_are_ignored() {
        let cluster_id = Uuid::new_v4();
        let ids = sorted_ids(3);
        let hosts: Vec<Host> = ids
            .iter()
            .map(|id| {
                let peers: Vec<(Uuid, &str, bool)> = ids
                    .iter()
                    .filter(|p| *p != id)
                    .map(|p| (*p, "10.0.0.10", true))
                    .collect();
                host_with_connectivity(*id, cluster_id, &peers)
            })
            .collect();
        let group = create_majority_group("192.168.1.0/24", &hosts).unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn fewer_than_three_hosts_yield_no_group() {
        let cluster_id = Uuid::new_v4();
        let ids = sorted_ids(2);
        let hosts = vec![
            host_with_connectivity(ids[0], cluster_id, &[(ids[1], "192.168.1.10", true)]),
            host_with_connectivity(ids[1], cluster_id, &[(ids[0], "192.168.1.11", true)]),
        ];
        let group = create_majority_group("192.168.1.0/24", &hosts).unwrap();
        assert!(group.is_empty());
    }
}
