// Agent polling contract: emit the ordered step plan for a host and
// route step replies back into the state machines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Cluster, ConnectivityReport, DhcpAllocationResponse, EventSeverity, FreeNetworksAddresses,
    Host, Inventory, Step, StepReply, StepType, Steps,
};
use crate::services::cluster_service::ClusterService;
use crate::services::host_service::HostService;
use crate::services::network;
use crate::store::Store;

const DEFAULT_REPLY_TIMEOUT_S: u32 = 60;
const INSTALL_REPLY_TIMEOUT_S: u32 = 0; // no timeout, installation takes long

#[derive(Debug, Clone)]
struct DebugCmd {
    command: String,
    step_id: String,
}

#[derive(Clone)]
pub struct StepService {
    config: Config,
    store: Store,
    host_service: HostService,
    cluster_service: ClusterService,
    debug_cmds: Arc<Mutex<HashMap<Uuid, DebugCmd>>>,
}

fn create_step_id(step_type: StepType) -> String {
    let suffix = Uuid::new_v4().to_string();
    format!("{}-{}", step_type, &suffix[..8])
}

impl StepService {
    pub fn new(
        config: Config,
        store: Store,
        host_service: HostService,
        cluster_service: ClusterService,
    ) -> Self {
        StepService {
            config,
            store,
            host_service,
            cluster_service,
            debug_cmds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a one-shot debug command for a host; it rides along with
    /// the next step plan and is cleared on emit.
    pub async fn set_debug_step(
        &self,
        cluster_id: Uuid,
        host_id: Uuid,
        command: String,
    ) -> ApiResult<()> {
        // existence check only, no mutation
        self.store.get_host(cluster_id, host_id)?;
        let step_id = create_step_id(StepType::Execute);
        {
            let mut cmds = self.debug_cmds.lock().unwrap();
            cmds.insert(host_id, DebugCmd { command, step_id });
        }
        self.store.add_event(
            cluster_id,
            Some(host_id),
            EventSeverity::Info,
            "Added debug command",
        );
        Ok(())
    }

    /// The agent poll. Updates the check-in time in its own
    /// transaction before consulting the state machine for the plan.
    pub async fn get_next_steps(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Steps> {
        let (cluster, hosts, host) = {
            let mut tx = self.store.begin_exclusive(cluster_id).await?;
            let host = tx.host_mut(host_id)?;
            host.checked_in_at = Utc::now();
            let snapshot = (tx.cluster.clone(), tx.hosts_snapshot(), tx.host(host_id)?.clone());
            tx.commit()?;
            snapshot
        };

        let mut steps = Steps::default();
        for step_type in self.host_service.next_step_types(&cluster, &host) {
            steps
                .instructions
                .push(self.build_step(step_type, &cluster, &hosts, &host));
        }

        let debug = {
            let mut cmds = self.debug_cmds.lock().unwrap();
            cmds.remove(&host_id)
        };
        if let Some(cmd) = debug {
            steps.instructions.push(Step {
                step_id: cmd.step_id,
                step_type: StepType::Execute,
                command: "bash".to_string(),
                args: vec!["-c".to_string(), cmd.command],
                reply_timeout_s: DEFAULT_REPLY_TIMEOUT_S,
            });
        }
        Ok(steps)
    }

    fn agent_run_args(&self, subcommand: &str) -> Vec<String> {
        vec![
            "run".to_string(),
            "--privileged".to_string(),
            "--net=host".to_string(),
            "--rm".to_string(),
            self.config.agent_docker_image.clone(),
            subcommand.to_string(),
        ]
    }

    fn build_step(
        &self,
        step_type: StepType,
        cluster: &Cluster,
        hosts: &[Host],
        host: &Host,
    ) -> Step {
        let mut step = Step {
            step_id: create_step_id(step_type),
            step_type,
            command: "podman".to_string(),
            args: Vec::new(),
            reply_timeout_s: DEFAULT_REPLY_TIMEOUT_S,
        };
        match step_type {
            StepType::Inventory => {
                step.args = self.agent_run_args("inventory");
            }
            StepType::ConnectivityCheck => {
                // every peer's addresses, so the agent can probe them
                let peers: Vec<serde_json::Value> = hosts
                    .iter()
                    .filter(|h| h.id != host.id)
                    .filter_map(|h| {
                        h.parsed_inventory().map(|inv| {
                            let addresses: Vec<String> = inv
                                .interfaces
                                .iter()
                                .flat_map(|i| i.ipv4_addresses.iter().cloned())
                                .collect();
                            json!({ "host_id": h.id, "addresses": addresses })
                        })
                    })
                    .collect();
                step.args = self.agent_run_args("connectivity_check");
                step.args.push(json!(peers).to_string());
            }
            StepType::FreeNetworkAddresses => {
                let networks: Vec<String> = network::host_networks(hosts)
                    .into_iter()
                    .map(|n| n.cidr)
                    .collect();
                step.args = self.agent_run_args("free_addresses");
                step.args.push(json!(networks).to_string());
            }
            StepType::DhcpLeaseAllocate => {
                step.args = self.agent_run_args("dhcp_lease_allocate");
                step.args.push(cluster.machine_network_cidr.clone());
            }
            StepType::Install => {
                step.args = self.agent_run_args("install");
                step.args.extend([
                    "--cluster-id".to_string(),
                    cluster.id.to_string(),
                    "--host-id".to_string(),
                    host.id.to_string(),
                    "--role".to_string(),
                    host.role.to_string(),
                    "--boot".to_string(),
                    host.bootstrap.to_string(),
                ]);
                step.reply_timeout_s = INSTALL_REPLY_TIMEOUT_S;
            }
            StepType::ResetInstallation => {
                let mut script = String::new();
                if host.bootstrap {
                    script.push_str(
                        "systemctl stop bootkube.service; rm -rf /etc/kubernetes/manifests/* /opt/metalforge/*.done; ",
                    );
                }
                script.push_str("/usr/bin/podman rm --all -f; ");
                script.push_str(&format!(
                    "ip -o -4 addr show | egrep '[ \t]{}/|[ \t]{}/' | awk '{{ip_del_cmd = sprintf(\"ip addr del %s dev %s\",$4, $2); system(ip_del_cmd);}}' ; ",
                    cluster.api_vip.replace('.', "[.]"),
                    cluster.ingress_vip.replace('.', "[.]")
                ));
                script.push_str("systemctl restart agent ; ");
                step.command = "bash".to_string();
                step.args = vec!["-c".to_string(), script];
            }
            StepType::Execute => {}
        }
        step
    }

    /// Keep only the fields the reply schema declares: the payload is
    /// parsed into the typed model and re-serialized. Unknown step
    /// types produce no payload and are ignored upstream.
    pub fn filter_reply(step_type: StepType, output: &str) -> ApiResult<Option<String>> {
        let filtered = match step_type {
            StepType::Inventory => {
                let parsed: Inventory = serde_json::from_str(output)
                    .map_err(|e| ApiError::BadInput(format!("invalid inventory reply: {}", e)))?;
                Some(serde_json::to_string(&parsed).map_err(ApiError::internal)?)
            }
            StepType::ConnectivityCheck => {
                let parsed: ConnectivityReport = serde_json::from_str(output).map_err(|e| {
                    ApiError::BadInput(format!("invalid connectivity reply: {}", e))
                })?;
                Some(serde_json::to_string(&parsed).map_err(ApiError::internal)?)
            }
            StepType::FreeNetworkAddresses => {
                let parsed: FreeNetworksAddresses = serde_json::from_str(output).map_err(|e| {
                    ApiError::BadInput(format!("invalid free-addresses reply: {}", e))
                })?;
                Some(serde_json::to_string(&parsed).map_err(ApiError::internal)?)
            }
            StepType::DhcpLeaseAllocate => {
                let parsed: DhcpAllocationResponse = serde_json::from_str(output).map_err(|e| {
                    ApiError::BadInput(format!("invalid dhcp allocation reply: {}", e))
                })?;
                Some(serde_json::to_string(&parsed).map_err(ApiError::internal)?)
            }
            _ => None,
        };
        Ok(filtered)
    }

    pub async fn post_step_reply(
        &self,
        cluster_id: Uuid,
        host_id: Uuid,
        reply: StepReply,
    ) -> ApiResult<()> {
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        if !tx.contains_host(host_id) {
            return Err(ApiError::not_found("host", host_id));
        }
        let msg = format!(
            "Received step reply <{}> from cluster <{}> host <{}> exit-code <{}> stderr <{}>",
            reply.step_id, cluster_id, host_id, reply.exit_code, reply.error
        );

        if reply.exit_code != 0 {
            tracing::error!("{}", msg);
            if reply.step_type == StepType::Install {
                let host = tx.host_mut(host_id)?;
                self.host_service
                    .handle_installation_failure(host, &reply.error)?;
                tx.commit()?;
            }
            return Err(ApiError::BadInput(msg));
        }
        tracing::info!("{}", msg);

        let filtered = match Self::filter_reply(reply.step_type, &reply.output)? {
            Some(filtered) => filtered,
            None => return Ok(()), // nothing to route
        };

        let cluster = tx.cluster.clone();
        let hosts = tx.hosts_snapshot();
        match reply.step_type {
            StepType::Inventory => {
                let host = tx.host_mut(host_id)?;
                self.host_service
                    .update_inventory(&cluster, &hosts, host, &filtered)?;
            }
            StepType::ConnectivityCheck => {
                let host = tx.host_mut(host_id)?;
                self.host_service
                    .update_connectivity_report(&cluster, &hosts, host, &filtered)?;
            }
            StepType::FreeNetworkAddresses => {
                let host = tx.host_mut(host_id)?;
                self.host_service.update_free_addresses(host, &filtered)?;
            }
            StepType::DhcpLeaseAllocate => {
                self.process_dhcp_allocation(&mut tx, &filtered)?;
            }
            _ => {}
        }
        tx.commit()?;
        Ok(())
    }

    /// DHCP-allocated VIPs are accepted only when the cluster runs in
    /// allocation mode and both addresses sit inside the machine CIDR.
    fn process_dhcp_allocation(
        &self,
        tx: &mut crate::store::ClusterTx,
        reply_json: &str,
    ) -> ApiResult<()> {
        if !tx.cluster.vip_dhcp_allocation {
            tracing::warn!("DHCP allocation not enabled in cluster {}", tx.cluster.id);
            return Ok(());
        }
        let allocation: DhcpAllocationResponse =
            serde_json::from_str(reply_json).map_err(ApiError::internal)?;
        let machine_cidr = tx.cluster.machine_network_cidr.clone();
        for vip in [&allocation.api_vip_address, &allocation.ingress_vip_address] {
            if !network::ip_in_cidr(vip, &machine_cidr)? {
                return Err(ApiError::BadInput(format!(
                    "DHCP allocated VIP {} is not in machine CIDR {}",
                    vip, machine_cidr
                )));
            }
        }
        self.cluster_service.set_vips(
            &mut tx.cluster,
            &allocation.api_vip_address,
            &allocation.ingress_vip_address,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_reply_is_idempotent() {
        let raw = r#"{"hostname":"node-0","cpu":{"count":8},"memory":{"physical_bytes":1024},
            "interfaces":[{"name":"eth0","ipv4_addresses":["10.0.0.1/24"]}],
            "unknown_field":"dropped"}"#;
        let once = StepService::filter_reply(StepType::Inventory, raw)
            .unwrap()
            .unwrap();
        let twice = StepService::filter_reply(StepType::Inventory, &once)
            .unwrap()
            .unwrap();
        assert_eq!(once, twice);
        assert!(!once.contains("unknown_field"));
    }

    #[test]
    fn unknown_step_types_are_ignored() {
        let out = StepService::filter_reply(StepType::Execute, "whatever").unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn step_ids_carry_the_type_prefix() {
        let id = create_step_id(StepType::ConnectivityCheck);
        assert!(id.starts_with("connectivity-check-"));
        assert_eq!(id.len(), "connectivity-check-".len() + 8);
    }
}
