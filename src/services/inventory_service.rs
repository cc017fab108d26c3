// API-facing orchestrator. Every mutating entry point works inside the
// cluster's exclusive transaction and commits only after the state
// machines agree; failures roll back and surface as error events.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Cluster, ClusterWithHosts, CompleteInstallationRequest, CreateClusterRequest,
    Credentials, Event, EventSeverity, Host, HostProgressReport, HostRole, HostStatus,
    ImageCreateParams, RegisterHostRequest, UpdateClusterRequest,
};
use crate::services::cluster_service::ClusterService;
use crate::services::dns::DnsService;
use crate::services::host_service::HostService;
use crate::services::ignition;
use crate::services::iso::IsoGenerator;
use crate::services::network;
use crate::services::validation;
use crate::store::object_store::ObjectStore;
use crate::store::{ClusterTx, Store};

pub const KUBECONFIG: &str = "kubeconfig";

const CLUSTER_FILE_NAMES: &[&str] = &[
    "kubeconfig",
    "bootstrap.ign",
    "master.ign",
    "worker.ign",
    "metadata.json",
    "kubeadmin-password",
    "kubeconfig-noingress",
    "install-config.yaml",
];

/// Minimum gap between two successful image generations per cluster.
const IMAGE_REGENERATION_WINDOW_SECONDS: i64 = 10;

const DEFAULT_USER: &str = "kubeadmin";
const CONSOLE_URL_PREFIX: &str = "https://console-openshift-console.apps";

pub fn image_name(cluster_id: Uuid) -> String {
    format!("discovery-image-{}", cluster_id)
}

#[derive(Clone)]
pub struct InventoryService {
    config: Config,
    store: Store,
    host_service: HostService,
    cluster_service: ClusterService,
    dns: DnsService,
    object_store: Arc<dyn ObjectStore>,
    generator: Arc<dyn IsoGenerator>,
}


impl InventoryService {
    pub fn new(
        config: Config,
        store: Store,
        host_service: HostService,
        cluster_service: ClusterService,
        dns: DnsService,
        object_store: Arc<dyn ObjectStore>,
        generator: Arc<dyn IsoGenerator>,
    ) -> Self {
        InventoryService {
            config,
            store,
            host_service,
            cluster_service,
            dns,
            object_store,
            generator,
        }
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    fn customize_host(&self, host: &mut Host) {
        host.progress_stages = self.host_service.stages_by_role(host.role, host.bootstrap);
        host.requested_hostname = host.hostname();
    }

    fn cluster_with_hosts(&self, cluster: Cluster, mut hosts: Vec<Host>) -> ClusterWithHosts {
        for host in &mut hosts {
            self.customize_host(host);
        }
        let host_networks = network::host_networks(&hosts);
        ClusterWithHosts {
            cluster,
            hosts,
            host_networks,
        }
    }

    // --- cluster lifecycle ---------------------------------------------------

    pub fn register_cluster(
        &self,
        params: CreateClusterRequest,
        user_name: String,
        org_id: String,
    ) -> ApiResult<Cluster> {
        validation::validate_cluster_name(&params.name)?;
        let pull_secret = params.pull_secret.clone().unwrap_or_default();
        if !pull_secret.is_empty() {
            validation::validate_pull_secret(&pull_secret)?;
        }

        let id = Uuid::new_v4();
        tracing::info!("Register cluster: {} with id {}", params.name, id);
        let mut cluster = Cluster::new(id, params, user_name, org_id);
        network::verify_subnet_cidr(&cluster.cluster_network_cidr)?;
        network::verify_subnet_cidr(&cluster.service_network_cidr)?;
        network::verify_cidrs_not_overlap(
            &cluster.cluster_network_cidr,
            &cluster.service_network_cidr,
        )?;
        network::verify_cluster_cidr_size(
            cluster.cluster_network_host_prefix,
            &cluster.cluster_network_cidr,
            0,
        )?;
        cluster.set_pull_secret(pull_secret);

        self.store.insert_cluster(cluster.clone())?;
        self.store.add_event(
            id,
            None,
            EventSeverity::Info,
            format!("Registered cluster {}", cluster.name),
        );
        Ok(cluster)
    }

    pub fn list_clusters(&self) -> Vec<Cluster> {
        self.store.list_clusters()
    }

    pub fn get_cluster(&self, cluster_id: Uuid) -> ApiResult<ClusterWithHosts> {
        let (cluster, hosts) = self.store.get_cluster_with_hosts(cluster_id)?;
        Ok(self.cluster_with_hosts(cluster, hosts))
    }

    pub async fn deregister_cluster(&self, cluster_id: Uuid) -> ApiResult<()> {
        let cluster = self.store.get_cluster(cluster_id)?;
        tracing::info!("Deregister cluster id {}", cluster_id);
        if let Err(e) = self.dns.delete_cluster_records(&cluster).await {
            tracing::warn!(
                "failed to delete DNS record sets for base domain {}: {}",
                cluster.base_dns_domain,
                e
            );
        }
        self.store.remove_cluster(cluster_id).await?;
        Ok(())
    }

    pub async fn update_cluster(
        &self,
        cluster_id: Uuid,
        params: UpdateClusterRequest,
    ) -> ApiResult<ClusterWithHosts> {
        tracing::info!("update cluster {}", cluster_id);
        if let Some(secret) = params.pull_secret.as_deref() {
            if !secret.is_empty() {
                validation::validate_pull_secret(secret).map_err(|_| {
                    ApiError::BadInput("Pull-secret has invalid format".to_string())
                })?;
            }
        }
        if let Some(name) = params.name.as_deref() {
            validation::validate_cluster_name(name)?;
        }

        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        self.cluster_service.verify_updatability(&tx.cluster)?;
        self.validate_dns_domain(&tx.cluster, &params)?;

        let proxy_changed = self.update_cluster_data(&mut tx, &params)?;
        self.update_hosts_data(&mut tx, &params)?;

        // Tolerant refresh: hosts in any discovery state are
        // re-evaluated here; only the install gate is strict.
        let cluster_snapshot = tx.cluster.clone();
        let hosts_snapshot = tx.hosts_snapshot();
        tx.for_each_host_mut(|_, host| {
            self.host_service
                .refresh_status(&cluster_snapshot, &hosts_snapshot, host, Utc::now())
        })?;
        let hosts_snapshot = tx.hosts_snapshot();
        self.cluster_service
            .refresh_status(&mut tx.cluster, &hosts_snapshot)?;
        tx.commit()?;

        if proxy_changed {
            self.store.add_event(
                cluster_id,
                None,
                EventSeverity::Info,
                "Proxy settings changed",
            );
        }
        self.get_cluster(cluster_id)
    }

    fn validate_dns_domain(
        &self,
        cluster: &Cluster,
        params: &UpdateClusterRequest,
    ) -> ApiResult<()> {
        let name = params.name.as_deref().unwrap_or(&cluster.name);
        let base_domain = params
            .base_dns_domain
            .as_deref()
            .unwrap_or(&cluster.base_dns_domain);
        if base_domain.is_empty() {
            return Ok(());
        }
        crate::services::dns::dns_domain(&self.config.base_dns_domains, name, base_domain)
            .map_err(|_| {
                ApiError::Conflict("Base DNS domain isn't configured properly".to_string())
            })?;
        Ok(())
    }

    /// Apply the cluster-level fields. Network parameters split on the
    /// DHCP-allocation mode: VIPs are user input only outside it, the
    /// machine CIDR only inside it.
    fn update_cluster_data(
        &self,
        tx: &mut ClusterTx,
        params: &UpdateClusterRequest,
    ) -> ApiResult<bool> {
        let cluster = &mut tx.cluster;
        let proxy_changed = params
            .http_proxy
            .as_ref()
            .map(|v| *v != cluster.http_proxy)
            .unwrap_or(false)
            || params
                .https_proxy
                .as_ref()
                .map(|v| *v != cluster.https_proxy)
                .unwrap_or(false)
            || params
                .no_proxy
                .as_ref()
                .map(|v| *v != cluster.no_proxy)
                .unwrap_or(false);

        if let Some(name) = &params.name {
            cluster.name = name.clone();
        }
        if let Some(domain) = &params.base_dns_domain {
            cluster.base_dns_domain = domain.clone();
        }
        if let Some(cidr) = &params.cluster_network_cidr {
            network::verify_subnet_cidr(cidr)?;
            cluster.cluster_network_cidr = cidr.clone();
        }
        if let Some(prefix) = params.cluster_network_host_prefix {
            network::verify_cluster_cidr_size(prefix, &cluster.cluster_network_cidr, 0)?;
            cluster.cluster_network_host_prefix = prefix;
        }
        if let Some(cidr) = &params.service_network_cidr {
            network::verify_subnet_cidr(cidr)?;
            cluster.service_network_cidr = cidr.clone();
        }
        if let Some(proxy) = &params.http_proxy {
            cluster.http_proxy = proxy.clone();
        }
        if let Some(proxy) = &params.https_proxy {
            cluster.https_proxy = proxy.clone();
        }
        if let Some(no_proxy) = &params.no_proxy {
            cluster.no_proxy = no_proxy.clone();
        }
        if let Some(key) = &params.ssh_public_key {
            cluster.ssh_public_key = key.clone();
        }
        if let Some(secret) = &params.pull_secret {
            cluster.set_pull_secret(secret.clone());
        }
        if let Some(dhcp) = params.vip_dhcp_allocation {
            if dhcp != cluster.vip_dhcp_allocation {
                cluster.vip_dhcp_allocation = dhcp;
                if dhcp {
                    // VIPs become DHCP-owned
                    cluster.api_vip.clear();
                    cluster.ingress_vip.clear();
                } else {
                    // the machine CIDR goes back to being derived
                    cluster.machine_network_cidr.clear();
                }
            }
        }

        let hosts = tx.hosts_snapshot();
        let cluster = &mut tx.cluster;
        if cluster.vip_dhcp_allocation {
            self.update_dhcp_network_params(cluster, params)?;
        } else {
            self.update_non_dhcp_network_params(cluster, &hosts, params)?;
        }
        Ok(proxy_changed)
    }

    fn update_dhcp_network_params(
        &self,
        cluster: &mut Cluster,
        params: &UpdateClusterRequest,
    ) -> ApiResult<()> {
        if params.api_vip.is_some() {
            return Err(ApiError::BadInput(
                "Setting API VIP is forbidden when cluster is in vip-dhcp-allocation mode"
                    .to_string(),
            ));
        }
        if params.ingress_vip.is_some() {
            return Err(ApiError::BadInput(
                "Setting Ingress VIP is forbidden when cluster is in vip-dhcp-allocation mode"
                    .to_string(),
            ));
        }
        if let Some(cidr) = &params.machine_network_cidr {
            network::verify_subnet_cidr(cidr)?;
            cluster.machine_network_cidr = cidr.clone();
        }
        Ok(())
    }

    fn update_non_dhcp_network_params(
        &self,
        cluster: &mut Cluster,
        hosts: &[Host],
        params: &UpdateClusterRequest,
    ) -> ApiResult<()> {
        if params.machine_network_cidr.is_some() {
            return Err(ApiError::BadInput(
                "Setting Machine network CIDR is forbidden when cluster is not in vip-dhcp-allocation mode"
                    .to_string(),
            ));
        }
        if let Some(vip) = &params.api_vip {
            cluster.api_vip = vip.clone();
        }
        if let Some(vip) = &params.ingress_vip {
            cluster.ingress_vip = vip.clone();
        }
        match (cluster.api_vip.is_empty(), cluster.ingress_vip.is_empty()) {
            (true, true) => Ok(()), // nothing to derive yet
            (false, false) => {
                let machine_cidr = network::calculate_machine_network_cidr(
                    &cluster.api_vip,
                    &cluster.ingress_vip,
                    hosts,
                )?;
                network::verify_vips(
                    hosts,
                    &machine_cidr,
                    &cluster.api_vip,
                    &cluster.ingress_vip,
                    false,
                )?;
                cluster.machine_network_cidr = machine_cidr;
                Ok(())
            }
            _ => Err(ApiError::BadInput(
                "API VIP and Ingress VIP must be provided together".to_string(),
            )),
        }
    }

    fn update_hosts_data(&self, tx: &mut ClusterTx, params: &UpdateClusterRequest) -> ApiResult<()> {
        let cluster = tx.cluster.clone();
        for update in &params.hosts_roles {
            tracing::info!("Update host {} to role: {}", update.id, update.role);
            let role = HostRole::parse(&update.role).ok_or_else(|| {
                ApiError::BadInput(format!("Invalid role {} for host {}", update.role, update.id))
            })?;
            let host = tx.host_mut(update.id)?;
            self.host_service.update_role(&cluster, host, role)?;
        }
        for update in &params.hosts_names {
            tracing::info!(
                "Update host {} to requested hostname {}",
                update.id,
                update.hostname
            );
            let hosts = tx.hosts_snapshot();
            let host = tx.host_mut(update.id)?;
            self.host_service
                .update_hostname(&cluster, &hosts, host, &update.hostname)?;
        }
        Ok(())
    }

    // --- discovery image -----------------------------------------------------

    pub async fn generate_cluster_iso(
        &self,
        cluster_id: Uuid,
        params: ImageCreateParams,
    ) -> ApiResult<Cluster> {
        tracing::info!("prepare image for cluster {}", cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;

        // Metadata in the store has to describe the image that ends up
        // in the object store, so two generations may not race within
        // the same window.
        let now = Utc::now();
        if let Some(previous) = tx.cluster.image_info.created_at {
            if previous + Duration::seconds(IMAGE_REGENERATION_WINDOW_SECONDS) > now {
                let msg = "Failed to generate image: another request to generate an image has been recently submitted - please wait a few seconds and try again";
                self.store
                    .add_event(cluster_id, None, EventSeverity::Error, msg);
                return Err(ApiError::Conflict(
                    "Another request to generate an image has been recently submitted. Please wait a few seconds and try again.".to_string(),
                ));
            }
        }
        if !tx.cluster.pull_secret_set {
            return Err(ApiError::BadInput(
                "Can't generate cluster ISO without pull secret".to_string(),
            ));
        }

        // Same parameters and the image still stored: refresh the tag
        // instead of rebuilding.
        let mut image_exists = false;
        if tx.cluster.image_info.ssh_public_key == params.ssh_public_key
            && tx.cluster.image_info.generator_version == self.config.image_builder
        {
            image_exists = self
                .object_store
                .update_tag(
                    &image_name(cluster_id),
                    "create_sec_since_epoch",
                    &now.timestamp().to_string(),
                )
                .await
                .map_err(|e| {
                    let msg = "Failed to generate image: error contacting storage backend";
                    self.store
                        .add_event(cluster_id, None, EventSeverity::Error, msg);
                    ApiError::TransientBackend(format!("failed to contact storage backend: {}", e))
                })?;
        }

        tx.cluster.image_info.ssh_public_key = params.ssh_public_key.clone();
        tx.cluster.image_info.created_at = Some(now);
        tx.cluster.image_info.expires_at =
            Some(now + Duration::minutes(self.config.image_expiration_minutes));
        tx.cluster.image_info.generator_version = self.config.image_builder.clone();
        tx.cluster.image_info.download_url = None;
        let cluster = tx.cluster.clone();
        // Commit before the long-running generation so a concurrent
        // request observes the new timestamp.
        tx.commit()?;

        if image_exists {
            self.update_image_info_post_upload(cluster_id).await?;
            tracing::info!("Re-used existing cluster <{}> image", cluster_id);
            self.store.add_event(
                cluster_id,
                None,
                EventSeverity::Info,
                "Re-used existing image rather than generating a new one",
            );
            return self.store.get_cluster(cluster_id);
        }

        let ignition_config = ignition::format_ignition_file(
            &cluster,
            &params.ssh_public_key,
            &self.config.agent_docker_image,
            &self.config.service_base_url,
        )
        .map_err(|e| {
            self.store.add_event(
                cluster_id,
                None,
                EventSeverity::Error,
                "Failed to generate image: error formatting ignition file",
            );
            e
        })?;

        self.generator
            .generate_iso(&cluster, &image_name(cluster_id), &ignition_config)
            .await
            .map_err(|e| {
                self.store.add_event(
                    cluster_id,
                    None,
                    EventSeverity::Error,
                    "Failed to generate image: error in image generation",
                );
                e
            })?;

        self.update_image_info_post_upload(cluster_id).await?;

        let key_note = if params.ssh_public_key.is_empty() {
            "SSH public key is not set"
        } else {
            "SSH public key is set"
        };
        self.store.add_event(
            cluster_id,
            None,
            EventSeverity::Info,
            format!(
                "Generated image (proxy URL is \"{}\", {})",
                cluster.http_proxy, key_note
            ),
        );
        self.store.get_cluster(cluster_id)
    }

    /// Record size and, on AWS-like backends, a freshly signed
    /// download URL. Runs on the reuse path as well.
    async fn update_image_info_post_upload(&self, cluster_id: Uuid) -> ApiResult<()> {
        let name = image_name(cluster_id);
        let size = self.object_store.object_size_bytes(&name).await.map_err(|_| {
            ApiError::Internal("Failed to generate image: error fetching size".to_string())
        })?;
        let download_url = if self.object_store.is_aws_like() {
            Some(
                self.object_store
                    .presigned_download_url(
                        &name,
                        Duration::minutes(self.config.image_expiration_minutes),
                    )
                    .await
                    .map_err(|_| {
                        ApiError::Internal(
                            "Failed to generate image: error generating URL".to_string(),
                        )
                    })?,
            )
        } else {
            None
        };
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        tx.cluster.image_info.size_bytes = Some(size);
        tx.cluster.image_info.download_url = download_url;
        tx.commit()
    }

    pub async fn download_cluster_iso(&self, cluster_id: Uuid) -> ApiResult<(String, Vec<u8>)> {
        self.store.get_cluster(cluster_id)?;
        let name = image_name(cluster_id);
        if !self.object_store.exists(&name).await? {
            self.store.add_event(
                cluster_id,
                None,
                EventSeverity::Error,
                "Failed to download image: the image was not found (perhaps it expired) - please generate the image and try again",
            );
            return Err(ApiError::NotFound(
                "The image was not found (perhaps it expired) - please generate the image and try again".to_string(),
            ));
        }
        let data = self.object_store.download(&name).await?;
        self.store.add_event(
            cluster_id,
            None,
            EventSeverity::Info,
            "Started image download",
        );
        Ok((format!("cluster-{}-discovery.iso", cluster_id), data))
    }

    // --- installation --------------------------------------------------------

    /// Synchronous half of the install handoff: strict refresh, the
    /// ready gate, and the preparing transition. The asynchronous half
    /// is detached and reported through events.
    pub async fn install_cluster(&self, cluster_id: Uuid) -> ApiResult<Cluster> {
        let mut tx = self.store.begin_exclusive(cluster_id).await?;

        let cluster_snapshot = tx.cluster.clone();
        let hosts_snapshot = tx.hosts_snapshot();
        tx.for_each_host_mut(|_, host| {
            if host.status == HostStatus::Disabled {
                return Ok(());
            }
            self.host_service
                .refresh_status(&cluster_snapshot, &hosts_snapshot, host, Utc::now())
        })?;
        for host in tx.hosts() {
            if host.status != HostStatus::Disabled && host.status != HostStatus::Known {
                return Err(ApiError::BadInput(format!(
                    "Host {} is in status {} and not ready for install",
                    host.id, host.status
                )));
            }
        }
        let hosts_snapshot = tx.hosts_snapshot();
        self.cluster_service
            .refresh_status(&mut tx.cluster, &hosts_snapshot)?;

        let (ready, reason) = self.cluster_service.is_ready_for_installation(&tx.cluster);
        if !ready {
            return Err(ApiError::Conflict(format!(
                "Cluster is not ready for installation, {}",
                reason
            )));
        }

        self.cluster_service.prepare_for_installation(&mut tx.cluster)?;
        tx.for_each_host_mut(|_, host| {
            if host.status == HostStatus::Disabled {
                return Ok(());
            }
            self.host_service.prepare_for_installation(host)
        })?;
        let cluster = tx.cluster.clone();
        tx.commit()?;

        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.finish_install_handoff(cluster_id).await {
                tracing::warn!("cluster {} install handoff failed: {}", cluster_id, e);
                if let Ok(mut tx) = service.store.begin_exclusive(cluster_id).await {
                    service
                        .cluster_service
                        .handle_pre_install_error(&mut tx.cluster, &e);
                    let _ = tx.commit();
                }
            }
        });

        tracing::info!("Successfully prepared cluster <{}> for installation", cluster_id);
        Ok(cluster)
    }

    /// Detached half: generate the install config, then in a second
    /// exclusive transaction create DNS records, move the cluster to
    /// installing, elect the bootstrap and install every host. A
    /// cluster cancelled in between refuses the transition here and
    /// the task exits.
    async fn finish_install_handoff(&self, cluster_id: Uuid) -> ApiResult<()> {
        let cluster = self.store.get_cluster(cluster_id)?;
        let install_config = render_install_config(&cluster);
        self.generator
            .generate_install_config(&cluster, install_config.as_bytes())
            .await?;

        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        self.dns.create_cluster_records(&tx.cluster).await.map_err(|e| {
            ApiError::Internal(format!(
                "failed to create DNS record sets for base domain {}: {}",
                tx.cluster.base_dns_domain, e
            ))
        })?;
        self.cluster_service.install(&mut tx.cluster)?;
        self.set_bootstrap_host(&mut tx)?;
        tx.for_each_host_mut(|_, host| {
            if host.status == HostStatus::Disabled {
                return Ok(());
            }
            self.host_service.install(host)
        })?;
        tx.commit()?;
        self.store.add_event(
            cluster_id,
            None,
            EventSeverity::Info,
            "Cluster installation started",
        );
        Ok(())
    }

    /// Idempotent bootstrap election: the last of the sorted master
    /// ids, only when no host carries the marker yet.
    fn set_bootstrap_host(&self, tx: &mut ClusterTx) -> ApiResult<()> {
        if tx.hosts().iter().any(|h| h.bootstrap) {
            return Ok(());
        }
        let hosts = tx.hosts_snapshot();
        let master_ids = validation::master_node_ids(&hosts);
        let bootstrap_id = *master_ids.last().ok_or_else(|| {
            ApiError::Internal("Cluster has no master hosts that can operate as bootstrap".to_string())
        })?;
        tracing::info!("Bootstrap ID is {}", bootstrap_id);
        let host = tx.host_mut(bootstrap_id)?;
        self.host_service.set_bootstrap(host, true);
        Ok(())
    }

    pub async fn cancel_installation(&self, cluster_id: Uuid) -> ApiResult<Cluster> {
        tracing::info!("canceling installation for cluster {}", cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        self.cluster_service
            .cancel_installation(&mut tx.cluster, "Installation was cancelled by user")?;
        tx.for_each_host_mut(|_, host| {
            self.host_service
                .cancel_installation(host, "Installation was cancelled by user")
        })?;
        let cluster = tx.cluster.clone();
        tx.commit()?;
        Ok(cluster)
    }

    /// Reset compensation: abort the generation subprocess, delete the
    /// cluster files, drop DNS (best effort) and send every host back
    /// to discovery.
    pub async fn reset_cluster(&self, cluster_id: Uuid) -> ApiResult<Cluster> {
        tracing::info!("resetting cluster {}", cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        self.cluster_service
            .reset_cluster(&mut tx.cluster, "cluster was reset by user")?;
        self.generator.abort_install_config(cluster_id).await?;
        tx.for_each_host_mut(|_, host| {
            self.host_service.reset_host(host, "cluster was reset by user")
        })?;

        for name in CLUSTER_FILE_NAMES {
            self.object_store
                .delete(&format!("{}/{}", cluster_id, name))
                .await?;
        }
        if let Err(e) = self.dns.delete_cluster_records(&tx.cluster).await {
            tracing::warn!(
                "failed to delete DNS record sets for base domain {}: {}",
                tx.cluster.base_dns_domain,
                e
            );
        }
        let cluster = tx.cluster.clone();
        tx.commit()?;
        Ok(cluster)
    }

    pub async fn complete_installation(
        &self,
        cluster_id: Uuid,
        params: CompleteInstallationRequest,
    ) -> ApiResult<Cluster> {
        tracing::info!("complete cluster {} installation", cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        if params.is_success {
            // the merged ingress kubeconfig must be assembled first
            let merged = self
                .object_store
                .exists(&format!("{}/{}", cluster_id, KUBECONFIG))
                .await?;
            if !merged {
                return Err(ApiError::Conflict(format!(
                    "Cluster {} can not be completed: ingress kubeconfig was not assembled",
                    cluster_id
                )));
            }
        }
        self.cluster_service
            .complete_installation(&mut tx.cluster, params.is_success, params.error_info)?;
        let cluster = tx.cluster.clone();
        tx.commit()?;
        Ok(cluster)
    }

    // --- cluster files and credentials ---------------------------------------

    pub async fn upload_ingress_cert(&self, cluster_id: Uuid, ingress_ca: &str) -> ApiResult<()> {
        tracing::info!("upload ingress certificate for cluster {}", cluster_id);
        let cluster = self.store.get_cluster(cluster_id)?;
        self.cluster_service.allow_ingress_cert_upload(&cluster)?;

        let object_name = format!("{}/{}", cluster_id, KUBECONFIG);
        if self.object_store.exists(&object_name).await? {
            tracing::info!("Ingress ca for cluster {} already exists", cluster_id);
            return Ok(());
        }
        let noingress = self
            .object_store
            .download(&format!("{}/{}-noingress", cluster_id, KUBECONFIG))
            .await?;
        let merged = merge_ingress_ca_into_kubeconfig(&noingress, ingress_ca)?;
        self.object_store.upload(merged, &object_name).await
    }

    fn check_file_for_download(&self, cluster: &Cluster, file_name: &str) -> ApiResult<()> {
        if !CLUSTER_FILE_NAMES.contains(&file_name) {
            return Err(ApiError::BadInput(format!(
                "invalid cluster file {}",
                file_name
            )));
        }
        if file_name == KUBECONFIG {
            self.cluster_service.allow_kubeconfig_download(cluster)
        } else {
            self.cluster_service.allow_file_download(cluster)
        }
    }

    pub async fn download_cluster_file(
        &self,
        cluster_id: Uuid,
        file_name: &str,
    ) -> ApiResult<Vec<u8>> {
        let cluster = self.store.get_cluster(cluster_id)?;
        self.check_file_for_download(&cluster, file_name)?;
        self.object_store
            .download(&format!("{}/{}", cluster_id, file_name))
            .await
    }

    pub async fn presigned_cluster_file_url(
        &self,
        cluster_id: Uuid,
        file_name: &str,
    ) -> ApiResult<String> {
        if !self.object_store.is_aws_like() {
            return Err(ApiError::BadInput(
                "Failed to generate presigned URL: invalid backend".to_string(),
            ));
        }
        let cluster = self.store.get_cluster(cluster_id)?;
        self.check_file_for_download(&cluster, file_name)?;
        self.object_store
            .presigned_download_url(
                &format!("{}/{}", cluster_id, file_name),
                Duration::minutes(10),
            )
            .await
    }

    pub async fn get_credentials(&self, cluster_id: Uuid) -> ApiResult<Credentials> {
        let cluster = self.store.get_cluster(cluster_id)?;
        self.cluster_service.allow_credentials(&cluster)?;
        let password = self
            .object_store
            .download(&format!("{}/kubeadmin-password", cluster_id))
            .await?;
        Ok(Credentials {
            username: DEFAULT_USER.to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
            console_url: format!(
                "{}.{}.{}",
                CONSOLE_URL_PREFIX, cluster.name, cluster.base_dns_domain
            ),
        })
    }

    pub fn get_free_addresses(
        &self,
        cluster_id: Uuid,
        network_cidr: &str,
        prefix: Option<&str>,
        limit: Option<i64>,
    ) -> ApiResult<Vec<String>> {
        let (_, hosts) = self.store.get_cluster_with_hosts(cluster_id)?;
        let reporting: Vec<Host> = hosts
            .into_iter()
            .filter(|h| matches!(h.status, HostStatus::Known | HostStatus::Insufficient))
            .collect();
        if reporting.is_empty() {
            return Err(ApiError::NotFound(format!(
                "No hosts were found for cluster {}",
                cluster_id
            )));
        }
        let set = network::make_free_addresses_set(&reporting, network_cidr, prefix);
        let mut addresses: Vec<String> = set.into_iter().collect();
        addresses.sort_by_key(|a| network::ip_as_uint(a));
        Ok(network::apply_limit(addresses, limit))
    }

    pub fn list_events(&self, cluster_id: Uuid, host_id: Option<Uuid>) -> ApiResult<Vec<Event>> {
        self.store.get_cluster(cluster_id)?;
        Ok(self.store.list_events(cluster_id, host_id))
    }

    // --- hosts ---------------------------------------------------------------

    pub async fn register_host(
        &self,
        cluster_id: Uuid,
        params: RegisterHostRequest,
    ) -> ApiResult<Host> {
        tracing::info!("Register host: {} cluster {}", params.host_id, cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;

        if tx.contains_host(params.host_id) {
            let host = tx.host_mut(params.host_id)?;
            self.host_service.re_register(host)?;
        } else {
            self.cluster_service.accepts_registration(&tx.cluster).map_err(|e| {
                self.store.add_event(
                    cluster_id,
                    Some(params.host_id),
                    EventSeverity::Error,
                    "Failed to register host: cluster cannot accept new hosts in its current state",
                );
                e
            })?;
            tx.insert_host(Host::new(
                params.host_id,
                cluster_id,
                params.discovery_agent_version,
            ));
        }
        let mut host = tx.host(params.host_id)?.clone();
        tx.commit()?;

        self.store.add_event(
            cluster_id,
            Some(host.id),
            EventSeverity::Info,
            format!("Host {}: registered to cluster", host.hostname()),
        );
        self.customize_host(&mut host);
        Ok(host)
    }

    pub async fn deregister_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<()> {
        tracing::info!("Deregister host: {} cluster {}", host_id, cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host(host_id)?;
        if host.status.is_installing() {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not be deregistered",
                host_id, host.status
            )));
        }
        tx.remove_host(host_id)?;
        tx.commit()?;
        self.store.add_event(
            cluster_id,
            Some(host_id),
            EventSeverity::Info,
            format!("Host {}: deregistered from cluster", host_id),
        );
        Ok(())
    }

    pub fn get_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Host> {
        let mut host = self.store.get_host(cluster_id, host_id)?;
        self.customize_host(&mut host);
        Ok(host)
    }

    pub fn list_hosts(&self, cluster_id: Uuid) -> ApiResult<Vec<Host>> {
        let mut hosts = self.store.list_hosts(cluster_id)?;
        for host in &mut hosts {
            self.customize_host(host);
        }
        Ok(hosts)
    }

    pub async fn enable_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Host> {
        tracing::info!("enable host: {}", host_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host_mut(host_id)?;
        self.host_service.enable(host)?;
        let mut host = host.clone();
        tx.commit()?;
        self.store.add_event(
            cluster_id,
            Some(host_id),
            EventSeverity::Info,
            "Host enabled by user",
        );
        self.customize_host(&mut host);
        Ok(host)
    }

    pub async fn disable_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Host> {
        tracing::info!("disabling host: {}", host_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host_mut(host_id)?;
        self.host_service.disable(host)?;
        let mut host = host.clone();
        tx.commit()?;
        self.store.add_event(
            cluster_id,
            Some(host_id),
            EventSeverity::Info,
            "Host disabled by user",
        );
        self.customize_host(&mut host);
        Ok(host)
    }

    /// Single-host reset, for a host that failed or was cancelled
    /// while the rest of the cluster moves on.
    pub async fn reset_host(&self, cluster_id: Uuid, host_id: Uuid) -> ApiResult<Host> {
        tracing::info!("resetting host: {}", host_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host_mut(host_id)?;
        if !matches!(host.status, HostStatus::Error | HostStatus::Cancelled) {
            return Err(ApiError::Conflict(format!(
                "Host {} is in status {} and can not be reset",
                host_id, host.status
            )));
        }
        self.host_service.reset_host(host, "host was reset by user")?;
        let mut host = host.clone();
        tx.commit()?;
        self.customize_host(&mut host);
        Ok(host)
    }

    pub async fn update_host_install_progress(
        &self,
        cluster_id: Uuid,
        host_id: Uuid,
        progress: HostProgressReport,
    ) -> ApiResult<()> {
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host_mut(host_id)?;
        self.host_service.update_install_progress(host, &progress)?;
        let hostname = host.hostname();
        let hosts = tx.hosts_snapshot();
        self.cluster_service.refresh_installing(&mut tx.cluster, &hosts)?;
        tx.commit()?;

        let mut event = format!("reached installation stage {}", progress.current_stage);
        if !progress.progress_info.is_empty() {
            event.push_str(&format!(": {}", progress.progress_info));
        }
        tracing::info!("Host {} in cluster {}: {}", host_id, cluster_id, event);
        self.store.add_event(
            cluster_id,
            Some(host_id),
            EventSeverity::Info,
            format!("Host {}: {}", hostname, event),
        );
        Ok(())
    }

    pub async fn upload_host_logs(
        &self,
        cluster_id: Uuid,
        host_id: Uuid,
        file_name: &str,
        data: Vec<u8>,
    ) -> ApiResult<()> {
        tracing::info!("Uploading logs from host {} in cluster {}", host_id, cluster_id);
        let mut tx = self.store.begin_exclusive(cluster_id).await?;
        let host = tx.host_mut(host_id)?;
        let hostname = host.hostname();
        host.logs_state = crate::models::LogsState::Completed;
        tx.commit()?;
        let object_name = format!("{}/logs/{}/{}", cluster_id, hostname, file_name);
        self.object_store.upload(data, &object_name).await
    }
}

/// The install-config document handed to the generator.
fn render_install_config(cluster: &Cluster) -> String {
    format!(
        r#"apiVersion: v1
baseDomain: {base}
metadata:
  name: {name}
networking:
  clusterNetwork:
  - cidr: {cluster_cidr}
    hostPrefix: {host_prefix}
  machineNetwork:
  - cidr: {machine_cidr}
  serviceNetwork:
  - {service_cidr}
platform:
  none: {{}}
pullSecret: '{pull_secret}'
sshKey: '{ssh_key}'
"#,
        base = cluster.base_dns_domain,
        name = cluster.name,
        cluster_cidr = cluster.cluster_network_cidr,
        host_prefix = cluster.cluster_network_host_prefix,
        machine_cidr = cluster.machine_network_cidr,
        service_cidr = cluster.service_network_cidr,
        pull_secret = cluster.pull_secret,
        ssh_key = cluster.ssh_public_key,
    )
}

/// Append the user-provided ingress CA to the cluster CA embedded in
/// the kubeconfig. The CA is merged verbatim.
fn merge_ingress_ca_into_kubeconfig(kubeconfig: &[u8], ingress_ca: &str) -> ApiResult<Vec<u8>> {
    use base64::{engine::general_purpose, Engine as _};

    if !ingress_ca.contains("-----BEGIN CERTIFICATE-----") {
        return Err(ApiError::Internal(
            "given ingress-ca is not valid PEM format".to_string(),
        ));
    }
    let text = String::from_utf8(kubeconfig.to_vec())
        .map_err(|_| ApiError::Internal("kubeconfig is not valid text".to_string()))?;
    let marker = "certificate-authority-data: ";
    let mut merged = String::with_capacity(text.len() + ingress_ca.len());
    let mut found = false;
    for line in text.lines() {
        if let Some(position) = line.find(marker) {
            let (head, value) = line.split_at(position + marker.len());
            let cluster_ca = general_purpose::STANDARD.decode(value.trim()).map_err(|_| {
                ApiError::Internal("kubeconfig CertificateAuthorityData not found".to_string())
            })?;
            let mut new_ca = ingress_ca.as_bytes().to_vec();
            new_ca.extend_from_slice(&cluster_ca);
            merged.push_str(head);
            merged.push_str(&general_purpose::STANDARD.encode(new_ca));
            merged.push('\n');
            found = true;
        } else {
            merged.push_str(line);
            merged.push('\n');
        }
    }
    if !found {
        return Err(ApiError::Internal(
            "kubeconfig is missing expected data".to_string(),
        ));
    }
    Ok(merged.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};

    #[test]
    fn ingress_ca_merge_appends_to_the_cluster_ca() {
        let cluster_ca = "-----BEGIN CERTIFICATE-----\ncluster\n-----END CERTIFICATE-----\n";
        let kubeconfig = format!(
            "apiVersion: v1\nclusters:\n- cluster:\n    certificate-authority-data: {}\n    server: https://api\n",
            general_purpose::STANDARD.encode(cluster_ca)
        );
        let ingress_ca = "-----BEGIN CERTIFICATE-----\ningress\n-----END CERTIFICATE-----\n";
        let merged = merge_ingress_ca_into_kubeconfig(kubeconfig.as_bytes(), ingress_ca).unwrap();
        let merged = String::from_utf8(merged).unwrap();
        let value = merged
            .lines()
            .find_map(|l| l.trim().strip_prefix("certificate-authority-data: "))
            .unwrap();
        let decoded = String::from_utf8(general_purpose::STANDARD.decode(value).unwrap()).unwrap();
        assert!(decoded.starts_with(ingress_ca));
        assert!(decoded.contains("cluster"));
    }

    #[test]
    fn ingress_ca_must_be_pem() {
        assert!(merge_ingress_ca_into_kubeconfig(b"whatever", "not a cert").is_err());
    }

    #[test]
    fn install_config_carries_the_network_layout() {
        let params = CreateClusterRequest {
            name: "demo".to_string(),
            base_dns_domain: Some("example.com".to_string()),
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
        let mut cluster = Cluster::new(Uuid::new_v4(), params, String::new(), String::new());
        cluster.machine_network_cidr = "192.168.1.0/24".to_string();
        let config = render_install_config(&cluster);
        assert!(config.contains("baseDomain: example.com"));
        assert!(config.contains("cidr: 10.128.0.0/14"));
        assert!(config.contains("cidr: 192.168.1.0/24"));
        assert!(config.contains("hostPrefix: 23"));
    }
}
