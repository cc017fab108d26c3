// Discovery-image and install-config generation contract. The real
// builder runs out of process for minutes; the local implementation
// synthesizes the artifacts straight into the object store so the
// whole lifecycle can run in development and tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::Cluster;
use crate::store::object_store::ObjectStore;

#[async_trait]
pub trait IsoGenerator: Send + Sync {
    /// Build the discovery image for the cluster and upload it under
    /// `image_name`. Long-running.
    async fn generate_iso(
        &self,
        cluster: &Cluster,
        image_name: &str,
        ignition_config: &str,
    ) -> ApiResult<()>;

    /// Produce the per-cluster install artifacts (ignitions,
    /// kubeconfigs, metadata) from the rendered install config.
    async fn generate_install_config(&self, cluster: &Cluster, config: &[u8]) -> ApiResult<()>;

    /// Kill an in-flight install-config generation, if any.
    async fn abort_install_config(&self, cluster_id: Uuid) -> ApiResult<()>;
}

pub struct LocalIsoGenerator {
    object_store: Arc<dyn ObjectStore>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl LocalIsoGenerator {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(LocalIsoGenerator {
            object_store,
            in_flight: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl IsoGenerator for LocalIsoGenerator {
    async fn generate_iso(
        &self,
        cluster: &Cluster,
        image_name: &str,
        ignition_config: &str,
    ) -> ApiResult<()> {
        // The image payload embeds the ignition the way the real
        // builder does; everything else is filler.
        let mut payload = Vec::with_capacity(ignition_config.len() + 64);
        payload.extend_from_slice(b"metalforge-discovery-image\n");
        payload.extend_from_slice(ignition_config.as_bytes());
        self.object_store.upload(payload, image_name).await.map_err(|e| {
            ApiError::TransientBackend(format!(
                "failed to upload discovery image for cluster {}: {}",
                cluster.id, e
            ))
        })
    }

    async fn generate_install_config(&self, cluster: &Cluster, config: &[u8]) -> ApiResult<()> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.insert(cluster.id);
        }
        let result = async {
            self.object_store
                .upload(config.to_vec(), &format!("{}/install-config.yaml", cluster.id))
                .await?;
            for name in [
                "bootstrap.ign",
                "master.ign",
                "worker.ign",
                "metadata.json",
                "kubeadmin-password",
            ] {
                let body = format!("{}:{}", cluster.id, name).into_bytes();
                self.object_store
                    .upload(body, &format!("{}/{}", cluster.id, name))
                    .await?;
            }
            self.object_store
                .upload(
                    render_noingress_kubeconfig(cluster).into_bytes(),
                    &format!("{}/kubeconfig-noingress", cluster.id),
                )
                .await?;
            Ok(())
        }
        .await;
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.remove(&cluster.id);
        result
    }

    async fn abort_install_config(&self, cluster_id: Uuid) -> ApiResult<()> {
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.remove(&cluster_id);
        Ok(())
    }
}

/// A kubeconfig pointing at the cluster API with a placeholder CA,
/// before the ingress certificate is merged in.
fn render_noingress_kubeconfig(cluster: &Cluster) -> String {
    use base64::{engine::general_purpose, Engine as _};
    let ca = format!(
        "-----BEGIN CERTIFICATE-----\ncluster-ca-{}\n-----END CERTIFICATE-----\n",
        cluster.id
    );
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: https://api.{name}.{base}:6443\n    certificate-authority-data: {ca}\n",
        name = cluster.name,
        base = cluster.base_dns_domain,
        ca = general_purpose::STANDARD.encode(ca)
    )
}
