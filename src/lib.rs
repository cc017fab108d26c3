// MetalForge Backend Library
// Экспортируем публичные модули для использования в тестах

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;

pub use config::Config;
pub use error::ApiError;

use chrono::Duration;
use services::dns::{DnsProvider, InMemoryDnsProvider};
use services::iso::{IsoGenerator, LocalIsoGenerator};
use services::monitor::{AlwaysLeader, LeaderElector};
use services::{
    ClusterService, DnsService, HostService, InventoryService, MonitorService, StepService,
};
use store::object_store::{InMemoryObjectStore, ObjectStore};
use store::Store;

// Основная структура состояния приложения
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub inventory: InventoryService,
    pub steps: StepService,
}

/// Wire the whole service graph from a config. The returned monitor is
/// not yet running; call `spawn` on it.
pub fn build_app(config: Config) -> (AppState, MonitorService) {
    let object_store: Arc<dyn ObjectStore> =
        InMemoryObjectStore::new(config.aws_like_object_store);
    let dns_provider: Arc<dyn DnsProvider> = InMemoryDnsProvider::new();
    let generator: Arc<dyn IsoGenerator> = LocalIsoGenerator::new(object_store.clone());
    let leader: Arc<dyn LeaderElector> = Arc::new(AlwaysLeader);
    build_app_with(config, object_store, dns_provider, generator, leader)
}

/// Same wiring with the external collaborators supplied by the caller;
/// tests use this to observe the DNS provider and the object store.
pub fn build_app_with(
    config: Config,
    object_store: Arc<dyn ObjectStore>,
    dns_provider: Arc<dyn DnsProvider>,
    generator: Arc<dyn IsoGenerator>,
    leader: Arc<dyn LeaderElector>,
) -> (AppState, MonitorService) {
    let store = Store::new();
    let host_service = HostService::new(
        store.clone(),
        Duration::minutes(config.disconnection_timeout_minutes),
    );
    let cluster_service = ClusterService::new(store.clone());
    let dns = DnsService::new(config.base_dns_domains.clone(), dns_provider);
    let inventory = InventoryService::new(
        config.clone(),
        store.clone(),
        host_service.clone(),
        cluster_service.clone(),
        dns,
        object_store,
        generator,
    );
    let steps = StepService::new(
        config.clone(),
        store.clone(),
        host_service.clone(),
        cluster_service.clone(),
    );
    let monitor = MonitorService::new(
        store,
        host_service,
        cluster_service,
        leader,
        std::time::Duration::from_secs(config.monitor_interval_seconds),
        config.monitor_batch_size,
    );
    (
        AppState {
            config,
            inventory,
            steps,
        },
        monitor,
    )
}

/// The REST surface. Shared between the binary and the integration
/// tests.
pub fn api_router(state: AppState) -> axum::Router {
    use axum::routing::{get, post};
    use handlers::{
        cluster_handler, download_handler, health_handler, host_handler, instruction_handler,
    };

    axum::Router::new()
        .route("/health", get(health_handler::health_check))
        .route(
            "/clusters",
            post(cluster_handler::register_cluster).get(cluster_handler::list_clusters),
        )
        .route(
            "/clusters/:cluster_id",
            get(cluster_handler::get_cluster)
                .patch(cluster_handler::update_cluster)
                .delete(cluster_handler::deregister_cluster),
        )
        .route(
            "/clusters/:cluster_id/downloads/image",
            post(download_handler::generate_cluster_iso)
                .get(download_handler::download_cluster_iso),
        )
        .route(
            "/clusters/:cluster_id/downloads/files",
            get(download_handler::download_cluster_files),
        )
        .route(
            "/clusters/:cluster_id/downloads/files-presigned",
            get(download_handler::get_presigned_for_cluster_files),
        )
        .route(
            "/clusters/:cluster_id/downloads/kubeconfig",
            get(download_handler::download_cluster_kubeconfig),
        )
        .route(
            "/clusters/:cluster_id/uploads/ingress-cert",
            post(download_handler::upload_cluster_ingress_cert),
        )
        .route(
            "/clusters/:cluster_id/actions/install",
            post(cluster_handler::install_cluster),
        )
        .route(
            "/clusters/:cluster_id/actions/cancel",
            post(cluster_handler::cancel_installation),
        )
        .route(
            "/clusters/:cluster_id/actions/reset",
            post(cluster_handler::reset_cluster),
        )
        .route(
            "/clusters/:cluster_id/actions/complete_installation",
            post(cluster_handler::complete_installation),
        )
        .route(
            "/clusters/:cluster_id/credentials",
            get(cluster_handler::get_credentials),
        )
        .route(
            "/clusters/:cluster_id/free_addresses",
            get(cluster_handler::get_free_addresses),
        )
        .route(
            "/clusters/:cluster_id/events",
            get(cluster_handler::list_events),
        )
        .route(
            "/clusters/:cluster_id/hosts",
            post(host_handler::register_host).get(host_handler::list_hosts),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id",
            get(host_handler::get_host).delete(host_handler::deregister_host),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/instructions",
            get(instruction_handler::get_next_steps).post(instruction_handler::post_step_reply),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/actions/enable",
            post(host_handler::enable_host),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/actions/disable",
            post(host_handler::disable_host),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/actions/reset",
            post(host_handler::reset_host),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/actions/debug",
            post(host_handler::set_debug_step),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/progress",
            post(host_handler::update_install_progress),
        )
        .route(
            "/clusters/:cluster_id/hosts/:host_id/logs",
            post(host_handler::upload_host_logs),
        )
        .with_state(state)
}
