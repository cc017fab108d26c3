use metalforge_backend::models::{
    Cluster, ClusterStatus, CreateClusterRequest, Host, HostStage, HostStatus, Step, StepType,
};
use uuid::Uuid;

fn create_params(name: &str) -> CreateClusterRequest {
    CreateClusterRequest {
        name: name.to_string(),
        base_dns_domain: None,
        openshift_version: Some("4.5".to_string()),
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
    }
}

#[test]
fn new_cluster_gets_network_defaults() {
    let cluster = Cluster::new(
        Uuid::new_v4(),
        create_params("demo"),
        "admin".to_string(),
        String::new(),
    );
    assert_eq!(cluster.cluster_network_cidr, "10.128.0.0/14");
    assert_eq!(cluster.cluster_network_host_prefix, 23);
    assert_eq!(cluster.service_network_cidr, "172.30.0.0/16");
    assert_eq!(cluster.status, ClusterStatus::Insufficient);
    assert!(!cluster.vip_dhcp_allocation);
}

#[test]
fn cluster_statuses_serialize_kebab_case() {
    let json = serde_json::to_string(&ClusterStatus::PreparingForInstallation).unwrap();
    assert_eq!(json, "\"preparing-for-installation\"");
    let json = serde_json::to_string(&ClusterStatus::InstallingPendingUserAction).unwrap();
    assert_eq!(json, "\"installing-pending-user-action\"");
    let parsed: ClusterStatus = serde_json::from_str("\"pending-for-input\"").unwrap();
    assert_eq!(parsed, ClusterStatus::PendingForInput);
}

#[test]
fn host_statuses_serialize_kebab_case() {
    let json = serde_json::to_string(&HostStatus::PreparingSuccessful).unwrap();
    assert_eq!(json, "\"preparing-successful\"");
    let parsed: HostStatus = serde_json::from_str("\"resetting-pending-user-action\"").unwrap();
    assert_eq!(parsed, HostStatus::ResettingPendingUserAction);
}

#[test]
fn pull_secret_never_serializes() {
    let mut cluster = Cluster::new(
        Uuid::new_v4(),
        create_params("demo"),
        String::new(),
        String::new(),
    );
    cluster.set_pull_secret("{\"auths\":{}}".to_string());
    let json = serde_json::to_string(&cluster).unwrap();
    assert!(!json.contains("auths"));
    assert!(json.contains("\"pull_secret_set\":true"));
}

#[test]
fn host_effective_hostname_prefers_the_requested_one() {
    let mut host = Host::new(Uuid::new_v4(), Uuid::new_v4(), String::new());
    // no inventory, no request: the id
    assert_eq!(host.hostname(), host.id.to_string());

    host.inventory = r#"{"hostname":"discovered"}"#.to_string();
    assert_eq!(host.hostname(), "discovered");

    host.requested_hostname = "requested".to_string();
    assert_eq!(host.hostname(), "requested");
}

#[test]
fn step_wire_format_is_stable() {
    let step = Step {
        step_id: "inventory-01234567".to_string(),
        step_type: StepType::Inventory,
        command: "podman".to_string(),
        args: vec!["run".to_string()],
        reply_timeout_s: 60,
    };
    let json = serde_json::to_value(&step).unwrap();
    assert_eq!(json["step_type"], "inventory");
    assert_eq!(json["step_id"], "inventory-01234567");
}

#[test]
fn host_stages_serialize_kebab_case() {
    let json = serde_json::to_string(&HostStage::WritingImageToDisk).unwrap();
    assert_eq!(json, "\"writing-image-to-disk\"");
    let parsed: HostStage = serde_json::from_str("\"waiting-for-control-plane\"").unwrap();
    assert_eq!(parsed, HostStage::WaitingForControlPlane);
}
