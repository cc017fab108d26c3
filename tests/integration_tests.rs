// REST surface tests over the full router, axum-test TestServer.

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use uuid::Uuid;

use metalforge_backend::{api_router, build_app, Config};

const PULL_SECRET: &str = r#"{"auths":{"cloud.openshift.com":{"auth":"dXNlcjp0b2tlbg=="}}}"#;

fn create_test_config() -> Config {
    Config {
        server_address: "0.0.0.0:8090".to_string(),
        service_base_url: "http://localhost:8090".to_string(),
        agent_docker_image: "quay.io/metalforge/agent:latest".to_string(),
        image_builder: "quay.io/metalforge/image-builder:latest".to_string(),
        image_expiration_minutes: 60,
        monitor_interval_seconds: 10,
        monitor_batch_size: 100,
        disconnection_timeout_minutes: 3,
        base_dns_domains: Default::default(),
        log_level: "info".to_string(),
        aws_like_object_store: true,
    }
}

fn create_test_server() -> TestServer {
    let (state, _monitor) = build_app(create_test_config());
    TestServer::new(api_router(state)).unwrap()
}

fn inventory_output(hostname: &str, address: &str) -> String {
    json!({
        "hostname": hostname,
        "cpu": {"count": 8},
        "memory": {"physical_bytes": 34359738368u64, "usable_bytes": 34359738368u64},
        "interfaces": [{"name": "eth0", "ipv4_addresses": [address]}]
    })
    .to_string()
}

fn connectivity_output(peers: &[Uuid]) -> String {
    json!({
        "remote_hosts": peers.iter().map(|p| json!({
            "host_id": p,
            "l2_connectivity": [{"outgoing_ip_address": "192.168.1.10", "successful": true}]
        })).collect::<Vec<_>>()
    })
    .to_string()
}

#[tokio::test]
async fn test_health_check() {
    let server = create_test_server();
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let health: Value = serde_json::from_str(&response.text()).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "metalforge-backend");
}

#[tokio::test]
async fn test_cluster_registration_validation() {
    let server = create_test_server();

    // имя кластера должно быть DNS-совместимым
    let response = server
        .post("/clusters")
        .json(&json!({"name": "Bad_Name", "pull_secret": PULL_SECRET}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": "not json"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    assert_eq!(cluster["status"], "insufficient");
    assert_eq!(cluster["cluster_network_cidr"], "10.128.0.0/14");
}

#[tokio::test]
async fn test_unknown_cluster_is_not_found() {
    let server = create_test_server();
    let response = server.get(&format!("/clusters/{}", Uuid::new_v4())).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_install_flow_over_rest() {
    let server = create_test_server();

    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    let cluster_id = cluster["id"].as_str().unwrap().to_string();

    let mut host_ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    host_ids.sort();
    for host_id in &host_ids {
        let response = server
            .post(&format!("/clusters/{}/hosts", cluster_id))
            .json(&json!({"host_id": host_id, "discovery_agent_version": "v1"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
    }

    // the agent poll returns an inventory instruction first
    let response = server
        .get(&format!(
            "/clusters/{}/hosts/{}/instructions",
            cluster_id, host_ids[0]
        ))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let steps: Value = serde_json::from_str(&response.text()).unwrap();
    assert_eq!(steps["instructions"][0]["step_type"], "inventory");

    for (index, host_id) in host_ids.iter().enumerate() {
        let response = server
            .post(&format!(
                "/clusters/{}/hosts/{}/instructions",
                cluster_id, host_id
            ))
            .json(&json!({
                "step_id": "inventory-00000000",
                "step_type": "inventory",
                "exit_code": 0,
                "output": inventory_output(
                    &format!("node-{}", index),
                    &format!("192.168.1.1{}/24", index)
                ),
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
    }
    for host_id in &host_ids {
        let peers: Vec<Uuid> = host_ids.iter().filter(|p| *p != host_id).copied().collect();
        let response = server
            .post(&format!(
                "/clusters/{}/hosts/{}/instructions",
                cluster_id, host_id
            ))
            .json(&json!({
                "step_id": "connectivity-check-00000000",
                "step_type": "connectivity-check",
                "exit_code": 0,
                "output": connectivity_output(&peers),
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
    }

    let response = server
        .patch(&format!("/clusters/{}", cluster_id))
        .json(&json!({
            "api_vip": "192.168.1.100",
            "ingress_vip": "192.168.1.101",
            "hosts_roles": host_ids.iter()
                .map(|id| json!({"id": id, "role": "master"}))
                .collect::<Vec<_>>(),
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    assert_eq!(cluster["status"], "ready");
    assert_eq!(cluster["machine_network_cidr"], "192.168.1.0/24");

    let response = server
        .post(&format!("/clusters/{}/actions/install", cluster_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);

    // the detached handoff finishes shortly after
    let mut installing = false;
    for _ in 0..100 {
        let response = server.get(&format!("/clusters/{}", cluster_id)).await;
        let cluster: Value = serde_json::from_str(&response.text()).unwrap();
        if cluster["status"] == "installing" {
            installing = true;
            let bootstraps: Vec<&Value> = cluster["hosts"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|h| h["bootstrap"] == true)
                .collect();
            assert_eq!(bootstraps.len(), 1);
            assert_eq!(
                bootstraps[0]["id"].as_str().unwrap(),
                host_ids.last().unwrap().to_string()
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(installing, "cluster never reached installing over REST");
}

#[tokio::test]
async fn test_image_generation_rate_limit_over_rest() {
    let server = create_test_server();
    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    let cluster_id = cluster["id"].as_str().unwrap().to_string();

    let response = server
        .post(&format!("/clusters/{}/downloads/image", cluster_id))
        .json(&json!({"ssh_public_key": ""}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let response = server
        .post(&format!("/clusters/{}/downloads/image", cluster_id))
        .json(&json!({"ssh_public_key": ""}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let error: Value = serde_json::from_str(&response.text()).unwrap();
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("wait a few seconds"));

    // the image itself is downloadable
    let response = server
        .get(&format!("/clusters/{}/downloads/image", cluster_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(!response.as_bytes().is_empty());
}

#[tokio::test]
async fn test_cancel_requires_a_running_installation() {
    let server = create_test_server();
    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    let cluster_id = cluster["id"].as_str().unwrap().to_string();

    let response = server
        .post(&format!("/clusters/{}/actions/cancel", cluster_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_kubeconfig_is_gated_before_install() {
    let server = create_test_server();
    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    let cluster_id = cluster["id"].as_str().unwrap().to_string();

    let response = server
        .get(&format!("/clusters/{}/downloads/kubeconfig", cluster_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_free_addresses_requires_reporting_hosts() {
    let server = create_test_server();
    let response = server
        .post("/clusters")
        .json(&json!({"name": "demo", "pull_secret": PULL_SECRET}))
        .await;
    let cluster: Value = serde_json::from_str(&response.text()).unwrap();
    let cluster_id = cluster["id"].as_str().unwrap().to_string();

    let response = server
        .get(&format!(
            "/clusters/{}/free_addresses?network=192.168.1.0/24",
            cluster_id
        ))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
