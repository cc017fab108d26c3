use metalforge_backend::Config;

#[test]
fn config_load_falls_back_to_defaults() {
    let config = Config::load().unwrap();
    assert!(!config.server_address.is_empty());
    assert!(!config.agent_docker_image.is_empty());
    assert!(config.image_expiration_minutes > 0);
    assert!(config.monitor_batch_size > 0);
    assert!(config.monitor_interval_seconds > 0);
    assert!(config.disconnection_timeout_minutes > 0);
}

#[test]
fn config_is_cloneable_and_serializable() {
    let config = Config::load().unwrap();
    let cloned = config.clone();
    assert_eq!(config.server_address, cloned.server_address);
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("server_address"));
}
