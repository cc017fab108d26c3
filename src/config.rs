use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_address: String,
    pub service_base_url: String,
    pub agent_docker_image: String,
    pub image_builder: String,
    pub image_expiration_minutes: i64,
    pub monitor_interval_seconds: u64,
    pub monitor_batch_size: usize,
    pub disconnection_timeout_minutes: i64,
    /// base domain -> "<zoneId>/<provider>"
    pub base_dns_domains: HashMap<String, String>,
    pub log_level: String,
    pub aws_like_object_store: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Опциональная загрузка .env только если явно указано USE_DOTENV=true
        if env::var("USE_DOTENV").ok().as_deref() == Some("true") {
            dotenv::dotenv().ok();
        }

        let config = Config {
            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8090".to_string()),
            service_base_url: env::var("SERVICE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8090".to_string()),
            agent_docker_image: env::var("AGENT_DOCKER_IMAGE")
                .unwrap_or_else(|_| "quay.io/metalforge/agent:latest".to_string()),
            image_builder: env::var("IMAGE_BUILDER")
                .unwrap_or_else(|_| "quay.io/metalforge/image-builder:latest".to_string()),
            image_expiration_minutes: env::var("IMAGE_EXPIRATION_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            monitor_interval_seconds: env::var("MONITOR_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            monitor_batch_size: env::var("MONITOR_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            disconnection_timeout_minutes: env::var("DISCONNECTION_TIMEOUT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            base_dns_domains: parse_base_dns_domains(
                &env::var("BASE_DNS_DOMAINS").unwrap_or_default(),
            ),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            aws_like_object_store: env::var("AWS_LIKE_OBJECT_STORE")
                .ok()
                .map(|v| v == "true")
                .unwrap_or(false),
        };

        Ok(config)
    }
}

/// "example.com=Z123/route53,other.org=Z456/route53"
fn parse_base_dns_domains(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (domain, zone) = pair.split_once('=')?;
            if domain.is_empty() || zone.is_empty() {
                return None;
            }
            Some((domain.trim().to_string(), zone.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dns_domains_parse() {
        let domains = parse_base_dns_domains("example.com=Z123/route53,other.org=Z456/route53");
        assert_eq!(domains.len(), 2);
        assert_eq!(domains["example.com"], "Z123/route53");
        assert!(parse_base_dns_domains("").is_empty());
        assert!(parse_base_dns_domains("garbage").is_empty());
    }
}
