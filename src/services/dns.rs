// Cluster DNS record management. Hosted zones are configured per base
// domain as "<zoneId>/<provider>"; route53 is the only provider wired
// up. The provider itself sits behind a trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{ApiError, ApiResult};
use crate::models::Cluster;

const RECORD_TTL_SECONDS: u32 = 60;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_record_set(
        &self,
        zone_id: &str,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> ApiResult<()>;
    async fn delete_record_set(&self, zone_id: &str, name: &str, value: &str) -> ApiResult<()>;
}

/// In-process provider keeping records in a map. Tests inspect it;
/// deployments swap a real route53 client in.
#[derive(Default)]
pub struct InMemoryDnsProvider {
    records: RwLock<HashMap<String, String>>,
}

impl InMemoryDnsProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryDnsProvider::default())
    }

    pub fn records(&self) -> HashMap<String, String> {
        self.records.read().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for InMemoryDnsProvider {
    async fn create_record_set(
        &self,
        zone_id: &str,
        name: &str,
        value: &str,
        _ttl: u32,
    ) -> ApiResult<()> {
        let mut records = self.records.write().unwrap();
        records.insert(format!("{}/{}", zone_id, name), value.to_string());
        Ok(())
    }

    async fn delete_record_set(&self, zone_id: &str, name: &str, _value: &str) -> ApiResult<()> {
        let mut records = self.records.write().unwrap();
        records.remove(&format!("{}/{}", zone_id, name));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsDomain {
    pub name: String,
    pub zone_id: String,
    pub provider: String,
    pub api_domain_name: String,
    pub ingress_domain_name: String,
}

/// Resolve the hosted zone for a cluster from the configured base
/// domains map. `None` means the base domain is not managed and DNS
/// is skipped.
pub fn dns_domain(
    base_dns_domains: &HashMap<String, String>,
    cluster_name: &str,
    base_domain: &str,
) -> ApiResult<Option<DnsDomain>> {
    let value = match base_dns_domains.get(base_domain) {
        Some(v) => v,
        None => return Ok(None),
    };
    let (zone_id, provider) = value.split_once('/').ok_or_else(|| {
        ApiError::Internal(format!("Invalid DNS domain configuration: {}", value))
    })?;
    if zone_id.is_empty() || provider.is_empty() {
        return Ok(None);
    }
    Ok(Some(DnsDomain {
        name: base_domain.to_string(),
        zone_id: zone_id.to_string(),
        provider: provider.to_string(),
        api_domain_name: format!("api.{}.{}", cluster_name, base_domain),
        ingress_domain_name: format!("*.apps.{}.{}", cluster_name, base_domain),
    }))
}

#[derive(Clone)]
pub struct DnsService {
    base_dns_domains: HashMap<String, String>,
    provider: Arc<dyn DnsProvider>,
}

impl DnsService {
    pub fn new(base_dns_domains: HashMap<String, String>, provider: Arc<dyn DnsProvider>) -> Self {
        DnsService {
            base_dns_domains,
            provider,
        }
    }

    async fn change_record_sets(&self, cluster: &Cluster, delete: bool) -> ApiResult<()> {
        let domain = match dns_domain(&self.base_dns_domains, &cluster.name, &cluster.base_dns_domain)? {
            Some(domain) => domain,
            None => return Ok(()),
        };
        if domain.provider != "route53" {
            tracing::warn!(
                "unsupported DNS provider {} for base domain {}",
                domain.provider,
                domain.name
            );
            return Ok(());
        }
        for (name, value) in [
            (&domain.api_domain_name, &cluster.api_vip),
            (&domain.ingress_domain_name, &cluster.ingress_vip),
        ] {
            if delete {
                self.provider
                    .delete_record_set(&domain.zone_id, name, value)
                    .await?;
            } else {
                self.provider
                    .create_record_set(&domain.zone_id, name, value, RECORD_TTL_SECONDS)
                    .await?;
            }
        }
        tracing::info!(
            "{} DNS records for base domain {}",
            if delete { "deleted" } else { "created" },
            cluster.base_dns_domain
        );
        Ok(())
    }

    /// Create failure is fatal to the caller (the install aborts).
    pub async fn create_cluster_records(&self, cluster: &Cluster) -> ApiResult<()> {
        self.change_record_sets(cluster, false).await
    }

    /// Delete failure is the caller's to downgrade to a warning.
    pub async fn delete_cluster_records(&self, cluster: &Cluster) -> ApiResult<()> {
        self.change_record_sets(cluster, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_resolution_splits_zone_and_provider() {
        let mut domains = HashMap::new();
        domains.insert("example.com".to_string(), "Z123/route53".to_string());
        let domain = dns_domain(&domains, "demo", "example.com").unwrap().unwrap();
        assert_eq!(domain.zone_id, "Z123");
        assert_eq!(domain.provider, "route53");
        assert_eq!(domain.api_domain_name, "api.demo.example.com");
        assert_eq!(domain.ingress_domain_name, "*.apps.demo.example.com");

        assert!(dns_domain(&domains, "demo", "other.com").unwrap().is_none());
        domains.insert("bad.com".to_string(), "nozone".to_string());
        assert!(dns_domain(&domains, "demo", "bad.com").is_err());
    }
}
