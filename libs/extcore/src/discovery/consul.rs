//! Consul-shaped HTTP implementation of `RegistryBackend`.
//!
//! Grounded on the pack's `harborgrid-justin-rusty-db::networking::discovery::consul`
//! (`reqwest`-based catalog client, `build_url`/`parse_health_status` helpers).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::discovery::backend::{
    AdvertisedService, HealthStatus, RegistryBackend, ServiceCheck, ServiceRegistration,
};

pub struct ConsulBackend {
    base_url: String,
    http: reqwest::Client,
}

impl ConsulBackend {
    pub fn new(scheme: &str, address: &str) -> Self {
        Self {
            base_url: format!("{scheme}://{address}"),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("reqwest client"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct ConsulCatalogService {
    #[serde(rename = "ServiceID")]
    service_id: String,
    #[serde(rename = "ServiceName")]
    service_name: String,
    #[serde(rename = "ServiceAddress")]
    service_address: String,
    #[serde(rename = "ServiceTags")]
    service_tags: Vec<String>,
    #[serde(rename = "ServiceMeta")]
    service_meta: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ConsulHealthCheck {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Output")]
    output: String,
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    async fn register(&self, reg: ServiceRegistration) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "ID": reg.instance_id,
            "Name": reg.service_name,
            "Address": reg.address,
            "Tags": reg.tags,
            "Meta": reg.metadata,
            "Check": reg.health_check.map(|h| serde_json::json!({
                "HTTP": h.url,
                "Interval": humantime::format_duration(h.interval).to_string(),
                "Timeout": humantime::format_duration(h.timeout).to_string(),
                "DeregisterCriticalServiceAfter": humantime::format_duration(h.deregister_after).to_string(),
            })),
        });
        self.http
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> anyhow::Result<()> {
        let instance_id = urlencoding::encode(instance_id);
        self.http
            .put(self.url(&format!("/v1/agent/service/deregister/{instance_id}")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<HashMap<String, AdvertisedService>> {
        let services: HashMap<String, Vec<ConsulCatalogService>> = self
            .http
            .get(self.url("/v1/catalog/services"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .unwrap_or_default();

        let mut out = HashMap::new();
        for name in services.keys() {
            let encoded_name = urlencoding::encode(name);
            let entries: Vec<ConsulCatalogService> = self
                .http
                .get(self.url(&format!("/v1/catalog/service/{encoded_name}")))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .unwrap_or_default();
            if let Some(entry) = entries.into_iter().next() {
                out.insert(
                    name.clone(),
                    AdvertisedService {
                        instance_id: entry.service_id,
                        service_name: entry.service_name,
                        address: entry.service_address,
                        tags: entry.service_tags,
                        metadata: entry.service_meta.unwrap_or_default(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn health_checks(&self, service_name: &str) -> anyhow::Result<Vec<ServiceCheck>> {
        let service_name = urlencoding::encode(service_name);
        let checks: Vec<ConsulHealthCheck> = self
            .http
            .get(self.url(&format!("/v1/health/checks/{service_name}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .unwrap_or_default();

        Ok(checks
            .into_iter()
            .map(|c| ServiceCheck {
                status: parse_health_status(&c.status),
                output: c.output,
            })
            .collect())
    }
}

fn parse_health_status(raw: &str) -> HealthStatus {
    match raw {
        "passing" => HealthStatus::Passing,
        "warning" => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    }
}
