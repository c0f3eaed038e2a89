//! In-memory `RegistryBackend`, for tests and deployments with no external
//! registry. Mirrors the teacher's `BackendKind::Mock`/`Static` precedent.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::discovery::backend::{
    AdvertisedService, HealthStatus, RegistryBackend, ServiceCheck, ServiceRegistration,
};

#[derive(Default)]
pub struct StaticRegistryBackend {
    services: RwLock<HashMap<String, AdvertisedService>>,
}

impl StaticRegistryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for StaticRegistryBackend {
    async fn register(&self, reg: ServiceRegistration) -> anyhow::Result<()> {
        self.services.write().insert(
            reg.service_name.clone(),
            AdvertisedService {
                instance_id: reg.instance_id,
                service_name: reg.service_name,
                address: reg.address,
                tags: reg.tags,
                metadata: reg.metadata,
            },
        );
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> anyhow::Result<()> {
        self.services
            .write()
            .retain(|_, svc| svc.instance_id != instance_id);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<HashMap<String, AdvertisedService>> {
        Ok(self.services.read().clone())
    }

    async fn health_checks(&self, _service_name: &str) -> anyhow::Result<Vec<ServiceCheck>> {
        Ok(vec![ServiceCheck {
            status: HealthStatus::Passing,
            output: "static backend always passing".to_string(),
        }])
    }
}
