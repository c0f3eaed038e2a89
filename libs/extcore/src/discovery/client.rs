//! Component E: the service discovery client proper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;

use crate::contracts::ServiceInfo;
use crate::discovery::backend::{
    AdvertisedService, HealthCheckSpec, HealthStatus, RegistryBackend, ServiceRegistration,
};
use crate::discovery::cache::ServiceCache;
use crate::errors::CoreError;
use crate::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DiscoveryMetrics {
    pub hits: u64,
    pub misses: u64,
    pub updates: u64,
    pub evictions: u64,
    pub registrations: u64,
    pub deregistrations: u64,
    pub lookups: u64,
    pub health_checks: u64,
    pub errors: u64,
    pub age_seconds: Option<u64>,
    pub is_expired: bool,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
    evictions: AtomicU64,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    lookups: AtomicU64,
    health_checks: AtomicU64,
    errors: AtomicU64,
}

/// Default cache TTL, per the data-model design note.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

pub struct ServiceDiscoveryClient {
    backend: Arc<dyn RegistryBackend>,
    cache: RwLock<ServiceCache>,
    counters: Counters,
    default_health_check: bool,
}

impl ServiceDiscoveryClient {
    pub fn new(backend: Arc<dyn RegistryBackend>, ttl: Duration, default_health_check: bool) -> Self {
        Self {
            backend,
            cache: RwLock::new(ServiceCache::new(ttl)),
            counters: Counters::default(),
            default_health_check,
        }
    }

    pub async fn register_service(&self, info: ServiceInfo) -> Result<String> {
        let suffix: u32 = rand::rng().random();
        let instance_id = format!("{}-{:08x}", info.service_name, suffix);
        let health_check = if self.default_health_check {
            Some(HealthCheckSpec {
                url: format!("{}/healthz", info.address),
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(3),
                deregister_after: Duration::from_secs(60),
            })
        } else {
            None
        };
        let reg = ServiceRegistration {
            instance_id: instance_id.clone(),
            service_name: info.service_name,
            address: info.address,
            tags: info.tags,
            metadata: info.metadata,
            health_check,
        };
        self.backend
            .register(reg)
            .await
            .map_err(|e| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                CoreError::Discovery(e)
            })?;
        self.counters.registrations.fetch_add(1, Ordering::Relaxed);
        self.cache.write().invalidate();
        Ok(instance_id)
    }

    pub async fn deregister_service(&self, instance_id: &str) -> Result<()> {
        self.backend
            .deregister(instance_id)
            .await
            .map_err(|e| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                CoreError::Discovery(e)
            })?;
        self.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
        self.cache.write().invalidate();
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<AdvertisedService> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        {
            let cache = self.cache.read();
            if cache.is_fresh() {
                if let Some(svc) = cache.get(name) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(svc);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.refresh().await?;

        self.cache
            .read()
            .get(name)
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_string()))
    }

    async fn refresh(&self) -> Result<()> {
        let services = self
            .backend
            .list()
            .await
            .map_err(|e| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                CoreError::Discovery(e)
            })?;
        self.cache.write().replace(services);
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn check_health(&self, name: &str) -> ServiceHealth {
        self.counters.health_checks.fetch_add(1, Ordering::Relaxed);
        match self.backend.health_checks(name).await {
            Ok(checks) if checks.iter().all(|c| c.status == HealthStatus::Passing) => {
                ServiceHealth::Healthy
            }
            Ok(_) => ServiceHealth::Unhealthy,
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                ServiceHealth::Unknown
            }
        }
    }

    pub fn metrics(&self) -> DiscoveryMetrics {
        let cache = self.cache.read();
        DiscoveryMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            registrations: self.counters.registrations.load(Ordering::Relaxed),
            deregistrations: self.counters.deregistrations.load(Ordering::Relaxed),
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            health_checks: self.counters.health_checks.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            age_seconds: cache.age().map(|d| d.as_secs()),
            is_expired: !cache.is_fresh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::static_backend::StaticRegistryBackend;
    use std::collections::HashMap;

    fn info(name: &str) -> ServiceInfo {
        ServiceInfo {
            service_name: name.to_string(),
            address: "127.0.0.1:9000".to_string(),
            tags: vec![],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn register_then_lookup_hits_after_refresh() {
        let backend = Arc::new(StaticRegistryBackend::new());
        let client = ServiceDiscoveryClient::new(backend, DEFAULT_TTL, false);
        client.register_service(info("svc")).await.unwrap();
        let svc = client.get_service("svc").await.unwrap();
        assert_eq!(svc.service_name, "svc");
    }

    #[tokio::test]
    async fn cache_expires_and_triggers_second_refresh() {
        let backend = Arc::new(StaticRegistryBackend::new());
        let client = ServiceDiscoveryClient::new(backend, Duration::from_millis(50), false);
        client.register_service(info("svc")).await.unwrap();
        client.get_service("svc").await.unwrap();
        client.get_service("svc").await.unwrap();
        assert_eq!(client.metrics().updates, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        client.get_service("svc").await.unwrap();
        assert_eq!(client.metrics().updates, 2);
    }

    #[tokio::test]
    async fn missing_service_after_refresh_is_not_found() {
        let backend = Arc::new(StaticRegistryBackend::new());
        let client = ServiceDiscoveryClient::new(backend, DEFAULT_TTL, false);
        let err = client.get_service("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::ServiceNotFound(_)));
    }
}
