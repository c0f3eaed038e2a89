//! TTL-based whole-map cache of the last `list()` refresh.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::discovery::backend::AdvertisedService;

pub struct ServiceCache {
    services: HashMap<String, AdvertisedService>,
    last_refresh: Option<Instant>,
    ttl: Duration,
}

impl ServiceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            services: HashMap::new(),
            last_refresh: None,
            ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        match self.last_refresh {
            Some(t) => t.elapsed() <= self.ttl,
            None => false,
        }
    }

    pub fn age(&self) -> Option<Duration> {
        self.last_refresh.map(|t| t.elapsed())
    }

    pub fn get(&self, name: &str) -> Option<AdvertisedService> {
        self.services.get(name).cloned()
    }

    /// Whole-map replacement, per the TTL-cache design note.
    pub fn replace(&mut self, services: HashMap<String, AdvertisedService>) {
        self.services = services;
        self.last_refresh = Some(Instant::now());
    }

    pub fn invalidate(&mut self) {
        self.last_refresh = None;
    }
}
