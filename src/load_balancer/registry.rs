//! Endpoint registry.
//!
//! # Responsibilities
//! - Build endpoints from configuration, preserving declared order
//! - Provide lookup and aggregate views for stats and health

use std::sync::Arc;
use url::Url;

use crate::config::{AccessConfig, ConfigError, ValidationError};
use crate::events::EventBus;
use crate::load_balancer::endpoint::{Endpoint, EndpointSnapshot};

#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    pub fn new(config: &AccessConfig, events: Arc<EventBus>) -> Result<Self, ConfigError> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        let mut errors = Vec::new();
        for (i, ep) in config.endpoints.iter().enumerate() {
            match Url::parse(&ep.url) {
                Ok(url) => endpoints.push(Arc::new(Endpoint::new(
                    ep,
                    url,
                    config.circuit_breaker.clone(),
                    config.rate_limit,
                    events.clone(),
                ))),
                Err(e) => errors.push(ValidationError {
                    field: format!("endpoints[{i}].url"),
                    message: e.to_string(),
                }),
            }
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }
        tracing::debug!(count = endpoints.len(), "Endpoint registry built");
        Ok(Self { endpoints })
    }

    pub fn all(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| &*e.id == id)
    }

    /// Largest request, in tokens, that every endpoint's bucket can admit.
    pub fn max_request_units(&self) -> usize {
        self.endpoints
            .iter()
            .map(|ep| ep.token_capacity().floor().max(1.0) as usize)
            .min()
            .unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.endpoints.iter().map(|e| u64::from(e.weight)).sum()
    }

    /// Endpoints whose circuit is not open.
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }
}
