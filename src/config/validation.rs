//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Endpoint names are unique and URLs parse
//! - Value ranges (thresholds ordered, capacities non-zero)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AccessConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::config::schema::{AccessConfig, RateLimitConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AccessConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.endpoints.is_empty() {
        errors.push(ValidationError::new("endpoints", "at least one endpoint is required"));
    }

    let mut names = HashSet::new();
    for (i, endpoint) in config.endpoints.iter().enumerate() {
        let field = format!("endpoints[{i}]");
        if endpoint.name.trim().is_empty() {
            errors.push(ValidationError::new(&field, "name must not be empty"));
        } else if !names.insert(endpoint.name.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate endpoint name {:?}", endpoint.name),
            ));
        }
        if Url::parse(&endpoint.url).is_err() {
            errors.push(ValidationError::new(
                &field,
                format!("invalid url {:?}", endpoint.url),
            ));
        }
        if endpoint.weight == 0 {
            errors.push(ValidationError::new(&field, "weight must be positive"));
        }
        if endpoint.max_concurrency == 0 {
            errors.push(ValidationError::new(&field, "max_concurrency must be positive"));
        }
        if let Some(rate) = &endpoint.rate_limit {
            check_rate(&mut errors, &format!("{field}.rate_limit"), rate);
        }
    }

    check_rate(&mut errors, "rate_limit", &config.rate_limit);

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be positive"));
    }
    if breaker.half_open_trial_limit == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_trial_limit", "must be positive"));
    }
    if breaker.consecutive_successes_required == 0 {
        errors.push(ValidationError::new(
            "circuit_breaker.consecutive_successes_required",
            "must be positive",
        ));
    }

    if config.dispatch.max_attempts == 0 {
        errors.push(ValidationError::new("dispatch.max_attempts", "must be positive"));
    }
    if config.dispatch.request_timeout_ms == 0 {
        errors.push(ValidationError::new("dispatch.request_timeout_ms", "must be positive"));
    }
    if config.dispatch.race_fanout < 2 {
        errors.push(ValidationError::new("dispatch.race_fanout", "must be at least 2"));
    }

    if config.batch.provider_batch_limit == 0 {
        errors.push(ValidationError::new("batch.provider_batch_limit", "must be positive"));
    }
    for (method, rules) in &config.batch.methods {
        if rules.max_batch_size == 0 {
            errors.push(ValidationError::new(
                format!("batch.methods.{method}.max_batch_size"),
                "must be positive",
            ));
        }
    }

    if config.cache.main_capacity == 0 {
        errors.push(ValidationError::new("cache.main_capacity", "must be positive"));
    }
    if config.cache.sweep_interval_ms == 0 {
        errors.push(ValidationError::new("cache.sweep_interval_ms", "must be positive"));
    }

    let admission = &config.admission;
    if admission.max_queue_size == 0 {
        errors.push(ValidationError::new("admission.max_queue_size", "must be positive"));
    }
    if !(0.0 < admission.warning_threshold
        && admission.warning_threshold < admission.critical_threshold
        && admission.critical_threshold <= 1.0)
    {
        errors.push(ValidationError::new(
            "admission",
            "thresholds must satisfy 0 < warning < critical <= 1",
        ));
    }

    let shutdown = &config.shutdown;
    if shutdown.hard_timeout_ms < shutdown.soft_timeout_ms {
        errors.push(ValidationError::new(
            "shutdown.hard_timeout_ms",
            "must not be shorter than soft_timeout_ms",
        ));
    }
    if shutdown.progress_interval_ms == 0 {
        errors.push(ValidationError::new(
            "shutdown.progress_interval_ms",
            "must be greater than 0",
        ));
    }

    if config.admin.enabled && config.admin.api_key == "CHANGE_ME_IN_PRODUCTION" {
        tracing::warn!("Admin API enabled with the placeholder api_key");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_rate(errors: &mut Vec<ValidationError>, field: &str, rate: &RateLimitConfig) {
    if !(rate.capacity >= 1.0) {
        errors.push(ValidationError::new(format!("{field}.capacity"), "must be at least 1"));
    }
    if !(rate.refill_per_sec > 0.0) {
        errors.push(ValidationError::new(format!("{field}.refill_per_sec"), "must be positive"));
    }
}
