//! Controller configuration.

use std::sync::Arc;
use std::time::Duration;

use blb_cloud::{CloudConfig, CredentialProvider, FileCredentialProvider, StaticCredentialProvider};
use blb_reconcile::Backoff;

use crate::error::{ControllerError, Result};

/// Configuration for the controller process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Workers draining the Service queue.
    pub service_workers: usize,
    /// Workers draining the route queue.
    pub route_workers: usize,
    /// Address the health server listens on.
    pub listen_addr: String,
    /// Backoff applied to keys whose reconciliation failed.
    pub backoff: Backoff,
    /// Interval between full route table audits.
    pub route_audit_interval: Duration,
    /// Namespace cluster-scoped warning events are written to.
    pub event_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            service_workers: 4,
            route_workers: 2,
            listen_addr: "0.0.0.0:8080".to_string(),
            backoff: Backoff::default(),
            route_audit_interval: Duration::from_secs(300),
            event_namespace: "kube-system".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `SERVICE_WORKERS`: Service queue workers (default: 4)
    /// - `ROUTE_WORKERS`: route queue workers (default: 2)
    /// - `LISTEN_ADDR`: health server address (default: 0.0.0.0:8080)
    /// - `BACKOFF_INITIAL_SECS`: first retry delay (default: 5)
    /// - `BACKOFF_MAX_SECS`: retry delay cap (default: 300)
    /// - `ROUTE_AUDIT_INTERVAL_SECS`: route audit period (default: 300)
    /// - `EVENT_NAMESPACE`: namespace for route conflict events (default: kube-system)
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SERVICE_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.service_workers = n.max(1);
            }
        }
        if let Ok(val) = std::env::var("ROUTE_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.route_workers = n.max(1);
            }
        }
        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("BACKOFF_INITIAL_SECS") {
            if let Ok(n) = val.parse() {
                config.backoff.initial = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("BACKOFF_MAX_SECS") {
            if let Ok(n) = val.parse() {
                config.backoff.max = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("ROUTE_AUDIT_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.route_audit_interval = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("EVENT_NAMESPACE") {
            config.event_namespace = val;
        }

        config.backoff.max = config.backoff.max.max(config.backoff.initial);
        config
    }
}

/// Pick the credential provider for the cloud client.
///
/// A token file wins over a static `CLOUD_ACCESS_TOKEN`.
///
/// # Errors
///
/// Returns `ControllerError::Config` if neither is configured.
pub fn credentials_from_env(cloud: &CloudConfig) -> Result<Arc<dyn CredentialProvider>> {
    if let Some(path) = &cloud.credentials_file {
        return Ok(Arc::new(FileCredentialProvider::new(path.clone())));
    }
    match std::env::var("CLOUD_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => Ok(Arc::new(StaticCredentialProvider::new(token))),
        _ => Err(ControllerError::Config(
            "set CLOUD_CREDENTIALS_FILE or CLOUD_ACCESS_TOKEN".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.service_workers, 4);
        assert_eq!(config.route_workers, 2);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.backoff.initial, Duration::from_secs(5));
        assert_eq!(config.backoff.max, Duration::from_secs(300));
        assert_eq!(config.event_namespace, "kube-system");
    }

    #[test]
    fn token_file_is_preferred() {
        let mut cloud = CloudConfig::for_region("bj");
        cloud.credentials_file = Some("/var/run/secrets/cloud/token.json".into());
        assert!(credentials_from_env(&cloud).is_ok());
    }
}
