//! Gate configuration.
//!
//! The binary parses flags and environment into a [`GateConfig`]; `validate`
//! runs before anything touches the coordination service.

use std::time::Duration;

use crate::domain::{GateError, NodeIdentity, NodeKind, Result};

/// Interval at which workers are expected to send heartbeats.
pub const RUNTIME_KEEPALIVE: Duration = Duration::from_secs(3);

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatrolConfig {
    pub interval: Duration,
    pub sample_size: usize,
    /// A worker silent for longer than this is treated as not running its tasks.
    pub stale_after: Duration,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            sample_size: 32,
            stale_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Address this gate serves on; also the value of its registry record.
    pub server_addr: String,
    pub name_prefix: String,
    pub name: String,
    pub lease_ttl: Duration,
    pub lock_ttl: Duration,
    pub ack_timeout: Duration,
    pub reconcile_jitter: Duration,
    pub patrol: PatrolConfig,
}

impl GateConfig {
    pub fn new(server_addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            name_prefix: String::new(),
            name: name.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
            lock_ttl: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            reconcile_jitter: Duration::from_millis(500),
            patrol: PatrolConfig::default(),
        }
    }

    /// The lease must outlive one keepalive interval plus jitter, so a TTL
    /// not above the interval is raised to keepalive + 1s.
    pub fn clamp_lease_ttl(ttl: Duration) -> Duration {
        if ttl <= RUNTIME_KEEPALIVE {
            RUNTIME_KEEPALIVE + Duration::from_secs(1)
        } else {
            ttl
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Self::clamp_lease_ttl(ttl);
        self
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(
            NodeKind::Gate,
            self.name_prefix.clone(),
            self.name.clone(),
            self.server_addr.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.trim().is_empty() {
            return Err(GateError::StartupFatal("server address is empty".to_string()));
        }
        if self.name.is_empty() || self.identity().key().contains('/') {
            return Err(GateError::StartupFatal(format!(
                "invalid gate name {:?}",
                self.identity().key()
            )));
        }
        if self.lease_ttl <= RUNTIME_KEEPALIVE {
            return Err(GateError::StartupFatal(format!(
                "lease ttl {:?} must exceed the keepalive interval {:?}",
                self.lease_ttl, RUNTIME_KEEPALIVE
            )));
        }
        if self.patrol.interval.is_zero() || self.patrol.sample_size == 0 {
            return Err(GateError::StartupFatal(
                "patrol interval and sample size must be positive".to_string(),
            ));
        }
        if self.patrol.stale_after.is_zero() || self.ack_timeout.is_zero() || self.lock_ttl.is_zero() {
            return Err(GateError::StartupFatal(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 4)]
    #[case(2, 4)]
    #[case(3, 4)]
    #[case(4, 4)]
    #[case(30, 30)]
    fn short_leases_are_clamped(#[case] requested: u64, #[case] effective: u64) {
        assert_eq!(
            GateConfig::clamp_lease_ttl(Duration::from_secs(requested)),
            Duration::from_secs(effective)
        );
    }

    #[test]
    fn defaults_are_valid() {
        let config = GateConfig::new("127.0.0.1:8080", "g1");
        config.validate().unwrap();
        assert_eq!(config.identity().path(), "/scheduler/gate/node/g1");
    }

    #[test]
    fn prefix_is_part_of_the_registry_key() {
        let mut config = GateConfig::new("127.0.0.1:8080", "g1");
        config.name_prefix = "east".to_string();
        assert_eq!(config.identity().key(), "east-g1");
    }

    #[rstest]
    #[case::no_address(GateConfig::new("", "g1"))]
    #[case::no_name(GateConfig::new("127.0.0.1:8080", ""))]
    #[case::slash(GateConfig::new("127.0.0.1:8080", "a/b"))]
    #[case::short_lease(GateConfig { lease_ttl: Duration::from_secs(1), ..GateConfig::new("x:1", "g") })]
    #[case::lease_equals_keepalive(GateConfig { lease_ttl: RUNTIME_KEEPALIVE, ..GateConfig::new("x:1", "g") })]
    fn bad_config_is_fatal(#[case] config: GateConfig) {
        assert!(matches!(
            config.validate().unwrap_err(),
            GateError::StartupFatal(_)
        ));
    }
}
