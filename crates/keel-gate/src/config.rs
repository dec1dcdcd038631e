use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keel_core::impls::InMemoryCoordination;
use keel_core::ports::CoordinationService;
use keel_core::{GateConfig, GateError, PatrolConfig};

const MEMORY_ENDPOINT: &str = "memory://";

#[derive(Parser, Debug, Clone)]
#[command(name = "keel-gate")]
#[command(about = "Scheduler gate: accepts task definitions and routes them to worker sessions")]
pub struct Cli {
    /// Address to serve HTTP and worker streams on
    #[arg(long, env = "KEEL_SERVER_ADDR", default_value = "127.0.0.1:8080")]
    pub server_addr: String,

    /// Bind an OS-assigned free port on the server address's host
    #[arg(long, env = "KEEL_AUTO_FIND_ADDR")]
    pub auto_find_addr: bool,

    /// Coordination service endpoints (repeatable or comma separated)
    #[arg(
        long = "coord-endpoint",
        env = "KEEL_COORD_ENDPOINTS",
        value_delimiter = ',',
        default_value = MEMORY_ENDPOINT
    )]
    pub coord_endpoints: Vec<String>,

    #[arg(long, env = "KEEL_NAME_PREFIX", default_value = "")]
    pub name_prefix: String,

    /// Gate name; a random ULID when omitted
    #[arg(long, env = "KEEL_NAME")]
    pub name: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "KEEL_LEVEL", default_value = "info")]
    pub level: String,

    /// Registry lease TTL; values not above the worker keepalive interval are raised
    #[arg(long, env = "KEEL_LEASE_SECS", default_value_t = 4)]
    pub lease_secs: u64,

    #[arg(long, env = "KEEL_PATROL_INTERVAL_SECS", default_value_t = 10)]
    pub patrol_interval_secs: u64,

    #[arg(long, env = "KEEL_PATROL_SAMPLE", default_value_t = 32)]
    pub patrol_sample: usize,

    #[arg(long, env = "KEEL_STALE_SECS", default_value_t = 10)]
    pub stale_secs: u64,

    #[arg(long, env = "KEEL_RECONCILE_JITTER_MS", default_value_t = 500)]
    pub reconcile_jitter_ms: u64,

    #[arg(long, env = "KEEL_ACK_TIMEOUT_SECS", default_value_t = 5)]
    pub ack_timeout_secs: u64,
}

impl Cli {
    /// `server_addr` is the address actually bound, which differs from the
    /// flag when `--auto-find-addr` is set.
    pub fn gate_config(&self, server_addr: String) -> GateConfig {
        let name = self
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        GateConfig {
            name_prefix: self.name_prefix.clone(),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            reconcile_jitter: Duration::from_millis(self.reconcile_jitter_ms),
            patrol: PatrolConfig {
                interval: Duration::from_secs(self.patrol_interval_secs),
                sample_size: self.patrol_sample,
                stale_after: Duration::from_secs(self.stale_secs),
            },
            ..GateConfig::new(server_addr, name)
        }
        .with_lease_ttl(Duration::from_secs(self.lease_secs))
    }

    /// Address handed to the listener.
    pub fn bind_addr(&self) -> String {
        if !self.auto_find_addr {
            return self.server_addr.clone();
        }
        let host = self
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .filter(|host| !host.is_empty())
            .unwrap_or("127.0.0.1");
        format!("{host}:0")
    }

    pub fn coordination(&self) -> Result<Arc<dyn CoordinationService>, GateError> {
        if let Some(endpoint) = self
            .coord_endpoints
            .iter()
            .find(|e| e.as_str() != MEMORY_ENDPOINT)
        {
            return Err(GateError::StartupFatal(format!(
                "unsupported coordination endpoint {endpoint:?}; this build only provides {MEMORY_ENDPOINT}"
            )));
        }
        Ok(Arc::new(InMemoryCoordination::new()))
    }
}
