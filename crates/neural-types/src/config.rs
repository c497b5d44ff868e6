//! Configuration types.
//!
//! Every section carries `#[serde(default)]`, so a partial TOML file (or an
//! empty one) deserializes into a complete configuration.

use crate::error::{NeuralError, NeuralResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which transport backend an agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process queues.
    #[default]
    Local,
    /// Outbound connection to a hub.
    Socket,
}

impl std::str::FromStr for TransportKind {
    type Err = NeuralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "socket" | "tcp" => Ok(Self::Socket),
            other => Err(NeuralError::Config(format!("unknown transport kind: {other}"))),
        }
    }
}

/// Transport-layer encryption for the socket backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Server name checked against the certificate. Defaults to the hub host.
    pub domain: Option<String>,
    /// Extra PEM root certificates trusted alongside the bundled roots.
    pub ca_file: Option<PathBuf>,
}

/// Reconnect policy for the socket backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`; the delay grows by up to this fraction.
    pub jitter: f64,
    /// Consecutive failures after which send/receive report `Unavailable`.
    pub max_failures: u32,
    /// Longest a single connect attempt, or a `send` waiting for a
    /// connection, may take.
    pub attempt_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.2,
            max_failures: 5,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn validate(&self) -> NeuralResult<()> {
        if self.base_delay_ms == 0 {
            return Err(NeuralError::Config("reconnect.base_delay_ms must be > 0".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(NeuralError::Config(
                "reconnect.max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(NeuralError::Config("reconnect.jitter must be in [0, 1]".into()));
        }
        if self.max_failures == 0 {
            return Err(NeuralError::Config("reconnect.max_failures must be > 0".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(NeuralError::Config(
                "reconnect.attempt_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Transport section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// `host:port` of the hub for the socket backend.
    pub hub_addr: String,
    pub tls: TlsConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Local,
            hub_addr: "127.0.0.1:8765".to_string(),
            tls: TlsConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Host part of `hub_addr`, used as the default TLS domain.
    pub fn hub_host(&self) -> &str {
        self.hub_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.hub_addr)
    }
}

/// Bounds and defaults for the Hebbian weight update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    /// Lower weight bound.
    pub min: f64,
    /// Upper weight bound.
    pub max: f64,
    /// Weight reported for edges that have never been observed.
    pub baseline: f64,
    /// Rate used by the agent runtime when reinforcing edges.
    pub learning_rate: f64,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            baseline: 0.5,
            learning_rate: 0.05,
        }
    }
}

impl SynapseConfig {
    pub fn validate(&self) -> NeuralResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min >= self.max {
            return Err(NeuralError::InvalidArgument(format!(
                "synapse bounds must be finite with min < max (min={}, max={})",
                self.min, self.max
            )));
        }
        if !(self.min..=self.max).contains(&self.baseline) {
            return Err(NeuralError::InvalidArgument(format!(
                "synapse baseline {} outside [{}, {}]",
                self.baseline, self.min, self.max
            )));
        }
        validate_rate(self.learning_rate)
    }
}

/// Check that a learning rate lies in `(0, 1]`.
pub fn validate_rate(rate: f64) -> NeuralResult<()> {
    if rate > 0.0 && rate <= 1.0 {
        Ok(())
    } else {
        Err(NeuralError::InvalidArgument(format!(
            "learning rate must be in (0, 1], got {rate}"
        )))
    }
}

/// Agent runtime section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Pause after a transient receive error before receiving again.
    pub error_pause_ms: u64,
    /// Received signals kept in memory for inspection. Zero disables it.
    pub history_len: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            error_pause_ms: 250,
            history_len: 100,
        }
    }
}

impl AgentConfig {
    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.error_pause_ms)
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralConfig {
    pub transport: TransportConfig,
    pub synapse: SynapseConfig,
    pub agent: AgentConfig,
    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            synapse: SynapseConfig::default(),
            agent: AgentConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NeuralConfig {
    /// Validate every section.
    pub fn validate(&self) -> NeuralResult<()> {
        self.transport.reconnect.validate()?;
        self.synapse
            .validate()
            .map_err(|e| NeuralError::Config(e.to_string()))?;
        if self.transport.hub_addr.is_empty() {
            return Err(NeuralError::Config("transport.hub_addr must not be empty".into()));
        }
        Ok(())
    }
}
