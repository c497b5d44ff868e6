//! The transport abstraction shared by the in-process and socket backends.

use async_trait::async_trait;
use neural_types::{Identity, Signal, TransportError};
use serde::Serialize;

/// Moves signals between agents.
///
/// `receive` must be cancel-safe: the agent runtime races it against its
/// shutdown signal and drops the future when stopping.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver a signal to its target, or to every agent for a broadcast.
    async fn send(&self, signal: &Signal) -> Result<(), TransportError>;

    /// Wait for the next signal addressed to this consumer.
    ///
    /// Fails with [`TransportError::Closed`] once the transport is closed.
    async fn receive(&self) -> Result<Signal, TransportError>;

    /// Close the transport and wake any pending receivers.
    async fn close(&self);

    /// Resolve a logical agent name to its identity, when the backend knows.
    async fn resolve(&self, _name: &str) -> Option<Identity> {
        None
    }
}

/// Connection state of a socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
        }
    }
}
