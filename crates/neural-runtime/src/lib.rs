//! Neural Protocol agent runtime.
//!
//! Ties the wire layer to application code: a shared [`SynapseTable`] of
//! adaptive connection weights, per-agent [`HandlerRegistry`]s, and the
//! [`Agent`] receive/dispatch loop. Also hosts config loading and logging
//! setup for binaries built on the runtime.

pub mod agent;
pub mod config;
pub mod handler;
pub mod logging;
pub mod synapse;

pub use agent::{Agent, AgentHealth, AgentState};
pub use config::load_config;
pub use handler::{HandlerRegistry, SignalHandler};
pub use logging::init_logging;
pub use synapse::{Synapse, SynapseTable};

use neural_types::config::{NeuralConfig, TransportKind};
use neural_types::{Identity, NeuralResult};
use neural_wire::{LocalTransport, SocketConfig, SocketTransport, Transport};
use std::sync::Arc;

/// Build the transport a config asks for.
///
/// `Local` registers `name` under a fresh identity on `bus`; `Socket` opens
/// a reconnecting connection to the configured hub and registers `name`
/// there on every connect. Returns the transport with the identity the agent
/// should use.
pub fn connect_transport(
    config: &NeuralConfig,
    name: &str,
    bus: &LocalTransport,
) -> NeuralResult<(Arc<dyn Transport>, Identity)> {
    let identity = Identity::derive(name, None)?;
    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Local => Arc::new(bus.register(name, identity)?),
        TransportKind::Socket => Arc::new(SocketTransport::connect(
            SocketConfig::from_transport(&config.transport).register_as(name, identity),
        )?),
    };
    Ok((transport, identity))
}
