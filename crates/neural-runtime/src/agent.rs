//! Agent runtime.
//!
//! An [`Agent`] owns one transport endpoint and a [`HandlerRegistry`]. Once
//! started, a tokio task receives signals one at a time, runs every handler
//! registered for the signal type concurrently, and reinforces the
//! `(sender, self)` synapse with the outcome. Outbound signals sent through
//! [`Agent::transmit`] reinforce `(self, target)` with the delivery outcome.

use crate::handler::HandlerRegistry;
use crate::synapse::SynapseTable;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use neural_types::config::AgentConfig;
use neural_types::{Identity, NeuralError, NeuralResult, Payload, Signal, SignalType, TransportError};
use neural_wire::{LocalTransport, Transport};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Constructed, never started.
    Created,
    /// `start()` spawned the loop; it has not begun receiving yet.
    Started,
    /// The loop is receiving and dispatching.
    Running,
    /// The loop has exited.
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time counters for an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub name: String,
    pub identity: Identity,
    pub state: AgentState,
    pub handlers: usize,
    /// Signals received and fully dispatched.
    pub dispatched: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Receive errors other than a clean close.
    pub transport_errors: u64,
    /// Signals sent successfully through `transmit` or `broadcast`.
    pub sent: u64,
    pub send_failures: u64,
    pub last_error: Option<String>,
    pub last_signal_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Metrics {
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    transport_errors: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_signal_at: Mutex<Option<DateTime<Utc>>>,
}

impl Metrics {
    fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

struct AgentCore {
    name: String,
    identity: Identity,
    transport: Arc<dyn Transport>,
    synapses: Arc<SynapseTable>,
    handlers: HandlerRegistry,
    config: AgentConfig,
    state: Mutex<AgentState>,
    metrics: Metrics,
    history: Mutex<VecDeque<Signal>>,
}

impl AgentCore {
    fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn remember(&self, signal: &Signal) {
        if self.config.history_len == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.config.history_len {
            history.pop_front();
        }
        history.push_back(signal.clone());
    }

    /// Run every handler for the signal, then reinforce the sender's edge.
    async fn dispatch(&self, signal: Signal) {
        *self
            .metrics
            .last_signal_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.remember(&signal);

        let handlers = self.handlers.handlers_for(signal.signal_type);
        if handlers.is_empty() {
            debug!(agent = %self.name, signal = %signal, "No handler registered");
        }

        let results = futures::future::join_all(
            handlers
                .iter()
                .map(|h| AssertUnwindSafe(h.handle(&signal)).catch_unwind()),
        )
        .await;

        let mut success = true;
        for result in results {
            let message = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(agent = %self.name, signal = %signal, error = %e, "Handler failed");
                    format!("handler failed: {e}")
                }
                Err(panic) => {
                    let reason = panic_message(&*panic);
                    error!(agent = %self.name, signal = %signal, panic = %reason, "Handler panicked");
                    format!("handler panicked: {reason}")
                }
            };
            success = false;
            self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_error(message);
        }

        let weight = self.synapses.observe(signal.source, self.identity, success);
        debug!(
            agent = %self.name,
            source = %signal.source.short(),
            success,
            weight,
            "Dispatched signal"
        );
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_loop(core: Arc<AgentCore>, mut shutdown_rx: watch::Receiver<bool>) {
    core.set_state(AgentState::Running);
    info!(
        agent = %core.name,
        id = %core.identity.short(),
        handlers = core.handlers.len(),
        "Agent online"
    );

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = core.transport.receive() => received,
        };

        match received {
            Ok(signal) => core.dispatch(signal).await,
            Err(TransportError::Closed) => {
                info!(agent = %core.name, "Transport closed, stopping");
                break;
            }
            Err(TransportError::Codec(e)) => {
                core.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                core.metrics.record_error(e.to_string());
                warn!(agent = %core.name, error = %e, "Discarding undecodable signal");
            }
            Err(e) if e.is_transient() => {
                core.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                core.metrics.record_error(e.to_string());
                warn!(
                    agent = %core.name,
                    error = %e,
                    pause_ms = core.config.error_pause_ms,
                    "Receive failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(core.config.error_pause()) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            Err(e) => {
                core.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                core.metrics.record_error(e.to_string());
                error!(agent = %core.name, error = %e, "Receive failed, stopping");
                break;
            }
        }
    }

    core.set_state(AgentState::Stopped);
    info!(agent = %core.name, "Agent offline");
}

struct Runner {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// An addressable participant that receives, dispatches and transmits
/// signals.
pub struct Agent {
    core: Arc<AgentCore>,
    runner: Mutex<Option<Runner>>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        identity: Identity,
        transport: Arc<dyn Transport>,
        synapses: Arc<SynapseTable>,
        handlers: HandlerRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            core: Arc::new(AgentCore {
                name: name.into(),
                identity,
                transport,
                synapses,
                handlers,
                config,
                state: Mutex::new(AgentState::Created),
                metrics: Metrics::default(),
                history: Mutex::new(VecDeque::new()),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Derive a fresh identity for `name` and register it on an in-process
    /// bus.
    pub fn local(
        name: &str,
        bus: &LocalTransport,
        synapses: Arc<SynapseTable>,
        handlers: HandlerRegistry,
        config: AgentConfig,
    ) -> NeuralResult<Self> {
        let identity = Identity::derive(name, None)?;
        let endpoint = bus.register(name, identity)?;
        Ok(Self::new(
            name,
            identity,
            Arc::new(endpoint),
            synapses,
            handlers,
            config,
        ))
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn identity(&self) -> Identity {
        self.core.identity
    }

    pub fn state(&self) -> AgentState {
        self.core.state()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.core.transport
    }

    pub fn synapses(&self) -> &Arc<SynapseTable> {
        &self.core.synapses
    }

    /// Spawn the receive loop.
    ///
    /// Fails with `AlreadyRunning` while a previous loop is still active.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> NeuralResult<()> {
        let mut runner = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, AgentState::Started | AgentState::Running) {
                return Err(NeuralError::AlreadyRunning);
            }
            *state = AgentState::Started;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.core.clone(), shutdown_rx));
        *runner = Some(Runner { shutdown_tx, task });
        Ok(())
    }

    /// Stop the receive loop and wait for it to exit.
    ///
    /// A dispatch in progress finishes first; a pending receive is
    /// abandoned.
    pub async fn stop(&self) {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runner) = runner {
            runner.shutdown_tx.send_replace(true);
            if let Err(e) = runner.task.await {
                error!(agent = %self.core.name, error = %e, "Agent task failed");
            }
        }
        self.core.set_state(AgentState::Stopped);
    }

    /// Send a signal to `target` and reinforce `(self, target)` with the
    /// delivery outcome. A broadcast target is sent as a broadcast.
    pub async fn transmit(
        &self,
        target: Identity,
        signal_type: SignalType,
        payload: Payload,
    ) -> Result<(), TransportError> {
        if target.is_broadcast() {
            return self.broadcast(signal_type, payload).await;
        }

        let signal = Signal::new(signal_type, self.core.identity, target, payload);
        let result = self.core.transport.send(&signal).await;
        let weight = self
            .core
            .synapses
            .observe(self.core.identity, target, result.is_ok());

        match &result {
            Ok(()) => {
                self.core.metrics.sent.fetch_add(1, Ordering::Relaxed);
                debug!(agent = %self.core.name, signal = %signal, weight, "Transmitted");
            }
            Err(e) => {
                self.core.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                self.core.metrics.record_error(e.to_string());
                warn!(
                    agent = %self.core.name,
                    target = %target.short(),
                    error = %e,
                    weight,
                    "Transmit failed"
                );
            }
        }
        result
    }

    /// Resolve `name` through the transport, then [`Agent::transmit`].
    pub async fn transmit_to(
        &self,
        name: &str,
        signal_type: SignalType,
        payload: Payload,
    ) -> Result<(), TransportError> {
        let target = self
            .resolve(name)
            .await
            .ok_or_else(|| TransportError::Unavailable(format!("unknown agent: {name}")))?;
        self.transmit(target, signal_type, payload).await
    }

    /// Send a signal to every agent. No synapse is reinforced.
    pub async fn broadcast(
        &self,
        signal_type: SignalType,
        payload: Payload,
    ) -> Result<(), TransportError> {
        let signal = Signal::broadcast(signal_type, self.core.identity, payload);
        info!(agent = %self.core.name, signal = %signal, "Broadcasting");
        let result = self.core.transport.send(&signal).await;
        match &result {
            Ok(()) => self.core.metrics.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.core.metrics.send_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub async fn resolve(&self, name: &str) -> Option<Identity> {
        self.core.transport.resolve(name).await
    }

    pub fn health(&self) -> AgentHealth {
        let metrics = &self.core.metrics;
        AgentHealth {
            name: self.core.name.clone(),
            identity: self.core.identity,
            state: self.core.state(),
            handlers: self.core.handlers.len(),
            dispatched: metrics.dispatched.load(Ordering::Relaxed),
            handler_failures: metrics.handler_failures.load(Ordering::Relaxed),
            transport_errors: metrics.transport_errors.load(Ordering::Relaxed),
            sent: metrics.sent.load(Ordering::Relaxed),
            send_failures: metrics.send_failures.load(Ordering::Relaxed),
            last_error: metrics
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            last_signal_at: *metrics
                .last_signal_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Outgoing synapses of this agent, strongest first.
    pub fn synapse_report(&self) -> String {
        let edges = self.core.synapses.outgoing(&self.core.identity);
        let mut out = format!("{} ({}) synapses:\n", self.core.name, self.core.identity.short());
        if edges.is_empty() {
            out.push_str("  (none)\n");
        }
        for edge in edges {
            out.push_str(&format!(
                "  -> {}  weight={:.3}  success={}/{}\n",
                edge.target.short(),
                edge.weight,
                edge.successes,
                edge.transmissions
            ));
        }
        out
    }

    /// Most recently received signals, oldest first.
    pub fn recent_signals(&self) -> Vec<Signal> {
        self.core
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.core.name)
            .field("identity", &self.core.identity)
            .field("state", &self.core.state())
            .finish()
    }
}
