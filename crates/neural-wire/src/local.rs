//! In-process transport.
//!
//! [`LocalTransport`] keeps one unbounded FIFO queue per registered identity.
//! Each consumer gets a [`LocalEndpoint`] that implements [`Transport`] and
//! reads only its own queue, so consumers never contend with each other.
//! Signals travel through the queues as encoded frames, exactly as they
//! would over a socket.
//!
//! A broadcast goes to every registered queue, the sender's own included.

use crate::codec;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use neural_types::{Identity, Signal, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// A registered consumer queue. The generation guards against a stale
/// endpoint unregistering a newer registration of the same identity.
struct Queue {
    generation: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Inner {
    /// Held by `register` and `close` so no queue is added after close.
    lifecycle: std::sync::Mutex<()>,
    queues: DashMap<Identity, Queue>,
    names: DashMap<String, Identity>,
    closed: AtomicBool,
    next_generation: AtomicU64,
    transmitted: AtomicU64,
    bytes: AtomicU64,
    delivered: AtomicU64,
}

/// Counters for a local transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    /// Signals accepted by `send`.
    pub transmitted: u64,
    /// Encoded bytes accepted by `send`.
    pub bytes: u64,
    /// Copies enqueued (a broadcast counts once per recipient).
    pub delivered: u64,
    /// Registered consumers.
    pub agents: usize,
}

/// Shared in-process signal bus. Cheap to clone.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<Inner>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: std::sync::Mutex::new(()),
                queues: DashMap::new(),
                names: DashMap::new(),
                closed: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
                transmitted: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer and return its endpoint.
    ///
    /// Registering an identity again replaces the previous queue; the old
    /// endpoint's pending receives fail with `Closed`.
    pub fn register(&self, name: &str, identity: Identity) -> Result<LocalEndpoint, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let _lifecycle = self.lifecycle();
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            self.inner.queues.insert(identity, Queue { generation, tx });
            self.inner.names.insert(name.to_string(), identity);
            generation
        };
        info!(agent = name, id = %identity.short(), "Local transport: registered");

        Ok(LocalEndpoint {
            identity,
            generation,
            transport: self.clone(),
            rx: Mutex::new(rx),
        })
    }

    /// Remove a consumer. Its pending receives fail with `Closed`.
    pub fn unregister(&self, identity: &Identity) {
        if self.inner.queues.remove(identity).is_some() {
            self.inner.names.retain(|_, id| *id != *identity);
            debug!(id = %identity.short(), "Local transport: unregistered");
        }
    }

    fn unregister_generation(&self, identity: &Identity, generation: u64) {
        let removed = self
            .inner
            .queues
            .remove_if(identity, |_, q| q.generation == generation)
            .is_some();
        if removed {
            self.inner.names.retain(|_, id| *id != *identity);
            debug!(id = %identity.short(), "Local transport: endpoint closed");
        }
    }

    /// Look up the identity registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Identity> {
        self.inner.names.get(name).map(|e| *e.value())
    }

    pub fn is_registered(&self, identity: &Identity) -> bool {
        self.inner.queues.contains_key(identity)
    }

    /// Number of registered consumers.
    pub fn registered(&self) -> usize {
        self.inner.queues.len()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            transmitted: self.inner.transmitted.load(Ordering::Relaxed),
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            agents: self.registered(),
        }
    }

    /// Enqueue a signal on its target's queue, or on every queue for a
    /// broadcast.
    pub fn send(&self, signal: &Signal) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = Bytes::from(codec::encode(signal)?);
        self.inner.transmitted.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let delivered = if signal.is_broadcast() {
            let mut count = 0u64;
            for queue in self.inner.queues.iter() {
                if queue.tx.send(frame.clone()).is_ok() {
                    count += 1;
                }
            }
            count
        } else {
            match self.inner.queues.get(&signal.target) {
                Some(queue) => u64::from(queue.tx.send(frame).is_ok()),
                None => 0,
            }
        };

        self.inner.delivered.fetch_add(delivered, Ordering::Relaxed);
        debug!(signal = %signal, delivered, "Local transport: sent");

        if delivered == 0 {
            let reason = if signal.is_broadcast() {
                "no registered agents".to_string()
            } else {
                format!("no agent registered for {}", signal.target.short())
            };
            return Err(TransportError::Unavailable(reason));
        }
        Ok(())
    }

    /// Close every queue. All pending and future receives fail with `Closed`.
    pub fn close(&self) {
        let _lifecycle = self.lifecycle();
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queues.clear();
        self.inner.names.clear();
        info!("Local transport: closed");
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer's view of a [`LocalTransport`].
pub struct LocalEndpoint {
    identity: Identity,
    generation: u64,
    transport: LocalTransport,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl LocalEndpoint {
    /// The identity whose queue this endpoint reads.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The shared transport this endpoint belongs to.
    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }
}

#[async_trait]
impl Transport for LocalEndpoint {
    async fn send(&self, signal: &Signal) -> Result<(), TransportError> {
        self.transport.send(signal)
    }

    async fn receive(&self) -> Result<Signal, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(frame) => Ok(codec::decode(&frame)?),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.transport
            .unregister_generation(&self.identity, self.generation);
    }

    async fn resolve(&self, name: &str) -> Option<Identity> {
        self.transport.resolve(name)
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.transport
            .unregister_generation(&self.identity, self.generation);
    }
}
