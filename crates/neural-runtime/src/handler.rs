//! Signal handlers and the per-agent registry that routes to them.

use async_trait::async_trait;
use neural_types::{Signal, SignalType};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Reacts to one received signal.
///
/// Errors are logged and counted by the agent; they count as a failed
/// delivery for the sender's synapse.
#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    async fn handle(&self, signal: &Signal) -> anyhow::Result<()>;
}

/// Adapter for plain async closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SignalHandler for FnHandler<F>
where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, signal: &Signal) -> anyhow::Result<()> {
        (self.0)(signal.clone()).await
    }
}

/// Handlers keyed by signal type, in registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<SignalType, Vec<Arc<dyn SignalHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `signal_type`. Several handlers may share a type.
    pub fn on(&mut self, signal_type: SignalType, handler: Arc<dyn SignalHandler>) -> &mut Self {
        self.handlers.entry(signal_type).or_default().push(handler);
        self
    }

    /// Add an async closure as a handler.
    pub fn on_fn<F, Fut>(&mut self, signal_type: SignalType, f: F) -> &mut Self
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(signal_type, Arc::new(FnHandler(f)))
    }

    /// Handlers registered for `signal_type`; empty when there are none.
    pub fn handlers_for(&self, signal_type: SignalType) -> &[Arc<dyn SignalHandler>] {
        self.handlers
            .get(&signal_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal types with at least one handler, in tag order.
    pub fn types(&self) -> Vec<SignalType> {
        let mut types: Vec<SignalType> = self
            .handlers
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(t, _)| *t)
            .collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.types().into_iter().map(|t| (t, self.handlers_for(t).len())))
            .finish()
    }
}
