//! Synapse table: directed, weighted connections between agents.
//!
//! Every edge `(source, target)` carries a weight in `[min, max]` that moves
//! with delivery outcomes:
//!
//! - success: `w += rate * (max - w)`
//! - failure: `w -= rate * (w - min)`
//!
//! Repeated successes approach `max` geometrically and repeated failures
//! approach `min`, each step strictly moving the weight, until the gap drops
//! to a few ulps of `f64`. From the 0.5 baseline that takes about 100 steps
//! at rate 0.3 and about 700 at the default 0.05; past that point a success
//! can round to `max` exactly or leave the weight where it is.
//!
//! The result is clamped to the bounds. Edges that were never observed read
//! as the configured baseline. One table is shared (`Arc<SynapseTable>`) by
//! every agent in a process; updates to a single edge happen under the
//! DashMap shard lock, so concurrent reinforcements never lose an update.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use neural_types::config::{validate_rate, SynapseConfig};
use neural_types::{Identity, NeuralResult};
use serde::Serialize;
use std::fmt::Write;

/// Snapshot of one edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synapse {
    pub source: Identity,
    pub target: Identity,
    pub weight: f64,
    /// Outcomes observed on this edge.
    pub transmissions: u64,
    /// Outcomes that were successes.
    pub successes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Synapse {
    fn new(source: Identity, target: Identity, weight: f64, now: DateTime<Utc>) -> Self {
        Self {
            source,
            target,
            weight,
            transmissions: 0,
            successes: 0,
            created_at: now,
            last_used: now,
        }
    }

    /// Fraction of observed outcomes that succeeded, `0.0` before any.
    pub fn success_rate(&self) -> f64 {
        if self.transmissions == 0 {
            0.0
        } else {
            self.successes as f64 / self.transmissions as f64
        }
    }
}

/// Concurrent map of edges to weights.
#[derive(Debug)]
pub struct SynapseTable {
    config: SynapseConfig,
    edges: DashMap<(Identity, Identity), Synapse>,
}

impl SynapseTable {
    /// Create an empty table. Fails with `InvalidArgument` when the bounds,
    /// baseline or learning rate are inconsistent.
    pub fn new(config: SynapseConfig) -> NeuralResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            edges: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SynapseConfig {
        &self.config
    }

    /// Current weight of an edge, or the baseline if it was never observed.
    pub fn get_weight(&self, source: &Identity, target: &Identity) -> f64 {
        self.edges
            .get(&(*source, *target))
            .map(|s| s.weight)
            .unwrap_or(self.config.baseline)
    }

    /// Apply one outcome to an edge with an explicit rate and return the new
    /// weight. Rates outside `(0, 1]` are rejected.
    pub fn reinforce(
        &self,
        source: Identity,
        target: Identity,
        success: bool,
        rate: f64,
    ) -> NeuralResult<f64> {
        validate_rate(rate)?;
        Ok(self.apply(source, target, success, rate))
    }

    /// Apply one outcome at the configured learning rate.
    pub fn observe(&self, source: Identity, target: Identity, success: bool) -> f64 {
        self.apply(source, target, success, self.config.learning_rate)
    }

    fn apply(&self, source: Identity, target: Identity, success: bool, rate: f64) -> f64 {
        let SynapseConfig { min, max, baseline, .. } = self.config;
        let now = Utc::now();

        // The entry guard holds the shard lock across the read-modify-write.
        let mut edge = self
            .edges
            .entry((source, target))
            .or_insert_with(|| Synapse::new(source, target, baseline, now));

        let w = edge.weight;
        let next = if success {
            w + rate * (max - w)
        } else {
            w - rate * (w - min)
        };
        edge.weight = next.clamp(min, max);
        edge.transmissions += 1;
        if success {
            edge.successes += 1;
        }
        edge.last_used = now;
        edge.weight
    }

    /// Snapshot of one edge, if it has been observed.
    pub fn get(&self, source: &Identity, target: &Identity) -> Option<Synapse> {
        self.edges.get(&(*source, *target)).map(|s| s.clone())
    }

    /// All observed edges leaving `source`, strongest first.
    pub fn outgoing(&self, source: &Identity) -> Vec<Synapse> {
        let mut edges: Vec<Synapse> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == *source)
            .map(|e| e.value().clone())
            .collect();
        sort_by_weight(&mut edges);
        edges
    }

    /// Forget an edge. It reads as the baseline again afterwards.
    pub fn remove(&self, source: &Identity, target: &Identity) -> Option<Synapse> {
        self.edges.remove(&(*source, *target)).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Human-readable summary of every edge, strongest first.
    pub fn report(&self) -> String {
        let mut edges: Vec<Synapse> = self.edges.iter().map(|e| e.value().clone()).collect();
        sort_by_weight(&mut edges);

        let mut out = format!("Synapses ({}):\n", edges.len());
        for s in &edges {
            let _ = writeln!(
                out,
                "  {} -> {}  weight={:.3}  success={}/{} ({:.1}%)",
                s.source.short(),
                s.target.short(),
                s.weight,
                s.successes,
                s.transmissions,
                s.success_rate() * 100.0
            );
        }
        out
    }
}

fn sort_by_weight(edges: &mut [Synapse]) {
    edges.sort_by(|a, b| b.weight.total_cmp(&a.weight));
}
