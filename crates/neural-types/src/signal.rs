//! Signal types: the unit of communication between agents.

use crate::error::{CodecError, NeuralError};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured payload carried by a signal: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The fixed set of signal types.
///
/// Each variant maps to a stable wire tag. New types must reserve a new tag;
/// tags are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SignalType {
    ActionPotential = 0,
    Dopamine = 1,
    Serotonin = 2,
    Norepinephrine = 3,
    Gaba = 4,
    Glutamate = 5,
}

impl SignalType {
    /// Every signal type, in tag order.
    pub const ALL: [SignalType; 6] = [
        SignalType::ActionPotential,
        SignalType::Dopamine,
        SignalType::Serotonin,
        SignalType::Norepinephrine,
        SignalType::Gaba,
        SignalType::Glutamate,
    ];

    /// The wire tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Conventional intent associated with the type.
    pub fn description(self) -> &'static str {
        match self {
            Self::ActionPotential => "activation",
            Self::Dopamine => "reward",
            Self::Serotonin => "stabilization",
            Self::Norepinephrine => "alert/opportunity",
            Self::Gaba => "inhibition",
            Self::Glutamate => "excitation/learning",
        }
    }
}

impl TryFrom<u8> for SignalType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(CodecError::UnknownSignalType(tag))
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ActionPotential => "ACTION_POTENTIAL",
            Self::Dopamine => "DOPAMINE",
            Self::Serotonin => "SEROTONIN",
            Self::Norepinephrine => "NOREPINEPHRINE",
            Self::Gaba => "GABA",
            Self::Glutamate => "GLUTAMATE",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for SignalType {
    type Err = NeuralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| NeuralError::InvalidArgument(format!("unknown signal type: {s}")))
    }
}

/// One addressed, typed, payload-carrying message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub source: Identity,
    /// [`Identity::BROADCAST`] addresses every registered agent.
    pub target: Identity,
    #[serde(default)]
    pub payload: Payload,
}

impl Signal {
    /// Create a signal addressed to a single target.
    pub fn new(signal_type: SignalType, source: Identity, target: Identity, payload: Payload) -> Self {
        Self {
            signal_type,
            source,
            target,
            payload,
        }
    }

    /// Create a broadcast signal.
    pub fn broadcast(signal_type: SignalType, source: Identity, payload: Payload) -> Self {
        Self::new(signal_type, source, Identity::BROADCAST, payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_broadcast()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.is_broadcast() {
            "BROADCAST".to_string()
        } else {
            self.target.short()
        };
        let keys: Vec<&str> = self.payload.keys().map(String::as_str).collect();
        write!(
            f,
            "[{}] {}->{} keys={:?}",
            self.signal_type,
            self.source.short(),
            target,
            keys
        )
    }
}

/// Build a [`Payload`] from a `serde_json::json!` object literal.
///
/// Non-object values are wrapped as `{"value": ...}`.
pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
