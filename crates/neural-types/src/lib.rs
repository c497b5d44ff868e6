//! Core types for the Neural Protocol.
//!
//! This crate defines the data shared by the wire codec, the transports and
//! the agent runtime: identities, signals, errors and configuration. It
//! contains no I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod signal;

pub use error::{CodecError, NeuralError, NeuralResult, TransportError};
pub use identity::Identity;
pub use signal::{payload, Payload, Signal, SignalType};
