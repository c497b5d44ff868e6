//! Agent identities.
//!
//! An [`Identity`] is a 32-byte SHA-256 digest of an agent name plus a salt.
//! It is a plain `Copy` value: equality, ordering and hashing are byte-wise,
//! which makes it directly usable as a routing key and as a synapse-table key.

use crate::error::{NeuralError, NeuralResult};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of an identity digest in bytes.
pub const IDENTITY_LEN: usize = 32;

/// Salt length used when the caller does not supply one.
const GENERATED_SALT_LEN: usize = 16;

/// A 256-bit digest uniquely naming an agent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    /// The all-zero sentinel used as the target of broadcast signals.
    pub const BROADCAST: Identity = Identity([0u8; IDENTITY_LEN]);

    /// Derive an identity from `name || salt`.
    ///
    /// With `salt = None` a random salt is drawn from the OS RNG, so every
    /// call yields a fresh identity. With an explicit salt the result is
    /// deterministic.
    pub fn derive(name: &str, salt: Option<&[u8]>) -> NeuralResult<Self> {
        if name.is_empty() {
            return Err(NeuralError::InvalidArgument(
                "identity name must not be empty".to_string(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        match salt {
            Some(salt) => hasher.update(salt),
            None => {
                let mut generated = [0u8; GENERATED_SALT_LEN];
                rand::rngs::OsRng.fill_bytes(&mut generated);
                hasher.update(generated);
            }
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Wrap raw digest bytes (e.g. read off the wire).
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Whether this is the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("Identity(BROADCAST)")
        } else {
            write!(f, "Identity({})", self.short())
        }
    }
}

impl FromStr for Identity {
    type Err = NeuralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; IDENTITY_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| {
            NeuralError::InvalidArgument(format!("invalid identity hex '{s}': {e}"))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_derive_is_deterministic_with_salt() {
        let a = Identity::derive("alice", Some(b"salt")).unwrap();
        let b = Identity::derive("alice", Some(b"salt")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_differs_by_name_and_salt() {
        let a = Identity::derive("alice", Some(b"salt")).unwrap();
        let b = Identity::derive("bob", Some(b"salt")).unwrap();
        let c = Identity::derive("alice", Some(b"pepper")).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_derive_without_salt_is_fresh() {
        let a = Identity::derive("test", None).unwrap();
        let b = Identity::derive("test", None).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_broadcast());
    }

    #[test]
    fn test_derive_matches_sha256_of_name_and_salt() {
        let id = Identity::derive("alice", Some(b"xyz")).unwrap();
        let expected: [u8; 32] = Sha256::digest(b"alicexyz").into();
        assert_eq!(id.as_bytes(), &expected);
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = Identity::derive("", Some(b"salt")).unwrap_err();
        assert!(matches!(err, NeuralError::InvalidArgument(_)));
    }

    #[test]
    fn test_usable_as_map_key() {
        let a = Identity::derive("alice", Some(b"1")).unwrap();
        let mut map = HashMap::new();
        map.insert(a, "alice");
        let copy = Identity::from_bytes(*a.as_bytes());
        assert_eq!(map.get(&copy), Some(&"alice"));
    }

    #[test]
    fn test_hex_display_and_parse() {
        let id = Identity::derive("alice", Some(b"1")).unwrap();
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with(&id.short()));
        let parsed: Identity = text.parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-hex".parse::<Identity>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = Identity::derive("alice", Some(b"1")).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_broadcast_sentinel() {
        assert!(Identity::BROADCAST.is_broadcast());
        assert_eq!(Identity::BROADCAST.as_bytes(), &[0u8; 32]);
        assert_eq!(format!("{:?}", Identity::BROADCAST), "Identity(BROADCAST)");
    }
}
