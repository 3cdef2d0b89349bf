//! Secret / hashlock generation
//!
//! Every order gets a fresh 32-byte secret from the OS entropy source. The
//! hashlock is its SHA-256 digest; both escrows are created against the same
//! hashlock and released by revealing the secret.

use crate::error::{ResolverError, ResolverResult};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of an order's secret
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock(pub [u8; 32]);

impl Hashlock {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self)
    }
}

impl Serialize for Hashlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Pre-image of a hashlock. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn hashlock(&self) -> Hashlock {
        Hashlock(sha256(&self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// A secret together with its hashlock
#[derive(Debug, Clone)]
pub struct Commitment {
    pub secret: Secret,
    pub hashlock: Hashlock,
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Check that a revealed secret opens the given hashlock
pub fn verify(secret: &Secret, hashlock: &Hashlock) -> bool {
    secret.hashlock() == *hashlock
}

/// Produces one commitment per order
#[derive(Debug, Clone, Copy)]
pub struct CommitmentGenerator {
    _private: (),
}

impl CommitmentGenerator {
    /// Draw from the entropy source once; failing here is fatal at startup
    pub fn new() -> ResolverResult<Self> {
        let mut sample = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| ResolverError::Internal(format!("entropy source unavailable: {}", e)))?;
        Ok(Self { _private: () })
    }

    pub fn generate(&self) -> Commitment {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = Secret(bytes);
        let hashlock = secret.hashlock();
        Commitment { secret, hashlock }
    }
}
