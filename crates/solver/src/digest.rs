//! Content digests used as cache identities

use crate::errors::{Result, SolverError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

const ALGORITHM: &str = "sha256";

/// Opaque content hash in `algorithm:hex` form
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self(format!("{ALGORITHM}:{}", hex::encode(hasher.finalize())))
    }

    /// Parse an already computed digest string
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let Some((algorithm, encoded)) = value.split_once(':') else {
            return Err(SolverError::invalid_graph(format!(
                "digest '{value}' is missing an algorithm prefix"
            )));
        };
        if algorithm.is_empty()
            || encoded.is_empty()
            || !encoded.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(SolverError::invalid_graph(format!(
                "digest '{value}' is not of the form algorithm:hex"
            )));
        }
        Ok(Self(value))
    }

    /// String form of the digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex-encoded part without the algorithm prefix
    #[must_use]
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, hex)| hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

/// Identity of a dependency-free key: one digest per (digest, output slot)
#[must_use]
pub fn root_key(digest: &Digest, output: usize) -> Digest {
    Digest::from_bytes(format!("{digest}@{output}"))
}
