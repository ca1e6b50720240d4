//! Content digests
//!
//! [`ContentHash`] is the 32-byte Blake3 digest used to address every blob,
//! state and memoization key in the store.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Domain prefix for memoization keys, so a tool key can never collide with a
/// blob digest of the same bytes.
const TOOL_KEY_DOMAIN: &str = "atm/tool-call/v1";

/// A 32-byte content digest (Blake3)
///
/// Identical bytes always produce the identical digest. Cheap to copy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap raw digest bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a byte slice
    ///
    /// # Errors
    /// Returns error if the slice is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Digest of arbitrary bytes
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Canonical JSON encoding of a value.
    ///
    /// Maps inside the model are `BTreeMap`/`BTreeSet` and `serde_json`
    /// objects are key-sorted, so the encoding is stable for equal values.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, HashError> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Digest of the canonical encoding of a value
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn compute_canonical<T: Serialize>(value: &T) -> Result<Self, HashError> {
        Ok(Self::compute(&Self::canonical_bytes(value)?))
    }

    /// Memoization key for a tool invocation.
    ///
    /// The input must already be canonicalized by the caller; this only frames
    /// `(tool_name, input)` unambiguously before hashing.
    #[must_use]
    pub fn for_tool_call(tool_name: &str, canonical_input: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(TOOL_KEY_DOMAIN);
        hasher.update(&(tool_name.len() as u64).to_le_bytes());
        hasher.update(tool_name.as_bytes());
        hasher.update(canonical_input);
        Self(*hasher.finalize().as_bytes())
    }

    /// First 16 hex chars, for logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Digests always travel as hex strings; the index and blobs are JSON.
impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct HexVisitor;

        impl serde::de::Visitor<'_> for HexVisitor {
            type Value = ContentHash;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 64 character hex digest")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// Errors produced while computing or parsing digests
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Wrong digest length
    #[error("invalid digest length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Malformed hex
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Canonical encoding failed
    #[error("canonical encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// NaN or infinity, which JSON cannot carry
    #[error("non-finite number in {0}")]
    NonFinite(String),
}
