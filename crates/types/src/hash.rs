//! Digest and address primitives.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of a digest in bytes (SHA-256).
pub const HASH_SIZE: usize = 32;

/// Size of an address in bytes (truncated digest of a public key).
pub const ADDRESS_SIZE: usize = 20;

/// Errors converting hex strings or byte slices into digests/addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("invalid length: got {got} bytes, want {want}")]
    InvalidLength { got: usize, want: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// SHA-256 of `data`.
    pub fn sum(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Wrap a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HexError> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| HexError::InvalidLength {
            got: bytes.len(),
            want: HASH_SIZE,
        })?;
        Ok(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: enough to eyeball in logs without drowning them.
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        Hash::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 20-byte account/validator address.
///
/// Derived as the first 20 bytes of the SHA-256 digest of a public key's
/// canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub const fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Address(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HexError> {
        let arr: [u8; ADDRESS_SIZE] = bytes.try_into().map_err(|_| HexError::InvalidLength {
            got: bytes.len(),
            want: ADDRESS_SIZE,
        })?;
        Ok(Address(arr))
    }

    /// Derive an address from public key bytes.
    pub fn from_pub_key_bytes(key_bytes: &[u8]) -> Self {
        let digest = Hash::sum(key_bytes);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest.as_bytes()[..ADDRESS_SIZE]);
        Address(out)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl FromStr for Address {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        Address::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
