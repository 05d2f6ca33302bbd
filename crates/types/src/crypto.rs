//! Keys, signatures, and the shared verification cache.
//!
//! Key and signature material is carried as tagged sum types so the wire
//! format can name the scheme explicitly (`"palisade/PubKeyEd25519"`).
//! Adding a scheme means adding a variant and registering its tag in
//! [`PublicKey::from_type_and_bytes`]; nothing else dispatches on strings.
//!
//! The acceptance rule for Ed25519 lives in exactly one place,
//! [`PublicKey::verify`]. Consensus requires every honest node to agree
//! bit-for-bit on which signatures are valid, so no other code path may
//! verify a signature with different semantics.

use crate::hash::{Address, Hash};
use ed25519_dalek::{Signer, Verifier};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Registry tag for Ed25519 public keys.
pub const ED25519_KEY_TYPE: &str = "palisade/PubKeyEd25519";

/// Byte length of an Ed25519 public key.
pub const ED25519_PUB_KEY_SIZE: usize = 32;

/// Byte length of an Ed25519 signature.
pub const ED25519_SIGNATURE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unknown key type {0:?}")]
    UnknownKeyType(String),

    #[error("invalid key length: got {got}, want {want}")]
    InvalidKeyLength { got: usize, want: usize },

    #[error("invalid signature length: got {got}, want {want}")]
    InvalidSignatureLength { got: usize, want: usize },

    #[error("malformed public key")]
    MalformedKey,

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("batch length mismatch: {keys} keys, {messages} messages, {signatures} signatures")]
    BatchMismatch {
        keys: usize,
        messages: usize,
        signatures: usize,
    },
}

/// A public key, tagged by scheme.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PublicKey {
    Ed25519([u8; ED25519_PUB_KEY_SIZE]),
}

impl PublicKey {
    /// The registry tag carried on the wire for this key's scheme.
    pub fn type_tag(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => ED25519_KEY_TYPE,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PublicKey::Ed25519(bytes) => bytes,
        }
    }

    /// Derive the 20-byte address for this key.
    pub fn address(&self) -> Address {
        Address::from_pub_key_bytes(self.as_bytes())
    }

    /// Construct a key from a registry tag and raw bytes.
    pub fn from_type_and_bytes(type_tag: &str, bytes: &[u8]) -> Result<Self, CryptoError> {
        match type_tag {
            ED25519_KEY_TYPE => {
                let arr: [u8; ED25519_PUB_KEY_SIZE] =
                    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                        got: bytes.len(),
                        want: ED25519_PUB_KEY_SIZE,
                    })?;
                Ok(PublicKey::Ed25519(arr))
            }
            other => Err(CryptoError::UnknownKeyType(other.to_string())),
        }
    }

    /// Verify `sig` over `msg`.
    ///
    /// This is the single consensus-critical acceptance rule: all honest
    /// nodes run exactly this function, so they agree on acceptance even for
    /// edge-case encodings (small-order points, non-canonical scalars).
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        match (self, sig) {
            (PublicKey::Ed25519(key_bytes), Signature::Ed25519(sig_bytes)) => {
                let vk = ed25519_dalek::VerifyingKey::from_bytes(key_bytes)
                    .map_err(|_| CryptoError::MalformedKey)?;
                let signature = ed25519_dalek::Signature::from_bytes(sig_bytes);
                vk.verify(msg, &signature)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicKey::Ed25519(bytes) => {
                write!(f, "PubKeyEd25519({})", &hex::encode(bytes)[..12])
            }
        }
    }
}

/// A signature, tagged by scheme.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Signature {
    Ed25519([u8; ED25519_SIGNATURE_SIZE]),
}

impl Signature {
    /// The all-zero signature. Placeholder only; never verifies.
    pub fn zero() -> Self {
        Signature::Ed25519([0u8; ED25519_SIGNATURE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Signature::Ed25519(bytes) => bytes,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; ED25519_SIGNATURE_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidSignatureLength {
                    got: bytes.len(),
                    want: ED25519_SIGNATURE_SIZE,
                })?;
        Ok(Signature::Ed25519(arr))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Ed25519(bytes) => {
                write!(f, "SigEd25519({})", &hex::encode(bytes)[..12])
            }
        }
    }
}

/// An Ed25519 signing keypair.
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the given RNG.
    pub fn generate<R: rand::CryptoRng + rand::RngCore>(rng: &mut R) -> Self {
        Keypair {
            signing: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Keypair {
            signing: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature::Ed25519(self.signing.sign(msg).to_bytes())
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Keypair {
            signing: self.signing.clone(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak seed material into logs.
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// Verify a batch of signatures over their messages.
///
/// Faster than sequential verification for large commits. Falls back to the
/// same acceptance rule as [`PublicKey::verify`]: a batch is accepted iff
/// every member would be accepted individually.
pub fn verify_batch(
    keys: &[PublicKey],
    messages: &[&[u8]],
    signatures: &[Signature],
) -> Result<(), CryptoError> {
    if keys.len() != messages.len() || keys.len() != signatures.len() {
        return Err(CryptoError::BatchMismatch {
            keys: keys.len(),
            messages: messages.len(),
            signatures: signatures.len(),
        });
    }

    let mut vks = Vec::with_capacity(keys.len());
    let mut sigs = Vec::with_capacity(signatures.len());
    for (key, sig) in keys.iter().zip(signatures) {
        let PublicKey::Ed25519(key_bytes) = key;
        let Signature::Ed25519(sig_bytes) = sig;
        vks.push(
            ed25519_dalek::VerifyingKey::from_bytes(key_bytes)
                .map_err(|_| CryptoError::MalformedKey)?,
        );
        sigs.push(ed25519_dalek::Signature::from_bytes(sig_bytes));
    }

    ed25519_dalek::verify_batch(messages, &sigs, &vks)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Default capacity of the signature verification cache.
pub const DEFAULT_SIGNATURE_CACHE_SIZE: usize = 4096;

/// LRU cache of already-verified signatures.
///
/// Repeated verification of the same `(key, message, signature)` triple,
/// common when a commit is checked by both consensus and the light
/// verifier, skips the curve arithmetic. The cache is a pure performance aid: a miss
/// always falls through to [`PublicKey::verify`], and only *successful*
/// verifications are inserted, so cache contents can never turn a rejection
/// into an acceptance.
///
/// Constructed once at startup and passed by handle; never a hidden global.
pub struct SignatureCache {
    inner: Mutex<LruCache<(PublicKey, Hash, Signature), ()>>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        SignatureCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Verify `sig` over `msg`, consulting the cache first.
    pub fn verify(&self, key: &PublicKey, msg: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        let cache_key = (*key, Hash::sum(msg), *sig);
        if self.inner.lock().contains(&cache_key) {
            return Ok(());
        }
        key.verify(msg, sig)?;
        self.inner.lock().put(cache_key, ());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        SignatureCache::new(DEFAULT_SIGNATURE_CACHE_SIZE)
    }
}

impl fmt::Debug for SignatureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = Keypair::from_seed([1u8; 32]);
        let msg = b"propose block at height 7";
        let sig = kp.sign(msg);
        assert!(kp.public_key().verify(msg, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::from_seed([2u8; 32]);
        let sig = kp.sign(b"original");
        assert_eq!(
            kp.public_key().verify(b"tampered", &sig),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let a = Keypair::from_seed([3u8; 32]);
        let b = Keypair::from_seed([4u8; 32]);
        let sig = a.sign(b"msg");
        assert!(b.public_key().verify(b"msg", &sig).is_err());
    }

    #[test]
    fn registry_round_trip() {
        let kp = Keypair::from_seed([5u8; 32]);
        let pk = kp.public_key();
        let rebuilt = PublicKey::from_type_and_bytes(pk.type_tag(), pk.as_bytes()).unwrap();
        assert_eq!(pk, rebuilt);
    }

    #[test]
    fn registry_rejects_unknown_tag() {
        assert!(matches!(
            PublicKey::from_type_and_bytes("palisade/PubKeySecp256k1", &[0u8; 33]),
            Err(CryptoError::UnknownKeyType(_))
        ));
    }

    #[test]
    fn batch_accepts_all_valid() {
        let kps: Vec<Keypair> = (0..4).map(|i| Keypair::from_seed([i; 32])).collect();
        let msgs: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10]).collect();
        let keys: Vec<PublicKey> = kps.iter().map(|k| k.public_key()).collect();
        let sigs: Vec<Signature> = kps.iter().zip(&msgs).map(|(k, m)| k.sign(m)).collect();
        let msg_refs: Vec<&[u8]> = msgs.iter().map(|m| m.as_slice()).collect();
        assert!(verify_batch(&keys, &msg_refs, &sigs).is_ok());
    }

    #[test]
    fn batch_rejects_single_bad_signature() {
        let kps: Vec<Keypair> = (0..4).map(|i| Keypair::from_seed([i; 32])).collect();
        let msgs: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10]).collect();
        let keys: Vec<PublicKey> = kps.iter().map(|k| k.public_key()).collect();
        let mut sigs: Vec<Signature> = kps.iter().zip(&msgs).map(|(k, m)| k.sign(m)).collect();
        sigs[2] = Signature::zero();
        let msg_refs: Vec<&[u8]> = msgs.iter().map(|m| m.as_slice()).collect();
        assert!(verify_batch(&keys, &msg_refs, &sigs).is_err());
    }

    #[test]
    fn cache_hit_skips_reverification_but_never_flips_result() {
        let cache = SignatureCache::new(16);
        let kp = Keypair::from_seed([6u8; 32]);
        let pk = kp.public_key();
        let sig = kp.sign(b"msg");

        assert!(cache.verify(&pk, b"msg", &sig).is_ok());
        assert_eq!(cache.len(), 1);
        // Second call is served from cache.
        assert!(cache.verify(&pk, b"msg", &sig).is_ok());
        assert_eq!(cache.len(), 1);

        // A bad triple is rejected and never cached.
        assert!(cache.verify(&pk, b"other", &sig).is_err());
        assert_eq!(cache.len(), 1);
    }
}
