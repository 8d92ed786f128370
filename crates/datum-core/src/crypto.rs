//! Cryptographic primitives for Datum.
//!
//! Provides two things:
//!   1. SHA-256 hashing — Merkle node hashes and message digests
//!   2. ECDSA P-256 signing — every datagram carries a 64-byte `r‖s` trailer
//!
//! Signatures are always the fixed-width form (two 32-byte big-endian
//! integers), never DER. Public keys travel as the 64-byte uncompressed
//! point `X‖Y` without the SEC1 `0x04` prefix.
//!
//! The private scalar is wiped from memory when the keypair is dropped.
//! There is no unsafe code in this module.

use std::path::Path;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of an encoded public key (`X‖Y`).
pub const PUBLIC_KEY_LEN: usize = 64;

/// Length of an encoded signature (`r‖s`).
pub const SIGNATURE_LEN: usize = 64;

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte SHA-256 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Incremental SHA-256 hasher for payloads assembled from pieces.
///
/// # Example
/// ```
/// use datum_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, datum_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// A peer's long-term P-256 signing keypair.
///
/// Generated once and stored at the configured keypair path. The public
/// half is sent in every PublicKeyReply; the private scalar never leaves
/// this struct except through [`Keypair::private_bytes`].
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::random(&mut OsRng))
    }

    /// Reconstruct a keypair from a stored 32-byte private scalar.
    pub fn from_private(private_bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing =
            SigningKey::from_slice(private_bytes).map_err(|_| CryptoError::BadPrivateKey)?;
        Ok(Self::from_signing(signing))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().clone());
        Self { signing, public }
    }

    /// Serialize the private scalar for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.signing.to_bytes());
        out
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Load the keypair stored at `path`, or generate and store a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(std::fs::read(path).map_err(CryptoError::KeyFile)?);
            return Self::from_private(&bytes);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CryptoError::KeyFile)?;
        }
        std::fs::write(path, keypair.private_bytes().as_slice()).map_err(CryptoError::KeyFile)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(CryptoError::KeyFile)?;
        }
        Ok(keypair)
    }

    /// Sign `data`: ECDSA over SHA-256(data), returned as fixed-width `r‖s`.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.signing.sign(data);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

/// A P-256 verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Decode the 64-byte `X‖Y` form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::BadPublicKey);
        }
        let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(bytes);
        VerifyingKey::from_sec1_bytes(&sec1)
            .map(Self)
            .map_err(|_| CryptoError::BadPublicKey)
    }

    /// Decode a hex string of the 64-byte `X‖Y` form.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(text.trim()).map_err(|_| CryptoError::BadPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Encode as 64 raw bytes, uncompressed, no prefix byte.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.0.as_affine().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// Check a fixed-width `r‖s` signature over SHA-256(data).
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.0
            .verify(data, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed public key")]
    BadPublicKey,

    #[error("malformed private key")]
    BadPrivateKey,

    #[error("keypair file: {0}")]
    KeyFile(std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
