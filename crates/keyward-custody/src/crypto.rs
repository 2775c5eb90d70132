//! Key derivation and authenticated encryption using the `ring` crate.
//!
//! This module provides the cryptographic core of the custody subsystem:
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256 from a passphrase and a random
//!   salt, with caller-supplied iteration count and key length.
//! - **Sealing/opening**: AES-GCM authenticated encryption with randomly
//!   generated 96-bit nonces. A failed tag check covers both tampering and
//!   a wrong passphrase — the two are indistinguishable on purpose.
//! - **Random generation**: cryptographically secure bytes via `ring`.
//!
//! Every [`seal`] call draws a **fresh salt** and pays a full derivation.
//! Repeated encryptions of the same or related secrets therefore share no
//! key material and cannot be correlated by ciphertext. Do not change this
//! to reuse a per-secret salt.
//!
//! Key material lives in [`KeyHandle`]s, which are overwritten with zeros
//! when dropped and cannot be serialized or printed.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CustodyError, Result};

/// Minimum accepted salt length in bytes (128 bits).
pub const MIN_SALT_LEN: usize = 16;

/// Length of salts generated by this module.
pub const SALT_LEN: usize = 32;

/// Length of the AES-GCM nonce in bytes (96 bits).
pub const NONCE_LEN: usize = aead::NONCE_LEN;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Whether `len` is a key length the AEAD layer can use.
pub fn is_supported_key_length(len: usize) -> bool {
    matches!(len, 16 | 32)
}

fn aead_algorithm(key_len: usize) -> Result<&'static aead::Algorithm> {
    match key_len {
        16 => Ok(&aead::AES_128_GCM),
        32 => Ok(&aead::AES_256_GCM),
        other => Err(CustodyError::Validation(format!(
            "unsupported key length {other} (expected 16 or 32 bytes)"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Key handle
// ---------------------------------------------------------------------------

/// Opaque derived key material.
///
/// A handle owns its bytes exclusively: it is not `Clone`, not `Serialize`,
/// its `Debug` output is redacted, and the bytes are zeroed when the handle
/// is dropped. Only this crate can read the raw bytes.
pub struct KeyHandle {
    bytes: Vec<u8>,
}

impl KeyHandle {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length handle (never produced by [`derive_key`]).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyHandle({} bytes, redacted)", self.bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for bound keys. Since every seal call
/// generates a fresh random nonce, this wrapper ensures each bound key is
/// used exactly once.
struct OneShotNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a symmetric key from `passphrase` and `salt`.
///
/// Deterministic: identical inputs always yield the identical key, and any
/// change to passphrase, salt, or iteration count yields an unrelated key.
///
/// # Errors
///
/// [`CustodyError::Validation`] if the passphrase is empty, the salt is
/// shorter than [`MIN_SALT_LEN`], the iteration count is zero, or the key
/// length is unsupported.
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    key_length: usize,
) -> Result<KeyHandle> {
    if passphrase.is_empty() {
        return Err(CustodyError::Validation("passphrase must not be empty".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(CustodyError::Validation(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    if !is_supported_key_length(key_length) {
        return Err(CustodyError::Validation(format!(
            "unsupported key length {key_length} (expected 16 or 32 bytes)"
        )));
    }
    let iterations = std::num::NonZeroU32::new(iterations)
        .ok_or_else(|| CustodyError::Validation("iterations must be non-zero".into()))?;

    let mut out = vec![0u8; key_length];
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, passphrase, &mut out);

    tracing::trace!(key_length, "derived key from passphrase");
    Ok(KeyHandle::from_bytes(out))
}

/// Constant-time check that `passphrase` re-derives `expected` under `salt`.
pub fn verify_passphrase(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    expected: &KeyHandle,
) -> bool {
    let Some(iterations) = std::num::NonZeroU32::new(iterations) else {
        return false;
    };
    pbkdf2::verify(PBKDF2_ALG, iterations, salt, passphrase, expected.as_bytes()).is_ok()
}

// ---------------------------------------------------------------------------
// Seal / open
// ---------------------------------------------------------------------------

/// A sealed secret: ciphertext plus the public parameters needed to open it.
///
/// The salt and nonce are not secret and are persisted alongside the
/// ciphertext, so each sealed secret is independently decryptable given
/// only the passphrase.
#[derive(Debug, Clone)]
pub struct SealedSecret {
    /// AES-GCM ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
    /// Fresh PBKDF2 salt drawn for this seal call.
    pub salt: Vec<u8>,
    /// Fresh 96-bit nonce drawn for this seal call.
    pub nonce: [u8; NONCE_LEN],
}

/// Seal `plaintext` under `passphrase`.
///
/// Generates a fresh salt and nonce, derives a single-use key, encrypts
/// with AES-GCM, and drops (zeroes) the key before returning.
///
/// # Errors
///
/// [`CustodyError::Validation`] for bad inputs, [`CustodyError::Crypto`]
/// if the CSPRNG or cipher fails.
pub fn seal(
    plaintext: &[u8],
    passphrase: &[u8],
    iterations: u32,
    key_length: usize,
) -> Result<SealedSecret> {
    let rng = SystemRandom::new();

    let mut salt = vec![0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CustodyError::Crypto {
        reason: "failed to generate random salt".into(),
    })?;

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| CustodyError::Crypto {
        reason: "failed to generate random nonce".into(),
    })?;

    let key = derive_key(passphrase, &salt, iterations, key_length)?;
    let unbound =
        UnboundKey::new(aead_algorithm(key_length)?, key.as_bytes()).map_err(|_| {
            CustodyError::Crypto {
                reason: "failed to create AEAD key".into(),
            }
        })?;
    let mut sealing_key = SealingKey::new(unbound, OneShotNonce(Some(nonce)));

    // ring encrypts in place and appends the authentication tag.
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CustodyError::Crypto {
            reason: "seal failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "sealed secret"
    );

    Ok(SealedSecret {
        ciphertext: in_out,
        salt,
        nonce,
    })
}

/// Open a sealed secret.
///
/// Re-derives the key from `passphrase` and `salt` and decrypts. The
/// plaintext comes back in a [`Zeroizing`] buffer that wipes itself when
/// dropped.
///
/// # Errors
///
/// [`CustodyError::Crypto`] if the authentication tag does not verify —
/// tampered ciphertext, altered salt or nonce, and a wrong passphrase all
/// fail identically. Partially decrypted output is never returned.
pub fn open(
    ciphertext: &[u8],
    salt: &[u8],
    nonce: &[u8],
    passphrase: &[u8],
    iterations: u32,
    key_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(CustodyError::Validation(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce);

    let key = derive_key(passphrase, salt, iterations, key_length)?;
    let unbound =
        UnboundKey::new(aead_algorithm(key_length)?, key.as_bytes()).map_err(|_| {
            CustodyError::Crypto {
                reason: "failed to create AEAD key".into(),
            }
        })?;
    let mut opening_key = OpeningKey::new(unbound, OneShotNonce(Some(nonce_bytes)));

    let mut in_out = ciphertext.to_vec();
    let plaintext_len = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CustodyError::Crypto {
            reason: "authentication failed".into(),
        })?
        .len();

    in_out.truncate(plaintext_len);
    Ok(Zeroizing::new(in_out))
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| CustodyError::Crypto {
        reason: "failed to generate random bytes".into(),
    })?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
