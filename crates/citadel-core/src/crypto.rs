//! Cryptographic primitives for Citadel.
//!
//! The barrier's ciphertext envelope is defined here:
//!
//! ```text
//! version (1 byte) || term (4 bytes, big-endian) || nonce (12) || ciphertext+tag (16)
//! ```
//!
//! The version byte selects the AEAD (1 = AES-256-GCM, 2 = ChaCha20-Poly1305)
//! and the term selects which keyring data key decrypts the value. The entry
//! key is bound as associated data, so a ciphertext pasted under a different
//! storage key fails authentication.
//!
//! All key material lives in zeroize-on-drop newtypes and is never exposed
//! in `Debug` output.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Envelope header length: version byte + term.
const HEADER_LEN: usize = 1 + 4;

/// AEAD nonce length (96 bits) — shared by both supported algorithms.
pub const NONCE_LEN: usize = 12;

/// AEAD tag length.
const TAG_LEN: usize = 16;

/// Minimum envelope length: header + nonce + tag.
const MIN_ENVELOPE_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// AEAD algorithm selected by the envelope version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Version byte 1.
    #[default]
    Aes256Gcm,
    /// Version byte 2.
    ChaCha20Poly1305,
}

impl Algorithm {
    /// The envelope version byte for this algorithm.
    #[must_use]
    pub fn version_byte(self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }

    /// Decode an envelope version byte.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEnvelope`] for unknown versions.
    pub fn from_version_byte(byte: u8) -> Result<Self, CryptoError> {
        match byte {
            1 => Ok(Self::Aes256Gcm),
            2 => Ok(Self::ChaCha20Poly1305),
            other => Err(CryptoError::InvalidEnvelope {
                reason: format!("unknown envelope version {other}"),
            }),
        }
    }
}

/// A 256-bit symmetric key, zeroized on drop.
///
/// Used for the root key and every keyring data key. The inner bytes never
/// appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes. Callers must not log or persist these.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Detects a repeated nonce from the RNG.
///
/// A CSPRNG handing back the same 96-bit nonce twice in a row means the
/// entropy source is broken; continuing would be catastrophic for GCM, so
/// the caller treats the error as fatal.
#[derive(Debug, Default)]
pub struct NonceGuard {
    last: parking_lot::Mutex<Option<[u8; NONCE_LEN]>>,
}

impl NonceGuard {
    /// Draw the next nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] when the RNG repeats itself.
    pub fn next(&self) -> Result<[u8; NONCE_LEN], CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut last = self.last.lock();
        if *last == Some(nonce) {
            return Err(CryptoError::Encryption {
                reason: "nonce RNG returned a duplicate".to_owned(),
            });
        }
        *last = Some(nonce);
        Ok(nonce)
    }
}

/// Encrypt `plaintext` into a versioned envelope.
///
/// `aad` is bound as associated data — the barrier passes the entry key.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_envelope(
    algorithm: Algorithm,
    key: &EncryptionKey,
    term: u32,
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let ciphertext = match algorithm {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher.encrypt(Nonce::from_slice(&nonce), payload)
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
            cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
        }
    }
    .map_err(|e| CryptoError::Encryption {
        reason: e.to_string(),
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    out.push(algorithm.version_byte());
    out.extend_from_slice(&term.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// A parsed envelope header pointing into the original buffer.
#[derive(Debug)]
pub struct ParsedEnvelope<'a> {
    pub algorithm: Algorithm,
    pub term: u32,
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
}

/// Split an envelope into its header and ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidEnvelope`] for truncated input or an
/// unknown version byte.
pub fn parse_envelope(blob: &[u8]) -> Result<ParsedEnvelope<'_>, CryptoError> {
    if blob.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::InvalidEnvelope {
            reason: format!(
                "envelope too short: {} bytes, need at least {MIN_ENVELOPE_LEN}",
                blob.len()
            ),
        });
    }
    let algorithm = Algorithm::from_version_byte(blob[0])?;
    let term = u32::from_be_bytes([blob[1], blob[2], blob[3], blob[4]]);
    let nonce = &blob[HEADER_LEN..HEADER_LEN + NONCE_LEN];
    let ciphertext = &blob[HEADER_LEN + NONCE_LEN..];
    Ok(ParsedEnvelope {
        algorithm,
        term,
        nonce,
        ciphertext,
    })
}

/// Decrypt a parsed envelope with the key its term resolved to.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] when authentication fails — wrong
/// key, wrong AAD, or tampered bytes.
pub fn open_envelope(
    key: &EncryptionKey,
    envelope: &ParsedEnvelope<'_>,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload {
        msg: envelope.ciphertext,
        aad,
    };
    match envelope.algorithm {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher.decrypt(Nonce::from_slice(envelope.nonce), payload)
        }
        Algorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
            cipher.decrypt(chacha20poly1305::Nonce::from_slice(envelope.nonce), payload)
        }
    }
    .map_err(|e| CryptoError::Decryption {
        reason: e.to_string(),
    })
}

/// Derive a subkey from a root key with HKDF-SHA256.
///
/// The `info` string must be unique per use (e.g. `b"citadel-batch-token"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: Algorithm) {
        let key = EncryptionKey::generate();
        let guard = NonceGuard::default();
        let envelope = seal_envelope(
            algorithm,
            &key,
            7,
            guard.next().unwrap(),
            b"core/keyring",
            b"plaintext payload",
        )
        .unwrap();

        let parsed = parse_envelope(&envelope).unwrap();
        assert_eq!(parsed.algorithm, algorithm);
        assert_eq!(parsed.term, 7);

        let plain = open_envelope(&key, &parsed, b"core/keyring").unwrap();
        assert_eq!(plain, b"plaintext payload");
    }

    #[test]
    fn aes_roundtrip() {
        roundtrip(Algorithm::Aes256Gcm);
    }

    #[test]
    fn chacha_roundtrip() {
        roundtrip(Algorithm::ChaCha20Poly1305);
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let key = EncryptionKey::generate();
        let guard = NonceGuard::default();
        let envelope = seal_envelope(
            Algorithm::Aes256Gcm,
            &key,
            1,
            guard.next().unwrap(),
            b"path/a",
            b"secret",
        )
        .unwrap();

        let parsed = parse_envelope(&envelope).unwrap();
        let err = open_envelope(&key, &parsed, b"path/b").unwrap_err();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = EncryptionKey::generate();
        let other = EncryptionKey::generate();
        let guard = NonceGuard::default();
        let envelope = seal_envelope(
            Algorithm::Aes256Gcm,
            &key,
            1,
            guard.next().unwrap(),
            b"k",
            b"secret",
        )
        .unwrap();

        let parsed = parse_envelope(&envelope).unwrap();
        let err = open_envelope(&other, &parsed, b"k").unwrap_err();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let guard = NonceGuard::default();
        let mut envelope = seal_envelope(
            Algorithm::ChaCha20Poly1305,
            &key,
            1,
            guard.next().unwrap(),
            b"k",
            b"secret",
        )
        .unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;

        let parsed = parse_envelope(&envelope).unwrap();
        let err = open_envelope(&key, &parsed, b"k").unwrap_err();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn truncated_envelope_rejected() {
        let err = parse_envelope(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidEnvelope { .. }));
    }

    #[test]
    fn unknown_version_rejected() {
        let blob = vec![9u8; MIN_ENVELOPE_LEN];
        let err = parse_envelope(&blob).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidEnvelope { .. }));
    }

    #[test]
    fn term_survives_the_header() {
        let key = EncryptionKey::generate();
        let guard = NonceGuard::default();
        let envelope = seal_envelope(
            Algorithm::Aes256Gcm,
            &key,
            0xDEAD_BEEF,
            guard.next().unwrap(),
            b"k",
            b"v",
        )
        .unwrap();
        assert_eq!(parse_envelope(&envelope).unwrap().term, 0xDEAD_BEEF);
    }

    #[test]
    fn derive_key_is_deterministic_and_separated() {
        let root = EncryptionKey::generate();
        let a1 = derive_key(&root, Some(b"salt"), b"citadel-batch-token").unwrap();
        let a2 = derive_key(&root, Some(b"salt"), b"citadel-batch-token").unwrap();
        let b = derive_key(&root, Some(b"salt"), b"citadel-other").unwrap();
        assert!(a1.ct_eq(&a2));
        assert!(!a1.ct_eq(&b));
    }

    #[test]
    fn debug_output_redacts_key_bytes() {
        let key = EncryptionKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn nonce_guard_draws_distinct_nonces() {
        let guard = NonceGuard::default();
        let a = guard.next().unwrap();
        let b = guard.next().unwrap();
        assert_ne!(a, b);
    }
}
