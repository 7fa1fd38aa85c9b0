//! Seal providers: the things that wrap the barrier's root key.
//!
//! Three variants implement the [`Seal`] interface:
//!
//! - [`ShamirSeal`] — the root key is wrapped by a seal key that is split
//!   into operator-held shares with GF(2^8) secret sharing. Unwrapping
//!   requires a threshold of shares, collected over multiple calls by the
//!   core's unseal state machine. Nothing share-related is stored
//!   server-side.
//! - [`ExternalSeal`] — the root key round-trips through an external AEAD
//!   ([`KeyWrapper`], standing in for a KMS/HSM/PKCS#11 provider). The
//!   barrier auto-unseals; a separate recovery key gates privileged
//!   ceremonies.
//! - [`StaticSeal`] — key material supplied at startup (env or file).
//!   Intended only for declarative bootstrap.
//!
//! The seal configuration is persisted **in the clear** at a reserved
//! physical path, because it must be readable before any key material is
//! available.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use tokio::sync::RwLock;

use crate::crypto::{
    open_envelope, parse_envelope, seal_envelope, Algorithm, EncryptionKey, NonceGuard,
};
use crate::error::SealError;

/// Cleartext record: seal configuration.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// Cleartext record: recovery-key configuration (auto-unseal only).
pub const RECOVERY_CONFIG_PATH: &str = "core/recovery-config";

/// Cleartext record: the wrapped root key.
pub const ROOT_KEY_PATH: &str = "core/master";

/// Cleartext record: the wrapped unseal key for auto-unseal setups.
pub const UNSEAL_KEYS_PATH: &str = "core/hsm/barrier-unseal-keys";

/// Barrier-encrypted record: the recovery key (auto-unseal only).
pub const RECOVERY_KEY_PATH: &str = "core/recovery-key";

/// AAD context for seal-level envelopes.
const SEAL_AAD: &[u8] = b"citadel-seal";

/// Seal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealType {
    Shamir,
    Kms,
    Static,
}

impl SealType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shamir => "shamir",
            Self::Kms => "kms",
            Self::Static => "static",
        }
    }
}

/// Persisted seal (or recovery) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    #[serde(rename = "type")]
    pub seal_type: SealType,
    pub secret_shares: u8,
    pub secret_threshold: u8,
    /// PGP public keys the shares were encrypted to, when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pgp_keys: Vec<String>,
    /// Number of shares held in storage for auto-unseal setups.
    #[serde(default)]
    pub stored_shares: u8,
    /// Operation nonce recorded at init time.
    #[serde(default)]
    pub nonce: String,
}

impl SealConfig {
    /// Validate share-count and threshold bounds.
    ///
    /// A single share with threshold 1 is allowed (dev mode); otherwise the
    /// threshold must be at least 2 and no greater than the share count.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] describing the violation.
    pub fn validate(&self) -> Result<(), SealError> {
        let (n, t) = (self.secret_shares, self.secret_threshold);
        if n == 0 {
            return Err(SealError::InvalidConfig {
                reason: "share count must be at least 1".to_owned(),
            });
        }
        if t == 0 || t > n {
            return Err(SealError::InvalidConfig {
                reason: format!("threshold must be within 1..={n}, got {t}"),
            });
        }
        if n > 1 && t < 2 {
            return Err(SealError::InvalidConfig {
                reason: "threshold must be at least 2 when splitting into multiple shares"
                    .to_owned(),
            });
        }
        Ok(())
    }
}

// ── Shamir split / combine ───────────────────────────────────────────

/// Split `secret` into `shares` fragments, any `threshold` of which
/// reconstruct it.
///
/// # Errors
///
/// Returns [`SealError::InvalidConfig`] for out-of-range parameters.
pub fn split_key(secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Vec<u8>>, SealError> {
    if shares == 0 || threshold == 0 || threshold > shares {
        return Err(SealError::InvalidConfig {
            reason: format!("invalid split parameters: shares={shares} threshold={threshold}"),
        });
    }
    let sharks = Sharks(threshold);
    let dealer = sharks.dealer(secret);
    Ok(dealer
        .take(usize::from(shares))
        .map(|s: Share| Vec::from(&s))
        .collect())
}

/// Recombine `threshold` (or more) shares into the original secret.
///
/// # Errors
///
/// - [`SealError::InvalidShare`] if a share fails to parse.
/// - [`SealError::InvalidShares`] if recovery fails.
pub fn combine_shares(shares: &[Vec<u8>], threshold: u8) -> Result<Vec<u8>, SealError> {
    let parsed: Result<Vec<Share>, SealError> = shares
        .iter()
        .map(|raw| {
            Share::try_from(raw.as_slice()).map_err(|e| SealError::InvalidShare {
                reason: format!("share deserialization failed: {e}"),
            })
        })
        .collect();
    let parsed = parsed?;

    Sharks(threshold)
        .recover(&parsed)
        .map_err(|_| SealError::InvalidShares)
}

// ── Key wrapping ─────────────────────────────────────────────────────

/// Output of an external key-wrapping provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedBlob {
    /// Identifier of the wrapping key at the provider.
    pub key_id: String,
    pub ciphertext: Vec<u8>,
}

/// An external AEAD that wraps and unwraps small key blobs.
///
/// This is the KMS/HSM/PKCS#11 seam: the provider holds the wrapping key,
/// Citadel only ever sees ciphertext. Calls may block on the network, so
/// failures carry a transient marker via [`SealError::WrapperFailure`].
#[async_trait::async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Provider name, for error reporting.
    fn wrapper_type(&self) -> &'static str;

    /// Identifier of the wrapping key in use.
    fn key_id(&self) -> String;

    /// Wrap a small plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::WrapperFailure`] when the provider fails.
    async fn wrap(&self, plaintext: &[u8]) -> Result<WrappedBlob, SealError>;

    /// Unwrap a blob previously produced by this provider.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::WrapperFailure`] when the provider fails or the
    /// blob fails authentication.
    async fn unwrap(&self, blob: &WrappedBlob) -> Result<Vec<u8>, SealError>;
}

/// A local AEAD key wrapper.
///
/// Backs the external seal in tests and single-binary deployments where
/// the "KMS" is a locally held key.
pub struct AeadKeyWrapper {
    key: EncryptionKey,
    key_id: String,
    nonce_guard: NonceGuard,
}

impl AeadKeyWrapper {
    #[must_use]
    pub fn new(key: EncryptionKey, key_id: impl Into<String>) -> Self {
        Self {
            key,
            key_id: key_id.into(),
            nonce_guard: NonceGuard::default(),
        }
    }
}

impl std::fmt::Debug for AeadKeyWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKeyWrapper")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KeyWrapper for AeadKeyWrapper {
    fn wrapper_type(&self) -> &'static str {
        "aead"
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<WrappedBlob, SealError> {
        let nonce = self
            .nonce_guard
            .next()
            .map_err(|e| SealError::WrapperFailure {
                wrapper: "aead".to_owned(),
                reason: e.to_string(),
            })?;
        let ciphertext = seal_envelope(Algorithm::Aes256Gcm, &self.key, 0, nonce, SEAL_AAD, plaintext)
            .map_err(|e| SealError::WrapperFailure {
                wrapper: "aead".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(WrappedBlob {
            key_id: self.key_id.clone(),
            ciphertext,
        })
    }

    async fn unwrap(&self, blob: &WrappedBlob) -> Result<Vec<u8>, SealError> {
        let parsed = parse_envelope(&blob.ciphertext).map_err(|e| SealError::WrapperFailure {
            wrapper: "aead".to_owned(),
            reason: e.to_string(),
        })?;
        open_envelope(&self.key, &parsed, SEAL_AAD).map_err(|e| SealError::WrapperFailure {
            wrapper: "aead".to_owned(),
            reason: e.to_string(),
        })
    }
}

// ── Seal interface ───────────────────────────────────────────────────

/// The seal: wraps and unwraps the barrier's root key.
#[async_trait::async_trait]
pub trait Seal: Send + Sync {
    fn seal_type(&self) -> SealType;

    /// Whether unsealing needs operator-submitted key shares.
    fn requires_shares(&self) -> bool;

    /// Identifier of the wrapping key, where the provider has one.
    fn key_id(&self) -> String;

    /// Wrap the root key.
    ///
    /// # Errors
    ///
    /// Provider-specific [`SealError`] values.
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Unwrap the root key.
    ///
    /// # Errors
    ///
    /// Provider-specific [`SealError`] values; for the Shamir seal, an
    /// authentication failure means the reconstructed seal key was wrong.
    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// Shamir seal: the seal key exists only while set from reconstructed
/// shares (or freshly generated at init).
pub struct ShamirSeal {
    key: RwLock<Option<EncryptionKey>>,
    nonce_guard: NonceGuard,
}

impl Default for ShamirSeal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShamirSeal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
            nonce_guard: NonceGuard::default(),
        }
    }

    /// Install the seal key (freshly generated, or reconstructed from
    /// shares).
    pub async fn set_key(&self, key: EncryptionKey) {
        *self.key.write().await = Some(key);
    }

    /// Drop the seal key from memory.
    pub async fn clear_key(&self) {
        *self.key.write().await = None;
    }
}

impl std::fmt::Debug for ShamirSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShamirSeal").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Seal for ShamirSeal {
    fn seal_type(&self) -> SealType {
        SealType::Shamir
    }

    fn requires_shares(&self) -> bool {
        true
    }

    fn key_id(&self) -> String {
        String::new()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(SealError::InvalidShares)?;
        let nonce = self.nonce_guard.next()?;
        Ok(seal_envelope(
            Algorithm::Aes256Gcm,
            key,
            0,
            nonce,
            SEAL_AAD,
            plaintext,
        )?)
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(SealError::InvalidShares)?;
        let parsed = parse_envelope(blob)?;
        open_envelope(key, &parsed, SEAL_AAD).map_err(|_| SealError::InvalidShares)
    }
}

/// External seal: delegates to a [`KeyWrapper`].
pub struct ExternalSeal {
    wrapper: Arc<dyn KeyWrapper>,
}

impl ExternalSeal {
    #[must_use]
    pub fn new(wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self { wrapper }
    }

    /// The wrapper, for installing into the barrier's seal-wrap path.
    #[must_use]
    pub fn wrapper(&self) -> Arc<dyn KeyWrapper> {
        Arc::clone(&self.wrapper)
    }
}

impl std::fmt::Debug for ExternalSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSeal")
            .field("wrapper", &self.wrapper.wrapper_type())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Seal for ExternalSeal {
    fn seal_type(&self) -> SealType {
        SealType::Kms
    }

    fn requires_shares(&self) -> bool {
        false
    }

    fn key_id(&self) -> String {
        self.wrapper.key_id()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let blob = self.wrapper.wrap(plaintext).await?;
        serde_json::to_vec(&blob).map_err(|e| SealError::WrapperFailure {
            wrapper: self.wrapper.wrapper_type().to_owned(),
            reason: format!("wrapped blob encoding failed: {e}"),
        })
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        let wrapped: WrappedBlob =
            serde_json::from_slice(blob).map_err(|e| SealError::WrapperFailure {
                wrapper: self.wrapper.wrapper_type().to_owned(),
                reason: format!("wrapped blob decoding failed: {e}"),
            })?;
        self.wrapper.unwrap(&wrapped).await
    }
}

/// Static seal: key material handed in at startup.
pub struct StaticSeal {
    inner: AeadKeyWrapper,
}

impl StaticSeal {
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            inner: AeadKeyWrapper::new(key, "static"),
        }
    }

    /// Build from raw key bytes (e.g. an env variable or key file).
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] unless exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| SealError::InvalidConfig {
            reason: format!("static seal key must be 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self::new(EncryptionKey::from_bytes(arr)))
    }
}

impl std::fmt::Debug for StaticSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSeal").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Seal for StaticSeal {
    fn seal_type(&self) -> SealType {
        SealType::Static
    }

    fn requires_shares(&self) -> bool {
        false
    }

    fn key_id(&self) -> String {
        "static".to_owned()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let blob = self.inner.wrap(plaintext).await?;
        Ok(blob.ciphertext)
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        self.inner
            .unwrap(&WrappedBlob {
                key_id: "static".to_owned(),
                ciphertext: blob.to_vec(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Shamir ───────────────────────────────────────────────────────

    #[test]
    fn split_and_combine_any_threshold_subset() {
        let secret = EncryptionKey::generate();
        let shares = split_key(secret.as_bytes(), 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        // Any 3 of 5 reconstruct.
        for combo in [[0, 1, 2], [0, 2, 4], [1, 3, 4], [2, 3, 4]] {
            let subset: Vec<Vec<u8>> = combo.iter().map(|&i| shares[i].clone()).collect();
            let recovered = combine_shares(&subset, 3).unwrap();
            assert_eq!(recovered, secret.as_bytes().to_vec());
        }
    }

    #[test]
    fn too_few_shares_do_not_reconstruct() {
        let secret = EncryptionKey::generate();
        let shares = split_key(secret.as_bytes(), 5, 3).unwrap();
        let subset = vec![shares[0].clone(), shares[1].clone()];
        match combine_shares(&subset, 3) {
            // Either recovery refuses outright or yields garbage.
            Err(_) => {}
            Ok(recovered) => assert_ne!(recovered, secret.as_bytes().to_vec()),
        }
    }

    #[test]
    fn single_share_threshold_one() {
        let secret = EncryptionKey::generate();
        let shares = split_key(secret.as_bytes(), 1, 1).unwrap();
        let recovered = combine_shares(&shares, 1).unwrap();
        assert_eq!(recovered, secret.as_bytes().to_vec());
    }

    #[test]
    fn garbage_share_rejected() {
        let err = combine_shares(&[vec![]], 1).unwrap_err();
        assert!(matches!(err, SealError::InvalidShare { .. }));
    }

    #[test]
    fn config_validation_bounds() {
        let mut config = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: 5,
            secret_threshold: 3,
            pgp_keys: Vec::new(),
            stored_shares: 0,
            nonce: String::new(),
        };
        config.validate().unwrap();

        config.secret_threshold = 6;
        assert!(config.validate().is_err());

        config.secret_shares = 0;
        assert!(config.validate().is_err());

        config.secret_shares = 5;
        config.secret_threshold = 1;
        assert!(config.validate().is_err());

        config.secret_shares = 1;
        config.secret_threshold = 1;
        config.validate().unwrap();
    }

    // ── Seal providers ───────────────────────────────────────────────

    #[tokio::test]
    async fn shamir_seal_wrap_unwrap_roundtrip() {
        let seal = ShamirSeal::new();
        seal.set_key(EncryptionKey::generate()).await;

        let root = EncryptionKey::generate();
        let blob = seal.wrap(root.as_bytes()).await.unwrap();
        let unwrapped = seal.unwrap(&blob).await.unwrap();
        assert_eq!(unwrapped, root.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn shamir_seal_wrong_key_fails() {
        let seal = ShamirSeal::new();
        seal.set_key(EncryptionKey::generate()).await;
        let blob = seal.wrap(b"root key bytes").await.unwrap();

        seal.set_key(EncryptionKey::generate()).await;
        let err = seal.unwrap(&blob).await.unwrap_err();
        assert!(matches!(err, SealError::InvalidShares));
    }

    #[tokio::test]
    async fn shamir_seal_without_key_refuses() {
        let seal = ShamirSeal::new();
        let err = seal.wrap(b"x").await.unwrap_err();
        assert!(matches!(err, SealError::InvalidShares));
    }

    #[tokio::test]
    async fn external_seal_roundtrip() {
        let wrapper = Arc::new(AeadKeyWrapper::new(EncryptionKey::generate(), "kms-key-1"));
        let seal = ExternalSeal::new(wrapper);
        assert_eq!(seal.key_id(), "kms-key-1");
        assert!(!seal.requires_shares());

        let blob = seal.wrap(b"root key").await.unwrap();
        assert_eq!(seal.unwrap(&blob).await.unwrap(), b"root key".to_vec());
    }

    #[tokio::test]
    async fn external_seal_rejects_garbage() {
        let wrapper = Arc::new(AeadKeyWrapper::new(EncryptionKey::generate(), "kms-key-1"));
        let seal = ExternalSeal::new(wrapper);
        let err = seal.unwrap(b"not a wrapped blob").await.unwrap_err();
        assert!(matches!(err, SealError::WrapperFailure { .. }));
    }

    #[tokio::test]
    async fn static_seal_roundtrip() {
        let seal = StaticSeal::from_bytes(&[7u8; 32]).unwrap();
        let blob = seal.wrap(b"root key").await.unwrap();
        assert_eq!(seal.unwrap(&blob).await.unwrap(), b"root key".to_vec());
    }

    #[test]
    fn static_seal_wrong_length_rejected() {
        let err = StaticSeal::from_bytes(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SealError::InvalidConfig { .. }));
    }
}
