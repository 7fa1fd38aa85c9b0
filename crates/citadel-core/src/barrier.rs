//! The encryption barrier.
//!
//! The barrier presents the same ordered key-value interface as the
//! physical store, but every value is encrypted under the active keyring
//! data key before it reaches storage and decrypted on the way back. The
//! storage layer only ever sees ciphertext envelopes.
//!
//! The keyring itself is persisted at [`KEYRING_PATH`], encrypted under the
//! root key with envelope term 0. Unsealing is exactly: obtain the root key
//! from the seal, decrypt the keyring, hold it in memory. Sealing drops the
//! keyring; the zeroize-on-drop key types clear the material.
//!
//! Entries flagged `seal_wrap` additionally round-trip through the seal's
//! key wrapper, so their plaintext is never protected by the keyring alone.

use std::sync::Arc;

use citadel_storage::{Entry, StorageBackend};
use tokio::sync::RwLock;
use tracing::info;

use crate::crypto::{
    open_envelope, parse_envelope, seal_envelope, EncryptionKey, NonceGuard,
};
use crate::error::BarrierError;
use crate::keyring::Keyring;
use crate::seal::{KeyWrapper, WrappedBlob};

/// Reserved storage key for the encrypted keyring.
pub const KEYRING_PATH: &str = "core/keyring";

/// Envelope term reserved for the root key (keyring encryption).
const ROOT_KEY_TERM: u32 = 0;

/// The encryption barrier wrapping a storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    keyring: RwLock<Option<Keyring>>,
    nonce_guard: NonceGuard,
    /// Wrapper used for seal-wrapped entries, installed by the core once
    /// the seal is constructed.
    seal_wrapper: RwLock<Option<Arc<dyn KeyWrapper>>>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

impl Barrier {
    /// Create a new sealed barrier over the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            keyring: RwLock::new(None),
            nonce_guard: NonceGuard::default(),
            seal_wrapper: RwLock::new(None),
        }
    }

    /// Install the key wrapper used for seal-wrapped entries.
    pub async fn set_seal_wrapper(&self, wrapper: Option<Arc<dyn KeyWrapper>>) {
        *self.seal_wrapper.write().await = wrapper;
    }

    /// Whether a keyring has ever been persisted.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] on backend failure.
    pub async fn initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.storage.get(KEYRING_PATH).await?.is_some())
    }

    /// Create and persist a fresh keyring under the given root key.
    ///
    /// The barrier is left unsealed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring exists.
    /// - [`BarrierError::Storage`] on backend failure.
    pub async fn initialize(&self, root_key: EncryptionKey) -> Result<(), BarrierError> {
        if self.initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let keyring = Keyring::new(root_key);
        self.persist_keyring(&keyring).await?;
        *self.keyring.write().await = Some(keyring);

        info!("barrier initialized");
        Ok(())
    }

    /// Decrypt the persisted keyring with the root key and unseal.
    ///
    /// Unsealing an already-unsealed barrier is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if no keyring exists.
    /// - [`BarrierError::CiphertextCorrupt`] if the root key is wrong or
    ///   the stored keyring was tampered with.
    pub async fn unseal(&self, root_key: EncryptionKey) -> Result<(), BarrierError> {
        {
            let guard = self.keyring.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let raw = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;

        let parsed = parse_envelope(&raw)?;
        let serialized = open_envelope(&root_key, &parsed, KEYRING_PATH.as_bytes()).map_err(
            |_| BarrierError::CiphertextCorrupt {
                key: KEYRING_PATH.to_owned(),
            },
        )?;

        let keyring = Keyring::deserialize(root_key, &serialized)?;
        *self.keyring.write().await = Some(keyring);

        info!("barrier unsealed");
        Ok(())
    }

    /// Drop the keyring, sealing the barrier. Idempotent.
    pub async fn seal(&self) {
        let mut guard = self.keyring.write().await;
        if guard.take().is_some() {
            info!("barrier sealed");
        }
    }

    /// Whether the barrier currently holds a keyring.
    pub async fn is_unsealed(&self) -> bool {
        self.keyring.read().await.is_some()
    }

    /// The active keyring term.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn active_term(&self) -> Result<u32, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(keyring.active_term())
    }

    /// All keyring terms, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn keyring_terms(&self) -> Result<Vec<u32>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(keyring.terms())
    }

    /// Append a new data key term and persist the keyring.
    ///
    /// Returns the new active term. Old terms remain so historical
    /// ciphertexts stay readable.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed, or storage errors from
    /// persisting the rotated keyring.
    pub async fn rotate(&self) -> Result<u32, BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        let term = keyring.rotate();
        self.persist_keyring(keyring).await?;
        info!(term, "barrier keyring rotated");
        Ok(term)
    }

    /// Re-encrypt the keyring under a new root key and persist it.
    ///
    /// Used by the rekey-root ceremony. Data keys are unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn rewrap_keyring(&self, new_root: EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        keyring.set_root_key(new_root);
        self.persist_keyring(keyring).await?;
        info!("barrier keyring re-encrypted under new root key");
        Ok(())
    }

    async fn persist_keyring(&self, keyring: &Keyring) -> Result<(), BarrierError> {
        let serialized = keyring.serialize()?;
        let nonce = self.nonce_guard.next().map_err(|_| BarrierError::NonceReuse)?;
        let envelope = seal_envelope(
            keyring.active_algorithm(),
            keyring.root_key(),
            ROOT_KEY_TERM,
            nonce,
            KEYRING_PATH.as_bytes(),
            &serialized,
        )?;
        self.storage.put(KEYRING_PATH, &envelope).await?;
        Ok(())
    }

    // ── Encrypted operations ─────────────────────────────────────────

    /// Encrypt and store a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] when sealed.
    /// - [`BarrierError::NonceReuse`] if the nonce source repeats (fatal).
    /// - [`BarrierError::Storage`] on backend failure.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let envelope = self.encrypt_active(key, value).await?;
        self.storage.put(key, &envelope).await?;
        Ok(())
    }

    /// Fetch and decrypt a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] when sealed.
    /// - [`BarrierError::UnknownTerm`] if the envelope's term is not held.
    /// - [`BarrierError::CiphertextCorrupt`] on AEAD failure.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let Some(raw) = self.storage.get(key).await? else {
            // Still enforce the seal gate for missing keys.
            if !self.is_unsealed().await {
                return Err(BarrierError::Sealed);
            }
            return Ok(None);
        };
        let plaintext = self.decrypt_blob(key, &raw).await?;
        Ok(Some(plaintext))
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        if !self.is_unsealed().await {
            return Err(BarrierError::Sealed);
        }
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys under a prefix. Keys are cleartext; only values are
    /// encrypted, which is what makes prefix listing possible at all.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        if !self.is_unsealed().await {
            return Err(BarrierError::Sealed);
        }
        Ok(self.storage.list(prefix).await?)
    }

    /// Paged folder listing under a prefix (relative keys).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, BarrierError> {
        if !self.is_unsealed().await {
            return Err(BarrierError::Sealed);
        }
        Ok(self.storage.list_page(prefix, after, limit).await?)
    }

    /// Whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        if !self.is_unsealed().await {
            return Err(BarrierError::Sealed);
        }
        Ok(self.storage.exists(key).await?)
    }

    /// Store an entry, honoring its seal-wrap flag.
    ///
    /// # Errors
    ///
    /// As [`Barrier::put`]; additionally fails if seal wrapping was
    /// requested but no wrapper is installed.
    pub async fn put_entry(&self, entry: &Entry) -> Result<(), BarrierError> {
        if !entry.seal_wrap {
            return self.put(&entry.key, &entry.value).await;
        }

        let envelope = self.encrypt_active(&entry.key, &entry.value).await?;
        let wrapper_guard = self.seal_wrapper.read().await;
        let wrapper = wrapper_guard
            .as_ref()
            .ok_or_else(|| BarrierError::Serialization {
                reason: "seal wrapping requested but no wrapper installed".to_owned(),
            })?;
        let wrapped = wrapper
            .wrap(&envelope)
            .await
            .map_err(|e| BarrierError::Serialization {
                reason: format!("seal wrap failed: {e}"),
            })?;
        let blob = serde_json::to_vec(&wrapped).map_err(|e| BarrierError::Serialization {
            reason: format!("seal-wrapped blob encoding failed: {e}"),
        })?;
        self.storage.put(&entry.key, &blob).await?;
        Ok(())
    }

    /// Fetch an entry stored with [`Barrier::put_entry`] and `seal_wrap`.
    ///
    /// # Errors
    ///
    /// As [`Barrier::get`]; additionally fails if no wrapper is installed.
    pub async fn get_seal_wrapped(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        if !self.is_unsealed().await {
            return Err(BarrierError::Sealed);
        }
        let Some(raw) = self.storage.get(key).await? else {
            return Ok(None);
        };

        let wrapped: WrappedBlob =
            serde_json::from_slice(&raw).map_err(|e| BarrierError::Serialization {
                reason: format!("seal-wrapped blob decoding failed: {e}"),
            })?;
        let wrapper_guard = self.seal_wrapper.read().await;
        let wrapper = wrapper_guard
            .as_ref()
            .ok_or_else(|| BarrierError::Serialization {
                reason: "seal-wrapped entry but no wrapper installed".to_owned(),
            })?;
        let envelope = wrapper
            .unwrap(&wrapped)
            .await
            .map_err(|_| BarrierError::CiphertextCorrupt {
                key: key.to_owned(),
            })?;
        let plaintext = self.decrypt_blob(key, &envelope).await?;
        Ok(Some(plaintext))
    }

    // ── Tracked blobs (batch tokens) ─────────────────────────────────

    /// Encrypt an out-of-band blob under the active term, bound to a
    /// context string instead of a storage key. Used for batch tokens.
    ///
    /// # Errors
    ///
    /// As [`Barrier::put`].
    pub async fn encrypt_tracked(
        &self,
        context: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, BarrierError> {
        self.encrypt_active(context, plaintext).await
    }

    /// Decrypt a blob produced by [`Barrier::encrypt_tracked`].
    ///
    /// # Errors
    ///
    /// As [`Barrier::get`].
    pub async fn decrypt_tracked(
        &self,
        context: &str,
        blob: &[u8],
    ) -> Result<Vec<u8>, BarrierError> {
        self.decrypt_blob(context, blob).await
    }

    // ── Raw physical access ──────────────────────────────────────────

    /// Write raw bytes without encryption.
    ///
    /// Only for the reserved cleartext records (seal configuration, wrapped
    /// root key) that must be readable before unseal.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] on backend failure.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.storage.put(key, value).await?;
        Ok(())
    }

    /// Read raw bytes without decryption. See [`Barrier::put_raw`].
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] on backend failure.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.storage.get(key).await?)
    }

    /// Delete a raw key. See [`Barrier::put_raw`].
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] on backend failure.
    pub async fn delete_raw(&self, key: &str) -> Result<(), BarrierError> {
        self.storage.delete(key).await?;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn encrypt_active(&self, aad: &str, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let data_key = keyring.active_key()?;
        let nonce = self.nonce_guard.next().map_err(|_| BarrierError::NonceReuse)?;
        let envelope = seal_envelope(
            keyring.active_algorithm(),
            data_key.key(),
            data_key.term,
            nonce,
            aad.as_bytes(),
            plaintext,
        )?;
        Ok(envelope)
    }

    async fn decrypt_blob(&self, aad: &str, blob: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let parsed = parse_envelope(blob)?;
        let data_key =
            keyring
                .key_for_term(parsed.term)
                .map_err(|_| BarrierError::UnknownTerm {
                    key: aad.to_owned(),
                    term: parsed.term,
                })?;
        open_envelope(data_key.key(), &parsed, aad.as_bytes()).map_err(|_| {
            BarrierError::CiphertextCorrupt {
                key: aad.to_owned(),
            }
        })
    }
}

/// A prefix-scoped view over the barrier, handed to engines so each mount
/// only sees its own `logical/<uuid>/` namespace.
#[derive(Clone)]
pub struct BarrierView {
    barrier: Arc<Barrier>,
    prefix: String,
    /// When set, values round-trip through the seal's key wrapper too.
    seal_wrap: bool,
}

impl std::fmt::Debug for BarrierView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierView")
            .field("prefix", &self.prefix)
            .field("seal_wrap", &self.seal_wrap)
            .finish_non_exhaustive()
    }
}

impl BarrierView {
    /// Scope the barrier to `prefix` (must end with `/`).
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, prefix: impl Into<String>) -> Self {
        Self {
            barrier,
            prefix: prefix.into(),
            seal_wrap: false,
        }
    }

    /// A view whose values are additionally seal-wrapped.
    #[must_use]
    pub fn with_seal_wrap(mut self, seal_wrap: bool) -> Self {
        self.seal_wrap = seal_wrap;
        self
    }

    /// The view's key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// See [`Barrier::get`].
    ///
    /// # Errors
    ///
    /// As [`Barrier::get`].
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        if self.seal_wrap {
            return self.barrier.get_seal_wrapped(&self.full_key(key)).await;
        }
        self.barrier.get(&self.full_key(key)).await
    }

    /// See [`Barrier::put`].
    ///
    /// # Errors
    ///
    /// As [`Barrier::put`].
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let full = self.full_key(key);
        if self.seal_wrap {
            return self
                .barrier
                .put_entry(&Entry::seal_wrapped(full, value.to_vec()))
                .await;
        }
        self.barrier.put(&full, value).await
    }

    /// See [`Barrier::delete`].
    ///
    /// # Errors
    ///
    /// As [`Barrier::delete`].
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.full_key(key)).await
    }

    /// List keys under the view, relative to its prefix.
    ///
    /// # Errors
    ///
    /// As [`Barrier::list`].
    pub async fn list(&self, key_prefix: &str) -> Result<Vec<String>, BarrierError> {
        let full = self.full_key(key_prefix);
        let keys = self.barrier.list(&full).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(String::from))
            .collect())
    }

    /// Paged folder listing relative to the view.
    ///
    /// # Errors
    ///
    /// As [`Barrier::list_page`].
    pub async fn list_page(
        &self,
        key_prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, BarrierError> {
        self.barrier
            .list_page(&self.full_key(key_prefix), after, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citadel_storage::MemoryBackend;

    fn make_barrier() -> (Arc<MemoryBackend>, Barrier) {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(Arc::clone(&storage) as Arc<dyn StorageBackend>);
        (storage, barrier)
    }

    async fn unsealed_barrier() -> (EncryptionKey, Barrier) {
        let (_, barrier) = make_barrier();
        let root = EncryptionKey::generate();
        barrier.initialize(root.clone()).await.unwrap();
        (root, barrier)
    }

    // ── Seal gate ────────────────────────────────────────────────────

    #[tokio::test]
    async fn sealed_barrier_rejects_operations() {
        let (_, barrier) = make_barrier();
        assert!(matches!(
            barrier.get("k").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.put("k", b"v").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.delete("k").await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.list("p/").await,
            Err(BarrierError::Sealed)
        ));
    }

    #[tokio::test]
    async fn initialize_then_roundtrip() {
        let (_, barrier) = unsealed_barrier().await;
        barrier.put("sys/test", b"hello world").await.unwrap();
        let val = barrier.get("sys/test").await.unwrap();
        assert_eq!(val, Some(b"hello world".to_vec()));
    }

    #[tokio::test]
    async fn initialize_twice_rejected() {
        let (root, barrier) = unsealed_barrier().await;
        let err = barrier.initialize(root).await.unwrap_err();
        assert!(matches!(err, BarrierError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn values_on_disk_are_ciphertext() {
        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        barrier.put("secret/x", b"plaintext-value").await.unwrap();

        let raw = storage.get("secret/x").await.unwrap().unwrap();
        assert_ne!(raw, b"plaintext-value".to_vec());
        // Envelope header: version byte then the active term.
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[1..5], &1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn seal_then_unseal_preserves_data() {
        let (root, barrier) = unsealed_barrier().await;
        barrier.put("k", b"persistent").await.unwrap();

        barrier.seal().await;
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));

        barrier.unseal(root).await.unwrap();
        assert_eq!(barrier.get("k").await.unwrap(), Some(b"persistent".to_vec()));
    }

    #[tokio::test]
    async fn unseal_with_wrong_key_fails() {
        let (_, barrier) = unsealed_barrier().await;
        barrier.seal().await;

        let err = barrier.unseal(EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::CiphertextCorrupt { .. }));
        assert!(!barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn unseal_uninitialized_fails() {
        let (_, barrier) = make_barrier();
        let err = barrier.unseal(EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::NotInitialized));
    }

    #[tokio::test]
    async fn unseal_when_unsealed_is_noop() {
        let (root, barrier) = unsealed_barrier().await;
        barrier.unseal(root).await.unwrap();
        assert!(barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let (_, barrier) = unsealed_barrier().await;
        barrier.put("k", b"v").await.unwrap();
        barrier.delete("k").await.unwrap();
        assert_eq!(barrier.get("k").await.unwrap(), None);
    }

    // ── Rotation ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn rotation_keeps_old_ciphertexts_readable() {
        let (root, barrier) = unsealed_barrier().await;
        barrier.put("old", b"term-1 data").await.unwrap();

        let term = barrier.rotate().await.unwrap();
        assert_eq!(term, 2);
        barrier.put("new", b"term-2 data").await.unwrap();

        // Both decrypt, across a seal/unseal cycle.
        barrier.seal().await;
        barrier.unseal(root).await.unwrap();
        assert_eq!(barrier.get("old").await.unwrap(), Some(b"term-1 data".to_vec()));
        assert_eq!(barrier.get("new").await.unwrap(), Some(b"term-2 data".to_vec()));
        assert_eq!(barrier.keyring_terms().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn new_writes_use_the_rotated_term() {
        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        barrier.rotate().await.unwrap();
        barrier.put("k", b"v").await.unwrap();

        let raw = storage.get("k").await.unwrap().unwrap();
        assert_eq!(&raw[1..5], &2u32.to_be_bytes());
    }

    #[tokio::test]
    async fn tampered_value_reports_corrupt() {
        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        barrier.put("k", b"v").await.unwrap();

        let mut raw = storage.get("k").await.unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        storage.put("k", &raw).await.unwrap();

        let err = barrier.get("k").await.unwrap_err();
        assert!(matches!(err, BarrierError::CiphertextCorrupt { .. }));
    }

    #[tokio::test]
    async fn unknown_term_reported() {
        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        barrier.put("k", b"v").await.unwrap();

        let mut raw = storage.get("k").await.unwrap().unwrap();
        // Claim a term the keyring does not hold.
        raw[1..5].copy_from_slice(&42u32.to_be_bytes());
        storage.put("k", &raw).await.unwrap();

        let err = barrier.get("k").await.unwrap_err();
        assert!(matches!(err, BarrierError::UnknownTerm { term: 42, .. }));
    }

    #[tokio::test]
    async fn cut_and_paste_across_keys_fails() {
        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        barrier.put("path/a", b"value-a").await.unwrap();

        // Move a's ciphertext under b — AAD binding must reject it.
        let raw = storage.get("path/a").await.unwrap().unwrap();
        storage.put("path/b", &raw).await.unwrap();

        let err = barrier.get("path/b").await.unwrap_err();
        assert!(matches!(err, BarrierError::CiphertextCorrupt { .. }));
    }

    // ── Tracked blobs ────────────────────────────────────────────────

    #[tokio::test]
    async fn tracked_blob_roundtrip() {
        let (_, barrier) = unsealed_barrier().await;
        let blob = barrier
            .encrypt_tracked("auth/token/batch", b"payload")
            .await
            .unwrap();
        let plain = barrier
            .decrypt_tracked("auth/token/batch", &blob)
            .await
            .unwrap();
        assert_eq!(plain, b"payload");
    }

    #[tokio::test]
    async fn tracked_blob_survives_rotation() {
        let (_, barrier) = unsealed_barrier().await;
        let blob = barrier
            .encrypt_tracked("auth/token/batch", b"payload")
            .await
            .unwrap();
        barrier.rotate().await.unwrap();
        let plain = barrier
            .decrypt_tracked("auth/token/batch", &blob)
            .await
            .unwrap();
        assert_eq!(plain, b"payload");
    }

    // ── Views ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn view_scopes_keys_and_listing() {
        let (_, barrier) = unsealed_barrier().await;
        let barrier = Arc::new(barrier);
        let view = BarrierView::new(Arc::clone(&barrier), "logical/abc/");

        view.put("data/x", b"1").await.unwrap();
        view.put("data/y", b"2").await.unwrap();

        assert_eq!(view.get("data/x").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            view.list("data/").await.unwrap(),
            vec!["data/x", "data/y"]
        );
        // The underlying keys are namespaced.
        assert_eq!(
            barrier.get("logical/abc/data/x").await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn seal_wrapped_entries_double_wrap() {
        use crate::seal::{AeadKeyWrapper, KeyWrapper};

        let (storage, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        let wrapper = Arc::new(AeadKeyWrapper::new(EncryptionKey::generate(), "hsm-1"));
        barrier
            .set_seal_wrapper(Some(Arc::clone(&wrapper) as Arc<dyn KeyWrapper>))
            .await;

        let entry = Entry::seal_wrapped("logical/x/secret", b"double-wrapped".to_vec());
        barrier.put_entry(&entry).await.unwrap();

        // On disk: a wrapped blob naming the provider key, not a barrier
        // envelope.
        let raw = storage.get("logical/x/secret").await.unwrap().unwrap();
        let blob: WrappedBlob = serde_json::from_slice(&raw).unwrap();
        assert_eq!(blob.key_id, "hsm-1");

        let plain = barrier
            .get_seal_wrapped("logical/x/secret")
            .await
            .unwrap();
        assert_eq!(plain, Some(b"double-wrapped".to_vec()));
    }

    #[tokio::test]
    async fn plain_entry_skips_the_wrapper() {
        let (_, barrier) = make_barrier();
        barrier
            .initialize(EncryptionKey::generate())
            .await
            .unwrap();
        let entry = Entry::new("logical/x/plain", b"single-wrapped".to_vec());
        barrier.put_entry(&entry).await.unwrap();
        assert_eq!(
            barrier.get("logical/x/plain").await.unwrap(),
            Some(b"single-wrapped".to_vec())
        );
    }

    #[tokio::test]
    async fn raw_access_bypasses_encryption() {
        let (_, barrier) = make_barrier();
        barrier.put_raw("core/seal-config", b"cleartext").await.unwrap();
        assert_eq!(
            barrier.get_raw("core/seal-config").await.unwrap(),
            Some(b"cleartext".to_vec())
        );
    }
}
