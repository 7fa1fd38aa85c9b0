//! The barrier keyring: versioned data keys plus the root key.
//!
//! Every barrier write is encrypted under the data key of the active term.
//! Rotation appends a new term; historical terms are retained forever so old
//! ciphertexts stay decryptable. The keyring itself is serialized and
//! persisted encrypted under the root key (envelope term 0), and the root
//! key is what the seal wraps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Algorithm, EncryptionKey};
use crate::error::BarrierError;

/// One versioned data key.
pub struct DataKey {
    pub term: u32,
    pub install_time: DateTime<Utc>,
    key: EncryptionKey,
}

impl DataKey {
    #[must_use]
    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("term", &self.term)
            .field("install_time", &self.install_time)
            .finish_non_exhaustive()
    }
}

/// The in-memory keyring.
pub struct Keyring {
    root_key: EncryptionKey,
    active_term: u32,
    keys: BTreeMap<u32, DataKey>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("active_term", &self.active_term)
            .field("terms", &self.keys.len())
            .finish_non_exhaustive()
    }
}

/// Serialized form. Key bytes are raw vectors inside a blob that is only
/// ever persisted through root-key encryption.
#[derive(Serialize, Deserialize)]
struct PersistedKeyring {
    active_term: u32,
    keys: Vec<PersistedKey>,
}

#[derive(Serialize, Deserialize)]
struct PersistedKey {
    term: u32,
    install_time: DateTime<Utc>,
    key: Vec<u8>,
}

impl Keyring {
    /// Create a fresh keyring with a single data key at term 1.
    #[must_use]
    pub fn new(root_key: EncryptionKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(
            1,
            DataKey {
                term: 1,
                install_time: Utc::now(),
                key: EncryptionKey::generate(),
            },
        );
        Self {
            root_key,
            active_term: 1,
            keys,
        }
    }

    /// The key that encrypts the keyring itself.
    #[must_use]
    pub fn root_key(&self) -> &EncryptionKey {
        &self.root_key
    }

    /// Replace the root key (rekey-root). Data keys are untouched; the
    /// caller must re-persist the keyring and the wrapped root key record.
    pub fn set_root_key(&mut self, root_key: EncryptionKey) {
        self.root_key = root_key;
    }

    /// The term used for new writes.
    #[must_use]
    pub fn active_term(&self) -> u32 {
        self.active_term
    }

    /// The data key for new writes.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::UnknownTerm`] if the keyring is internally
    /// inconsistent (active term missing).
    pub fn active_key(&self) -> Result<&DataKey, BarrierError> {
        self.key_for_term(self.active_term)
    }

    /// The data key for a historical term.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::UnknownTerm`] when the term is not held.
    pub fn key_for_term(&self, term: u32) -> Result<&DataKey, BarrierError> {
        self.keys.get(&term).ok_or(BarrierError::UnknownTerm {
            key: String::new(),
            term,
        })
    }

    /// All terms held, ascending.
    #[must_use]
    pub fn terms(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Append a new data key and make it active. Returns the new term.
    #[must_use]
    pub fn rotate(&mut self) -> u32 {
        let term = self.active_term + 1;
        self.keys.insert(
            term,
            DataKey {
                term,
                install_time: Utc::now(),
                key: EncryptionKey::generate(),
            },
        );
        self.active_term = term;
        term
    }

    /// Serialize for persistence. The output must only ever be stored
    /// encrypted under the root key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Serialization`] on encoding failure.
    pub fn serialize(&self) -> Result<Vec<u8>, BarrierError> {
        let persisted = PersistedKeyring {
            active_term: self.active_term,
            keys: self
                .keys
                .values()
                .map(|k| PersistedKey {
                    term: k.term,
                    install_time: k.install_time,
                    key: k.key.as_bytes().to_vec(),
                })
                .collect(),
        };
        serde_json::to_vec(&persisted).map_err(|e| BarrierError::Serialization {
            reason: format!("keyring encoding failed: {e}"),
        })
    }

    /// Rebuild a keyring from its serialized form plus the root key that
    /// decrypted it.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Serialization`] on decoding failure or a key
    /// of the wrong length.
    pub fn deserialize(root_key: EncryptionKey, raw: &[u8]) -> Result<Self, BarrierError> {
        let persisted: PersistedKeyring =
            serde_json::from_slice(raw).map_err(|e| BarrierError::Serialization {
                reason: format!("keyring decoding failed: {e}"),
            })?;

        let mut keys = BTreeMap::new();
        for k in persisted.keys {
            let bytes: [u8; 32] =
                k.key
                    .as_slice()
                    .try_into()
                    .map_err(|_| BarrierError::Serialization {
                        reason: format!("data key for term {} is not 32 bytes", k.term),
                    })?;
            keys.insert(
                k.term,
                DataKey {
                    term: k.term,
                    install_time: k.install_time,
                    key: EncryptionKey::from_bytes(bytes),
                },
            );
        }

        if !keys.contains_key(&persisted.active_term) {
            return Err(BarrierError::Serialization {
                reason: format!("active term {} missing from keyring", persisted.active_term),
            });
        }

        Ok(Self {
            root_key,
            active_term: persisted.active_term,
            keys,
        })
    }

    /// The algorithm for new writes. Fixed per build for now; historical
    /// envelopes carry their own version byte.
    #[must_use]
    pub fn active_algorithm(&self) -> Algorithm {
        Algorithm::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keyring_starts_at_term_one() {
        let keyring = Keyring::new(EncryptionKey::generate());
        assert_eq!(keyring.active_term(), 1);
        assert_eq!(keyring.terms(), vec![1]);
        keyring.active_key().unwrap();
    }

    #[test]
    fn rotate_appends_and_retains_history() {
        let mut keyring = Keyring::new(EncryptionKey::generate());
        let t2 = keyring.rotate();
        let t3 = keyring.rotate();
        assert_eq!((t2, t3), (2, 3));
        assert_eq!(keyring.active_term(), 3);
        assert_eq!(keyring.terms(), vec![1, 2, 3]);
        // Historical keys stay resolvable.
        keyring.key_for_term(1).unwrap();
        keyring.key_for_term(2).unwrap();
    }

    #[test]
    fn unknown_term_rejected() {
        let keyring = Keyring::new(EncryptionKey::generate());
        let err = keyring.key_for_term(9).unwrap_err();
        assert!(matches!(err, BarrierError::UnknownTerm { term: 9, .. }));
    }

    #[test]
    fn serialize_deserialize_preserves_keys() {
        let root = EncryptionKey::generate();
        let mut keyring = Keyring::new(root.clone());
        keyring.rotate();

        let raw = keyring.serialize().unwrap();
        let restored = Keyring::deserialize(root, &raw).unwrap();

        assert_eq!(restored.active_term(), keyring.active_term());
        assert_eq!(restored.terms(), keyring.terms());
        for term in keyring.terms() {
            assert!(restored
                .key_for_term(term)
                .unwrap()
                .key()
                .ct_eq(keyring.key_for_term(term).unwrap().key()));
        }
    }

    #[test]
    fn corrupt_serialized_keyring_rejected() {
        let err = Keyring::deserialize(EncryptionKey::generate(), b"not json").unwrap_err();
        assert!(matches!(err, BarrierError::Serialization { .. }));
    }
}
