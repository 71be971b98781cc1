//! Per-instance Web Push key sets, persisted in the store and sealed at rest.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::store::Store;
use crate::webpush::{self, PublicKeySet, WebPushKeys};

const WRAP_NONCE_LEN: usize = 12;

/// Key lifecycle as seen by the registration engine.
pub trait KeyManager: Send + Sync {
    /// Ensure a usable key set exists for `instance`. Keeps an existing one.
    fn generate(&self, instance: &str) -> Result<(), KeyError>;
    fn public_key_set(&self, instance: &str) -> Option<PublicKeySet>;
    fn exists(&self, instance: &str) -> bool;
    /// Decrypt a push body. `None` on any failure, including missing keys.
    fn decrypt(&self, instance: &str, body: &[u8]) -> Option<Vec<u8>>;
    fn delete(&self, instance: &str);
}

/// Private scalar as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SealedKey {
    Plain { key: String },
    Wrapped { nonce: String, ciphertext: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    public_key: String,
    auth: String,
    private: SealedKey,
}

/// At-rest protection of the private scalar.
pub trait KeyProtection: Send + Sync {
    fn seal(&self, instance: &str, secret: &[u8]) -> Result<SealedKey, KeyError>;
    /// `None` when sealed by another strategy or when it does not open.
    fn open(&self, instance: &str, sealed: &SealedKey) -> Option<Zeroizing<Vec<u8>>>;
}

/// Scalar stored base64url in the clear.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainProtection;

impl KeyProtection for PlainProtection {
    fn seal(&self, _instance: &str, secret: &[u8]) -> Result<SealedKey, KeyError> {
        Ok(SealedKey::Plain {
            key: URL_SAFE_NO_PAD.encode(secret),
        })
    }

    fn open(&self, _instance: &str, sealed: &SealedKey) -> Option<Zeroizing<Vec<u8>>> {
        match sealed {
            SealedKey::Plain { key } => URL_SAFE_NO_PAD.decode(key).ok().map(Zeroizing::new),
            SealedKey::Wrapped { .. } => None,
        }
    }
}

/// Supplies the 32-byte key that wraps private scalars.
pub trait WrappingKeySource: Send + Sync {
    fn wrapping_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError>;
}

/// Random wrapping key held in memory for the life of the process.
pub struct EphemeralWrappingKey {
    key: Zeroizing<[u8; 32]>,
}

impl EphemeralWrappingKey {
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key }
    }
}

impl Default for EphemeralWrappingKey {
    fn default() -> Self {
        Self::new()
    }
}

impl WrappingKeySource for EphemeralWrappingKey {
    fn wrapping_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        Ok(self.key.clone())
    }
}

/// AES-256-GCM under a [`WrappingKeySource`]. The instance name is bound as AAD.
pub struct WrappedProtection<S> {
    source: S,
}

impl<S: WrappingKeySource> WrappedProtection<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: WrappingKeySource> KeyProtection for WrappedProtection<S> {
    fn seal(&self, instance: &str, secret: &[u8]) -> Result<SealedKey, KeyError> {
        let key = self.source.wrapping_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| KeyError::Seal)?;
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: instance.as_bytes(),
                },
            )
            .map_err(|_| KeyError::Seal)?;
        Ok(SealedKey::Wrapped {
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        })
    }

    fn open(&self, instance: &str, sealed: &SealedKey) -> Option<Zeroizing<Vec<u8>>> {
        let SealedKey::Wrapped { nonce, ciphertext } = sealed else {
            return None;
        };
        let nonce = URL_SAFE_NO_PAD.decode(nonce).ok()?;
        if nonce.len() != WRAP_NONCE_LEN {
            return None;
        }
        let ciphertext = URL_SAFE_NO_PAD.decode(ciphertext).ok()?;
        let key = match self.source.wrapping_key() {
            Ok(k) => k,
            Err(e) => {
                log::warn!("wrapping key unavailable: {}", e);
                return None;
            }
        };
        let cipher = Aes256Gcm::new_from_slice(&key[..]).ok()?;
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: instance.as_bytes(),
                },
            )
            .ok()
            .map(Zeroizing::new)
    }
}

/// [`KeyManager`] over the store's key-record family.
pub struct DefaultKeyManager {
    store: Arc<Store>,
    protection: Box<dyn KeyProtection>,
    generate_lock: Mutex<()>,
}

impl DefaultKeyManager {
    pub fn new(store: Arc<Store>, protection: impl KeyProtection + 'static) -> Self {
        Self {
            store,
            protection: Box::new(protection),
            generate_lock: Mutex::new(()),
        }
    }

    pub fn plain(store: Arc<Store>) -> Self {
        Self::new(store, PlainProtection)
    }

    pub fn wrapped<S: WrappingKeySource + 'static>(store: Arc<Store>, source: S) -> Self {
        Self::new(store, WrappedProtection::new(source))
    }

    fn record(&self, instance: &str) -> Option<KeyRecord> {
        let raw = self.store.key_record(instance)?;
        match serde_json::from_str(&raw) {
            Ok(r) => Some(r),
            Err(e) => {
                log::warn!("key record for {} unreadable: {}", instance, e);
                None
            }
        }
    }

    fn load(&self, instance: &str) -> Option<WebPushKeys> {
        let record = self.record(instance)?;
        let Some(secret) = self.protection.open(instance, &record.private) else {
            log::warn!("key record for {} does not open; treating as absent", instance);
            return None;
        };
        let auth = URL_SAFE_NO_PAD.decode(&record.auth).ok()?;
        match WebPushKeys::from_parts(&secret, &auth) {
            Ok(keys) => Some(keys),
            Err(e) => {
                log::warn!("key record for {} invalid: {}", instance, e);
                None
            }
        }
    }
}

impl KeyManager for DefaultKeyManager {
    fn generate(&self, instance: &str) -> Result<(), KeyError> {
        let _guard = self.generate_lock.lock();
        if self.load(instance).is_some() {
            return Ok(());
        }
        let keys = WebPushKeys::generate();
        let set = keys.public_key_set();
        let record = KeyRecord {
            public_key: set.pub_key,
            auth: set.auth,
            private: self.protection.seal(instance, &keys.secret_bytes())?,
        };
        self.store
            .put_key_record(instance, serde_json::to_string(&record)?);
        log::debug!("generated key set for {}", instance);
        Ok(())
    }

    fn public_key_set(&self, instance: &str) -> Option<PublicKeySet> {
        self.load(instance).map(|k| k.public_key_set())
    }

    fn exists(&self, instance: &str) -> bool {
        self.load(instance).is_some()
    }

    fn decrypt(&self, instance: &str, body: &[u8]) -> Option<Vec<u8>> {
        let keys = self.load(instance)?;
        match webpush::decrypt(&keys, body) {
            Ok(plain) => Some(plain),
            Err(e) => {
                log::debug!("decrypt for {} failed: {}", instance, e);
                None
            }
        }
    }

    fn delete(&self, instance: &str) {
        if self.store.remove_key_record(instance) {
            log::debug!("deleted key set for {}", instance);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("wrapping key unavailable: {0}")]
    WrappingKey(String),
    #[error("could not seal private key")]
    Seal,
    #[error("key record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
