//! Wrapping key for private Web Push keys, kept in the OS keyring.

use base64::{engine::general_purpose::STANDARD, Engine};
use keyring::Entry;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use upc_core::{KeyError, WrappingKeySource};
use zeroize::Zeroizing;

const SERVICE: &str = "upc-connector";

/// Reads the wrapping key from the keyring, creating it on first use. Cached after the
/// first successful read.
pub struct KeyringWrappingKey {
    user: String,
    cached: Mutex<Option<Zeroizing<[u8; 32]>>>,
}

impl KeyringWrappingKey {
    /// One entry per application id.
    pub fn new(application: &str) -> Self {
        Self {
            user: application.to_string(),
            cached: Mutex::new(None),
        }
    }

    fn entry(&self) -> Result<Entry, KeyError> {
        Entry::new(SERVICE, &self.user).map_err(|e| KeyError::WrappingKey(e.to_string()))
    }

    fn fetch_or_create(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => decode_key(&Zeroizing::new(encoded)),
            Err(keyring::Error::NoEntry) => {
                let key = fresh_key();
                let encoded = Zeroizing::new(STANDARD.encode(&key[..]));
                entry
                    .set_password(&encoded)
                    .map_err(|e| KeyError::WrappingKey(e.to_string()))?;
                log::info!("created wrapping key in keyring for {}", self.user);
                Ok(key)
            }
            Err(e) => Err(KeyError::WrappingKey(e.to_string())),
        }
    }
}

impl WrappingKeySource for KeyringWrappingKey {
    fn wrapping_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let mut cached = self.cached.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }
        let key = self.fetch_or_create()?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

fn fresh_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

fn decode_key(encoded: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| KeyError::WrappingKey("keyring entry is not base64".into()))?,
    );
    let mut key = Zeroizing::new([0u8; 32]);
    if bytes.len() != key.len() {
        return Err(KeyError::WrappingKey("keyring entry has wrong length".into()));
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}
