//! Web Push crypto: P-256 key sets, VAPID format check, RFC 8291 payload decryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

/// Auth secret length (RFC 8291 §3.2).
pub const AUTH_SECRET_LEN: usize = 16;
/// Uncompressed SEC1 P-256 point: 0x04 || x || y.
pub const PUBLIC_KEY_LEN: usize = 65;
/// Base64url (no padding) length of an uncompressed P-256 point.
pub const VAPID_ENCODED_LEN: usize = 87;

const SALT_LEN: usize = 16;
const HEADER_LEN: usize = SALT_LEN + 4 + 1;
const TAG_LEN: usize = 16;
const MIN_RECORD_SIZE: u32 = 18;
const DEFAULT_RECORD_SIZE: u32 = 4096;
const LAST_RECORD_DELIMITER: u8 = 0x02;

const KEY_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

/// Public half of an instance's key set, encoded for the application server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeySet {
    /// P-256 public key, uncompressed, base64url without padding.
    pub pub_key: String,
    /// Auth secret, base64url without padding.
    pub auth: String,
}

/// Per-instance Web Push key set. The private key never leaves this type except sealed.
pub struct WebPushKeys {
    secret: SecretKey,
    auth: [u8; AUTH_SECRET_LEN],
}

impl WebPushKeys {
    /// Generate a fresh P-256 key pair and 16 random auth bytes.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let mut auth = [0u8; AUTH_SECRET_LEN];
        OsRng.fill_bytes(&mut auth);
        Self { secret, auth }
    }

    /// Rebuild from a raw 32-byte scalar and the auth secret.
    pub fn from_parts(secret: &[u8], auth: &[u8]) -> Result<Self, WebPushError> {
        let secret = SecretKey::from_slice(secret).map_err(|_| WebPushError::InvalidKey)?;
        let auth: [u8; AUTH_SECRET_LEN] =
            auth.try_into().map_err(|_| WebPushError::InvalidAuth)?;
        Ok(Self { secret, auth })
    }

    /// Raw private scalar, for sealing at rest.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    pub fn auth(&self) -> &[u8; AUTH_SECRET_LEN] {
        &self.auth
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn public_key_set(&self) -> PublicKeySet {
        PublicKeySet {
            pub_key: URL_SAFE_NO_PAD.encode(self.public_key_bytes()),
            auth: URL_SAFE_NO_PAD.encode(self.auth),
        }
    }
}

impl Drop for WebPushKeys {
    fn drop(&mut self) {
        self.auth.zeroize();
    }
}

impl std::fmt::Debug for WebPushKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebPushKeys")
            .field("public", &self.public_key_set().pub_key)
            .finish_non_exhaustive()
    }
}

fn decode_point(bytes: &[u8]) -> Result<PublicKey, WebPushError> {
    if bytes.len() != PUBLIC_KEY_LEN || bytes[0] != 0x04 {
        return Err(WebPushError::InvalidKey);
    }
    PublicKey::from_sec1_bytes(bytes).map_err(|_| WebPushError::InvalidKey)
}

/// Check that `vapid` is an 87-char base64url uncompressed P-256 point.
pub fn validate_vapid(vapid: &str) -> Result<(), WebPushError> {
    if vapid.len() != VAPID_ENCODED_LEN {
        return Err(WebPushError::InvalidVapid);
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(vapid)
        .map_err(|_| WebPushError::InvalidVapid)?;
    decode_point(&bytes)
        .map(|_| ())
        .map_err(|_| WebPushError::InvalidVapid)
}

/// RFC 8291 §3.4 key schedule. Returns (CEK, nonce) for the single record.
fn derive_content_keys(
    ecdh_secret: &[u8],
    auth: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<(Zeroizing<[u8; 16]>, [u8; 12]), WebPushError> {
    let mut key_info = Vec::with_capacity(KEY_INFO_PREFIX.len() + 2 * PUBLIC_KEY_LEN);
    key_info.extend_from_slice(KEY_INFO_PREFIX);
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(auth), ecdh_secret)
        .expand(&key_info, &mut ikm[..])
        .map_err(|_| WebPushError::KeyDerivation)?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm[..]);
    let mut cek = Zeroizing::new([0u8; 16]);
    hk.expand(CEK_INFO, &mut cek[..])
        .map_err(|_| WebPushError::KeyDerivation)?;
    let mut nonce = [0u8; 12];
    hk.expand(NONCE_INFO, &mut nonce)
        .map_err(|_| WebPushError::KeyDerivation)?;
    Ok((cek, nonce))
}

/// Decrypt an `aes128gcm` push body (RFC 8188 header, single record) for `keys`.
pub fn decrypt(keys: &WebPushKeys, body: &[u8]) -> Result<Vec<u8>, WebPushError> {
    if body.len() < HEADER_LEN {
        return Err(WebPushError::Truncated);
    }
    let salt = &body[..SALT_LEN];
    let record_size = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
    let id_len = body[20] as usize;
    if id_len != PUBLIC_KEY_LEN || record_size < MIN_RECORD_SIZE {
        return Err(WebPushError::InvalidHeader);
    }
    if body.len() < HEADER_LEN + id_len + TAG_LEN {
        return Err(WebPushError::Truncated);
    }
    let as_public = &body[HEADER_LEN..HEADER_LEN + id_len];
    let ciphertext = &body[HEADER_LEN + id_len..];
    if ciphertext.len() > record_size as usize {
        // Push payloads are a single record.
        return Err(WebPushError::InvalidHeader);
    }

    let sender = decode_point(as_public)?;
    let shared = p256::ecdh::diffie_hellman(keys.secret.to_nonzero_scalar(), sender.as_affine());
    let (cek, nonce) = derive_content_keys(
        shared.raw_secret_bytes().as_slice(),
        &keys.auth,
        &keys.public_key_bytes(),
        as_public,
        salt,
    )?;

    let cipher = Aes128Gcm::new_from_slice(&cek[..]).map_err(|_| WebPushError::KeyDerivation)?;
    let mut plain = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| WebPushError::Decrypt)?;

    let delimiter = plain
        .iter()
        .rposition(|&b| b != 0)
        .ok_or(WebPushError::Padding)?;
    if plain[delimiter] != LAST_RECORD_DELIMITER {
        return Err(WebPushError::Padding);
    }
    plain.truncate(delimiter);
    Ok(plain)
}

/// Encrypt `plaintext` for a [`PublicKeySet`], as an application server would.
pub fn encrypt(recipient: &PublicKeySet, plaintext: &[u8]) -> Result<Vec<u8>, WebPushError> {
    let ua_public = URL_SAFE_NO_PAD
        .decode(&recipient.pub_key)
        .map_err(|_| WebPushError::InvalidKey)?;
    let ua_key = decode_point(&ua_public)?;
    let auth = URL_SAFE_NO_PAD
        .decode(&recipient.auth)
        .map_err(|_| WebPushError::InvalidAuth)?;
    if auth.len() != AUTH_SECRET_LEN {
        return Err(WebPushError::InvalidAuth);
    }

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let as_public = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&ua_key);
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let (cek, nonce) = derive_content_keys(
        shared.raw_secret_bytes().as_slice(),
        &auth,
        &ua_public,
        as_public.as_bytes(),
        &salt,
    )?;
    let cipher = Aes128Gcm::new_from_slice(&cek[..]).map_err(|_| WebPushError::KeyDerivation)?;
    let mut record = Zeroizing::new(Vec::with_capacity(plaintext.len() + 1));
    record.extend_from_slice(plaintext);
    record.push(LAST_RECORD_DELIMITER);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), record.as_slice())
        .map_err(|_| WebPushError::Encrypt)?;

    let record_size = DEFAULT_RECORD_SIZE.max(ciphertext.len() as u32);
    let mut out = Vec::with_capacity(HEADER_LEN + PUBLIC_KEY_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&record_size.to_be_bytes());
    out.push(PUBLIC_KEY_LEN as u8);
    out.extend_from_slice(as_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum WebPushError {
    #[error("invalid P-256 public key")]
    InvalidKey,
    #[error("invalid auth secret")]
    InvalidAuth,
    #[error("VAPID key must be an 87-char base64url uncompressed P-256 point")]
    InvalidVapid,
    #[error("payload truncated")]
    Truncated,
    #[error("invalid aes128gcm header")]
    InvalidHeader,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid record padding")]
    Padding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_set_encoding() {
        let keys = WebPushKeys::generate();
        let set = keys.public_key_set();
        assert_eq!(set.pub_key.len(), VAPID_ENCODED_LEN);
        assert!(!set.pub_key.contains('='));
        assert_eq!(URL_SAFE_NO_PAD.decode(&set.auth).unwrap().len(), AUTH_SECRET_LEN);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keys = WebPushKeys::generate();
        let body = encrypt(&keys.public_key_set(), b"hello push").unwrap();
        assert_eq!(decrypt(&keys, &body).unwrap(), b"hello push");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let keys = WebPushKeys::generate();
        let body = encrypt(&keys.public_key_set(), b"").unwrap();
        assert!(decrypt(&keys, &body).unwrap().is_empty());
    }

    #[test]
    fn from_parts_restores_same_keys() {
        let keys = WebPushKeys::generate();
        let restored = WebPushKeys::from_parts(&keys.secret_bytes(), keys.auth()).unwrap();
        assert_eq!(restored.public_key_set(), keys.public_key_set());
        let body = encrypt(&keys.public_key_set(), b"restored").unwrap();
        assert_eq!(decrypt(&restored, &body).unwrap(), b"restored");
    }

    #[test]
    fn other_instance_keys_fail() {
        let keys = WebPushKeys::generate();
        let other = WebPushKeys::generate();
        let body = encrypt(&keys.public_key_set(), b"secret").unwrap();
        assert!(matches!(decrypt(&other, &body), Err(WebPushError::Decrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let keys = WebPushKeys::generate();
        let mut body = encrypt(&keys.public_key_set(), b"secret").unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        assert!(decrypt(&keys, &body).is_err());
    }

    #[test]
    fn short_or_garbage_body_fails() {
        let keys = WebPushKeys::generate();
        assert!(matches!(decrypt(&keys, b"short"), Err(WebPushError::Truncated)));
        assert!(decrypt(&keys, &[0u8; 200]).is_err());
    }

    #[test]
    fn vapid_accepts_uncompressed_point() {
        let keys = WebPushKeys::generate();
        assert!(validate_vapid(&keys.public_key_set().pub_key).is_ok());
    }

    #[test]
    fn vapid_rejects_malformed() {
        let keys = WebPushKeys::generate();
        let good = keys.public_key_set().pub_key;
        assert!(validate_vapid("").is_err());
        assert!(validate_vapid(&good[..86]).is_err());
        assert!(validate_vapid(&format!("{good}=")).is_err());
        assert!(validate_vapid(&"A".repeat(VAPID_ENCODED_LEN)).is_err());
        let std_alphabet = good.replace('-', "+").replace('_', "/");
        if std_alphabet != good {
            assert!(validate_vapid(&std_alphabet).is_err());
        }
    }

    #[test]
    fn from_parts_rejects_bad_auth() {
        let keys = WebPushKeys::generate();
        assert!(matches!(
            WebPushKeys::from_parts(&keys.secret_bytes(), &[0u8; 3]),
            Err(WebPushError::InvalidAuth)
        ));
    }
}
