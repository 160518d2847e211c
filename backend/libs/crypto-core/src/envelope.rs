/// Envelope sealing for payloads held by the server.
///
/// A sealed payload is encoded as four hex fields joined by `:`
///
/// ```text
/// salt(16 bytes) : nonce(12 bytes) : tag(16 bytes) : ciphertext
/// ```
///
/// The AES-256-GCM key for one payload is HKDF-SHA256(ring key, salt), so two
/// payloads never share a (key, nonce) pair even under the same ring key.
/// Opening with the wrong ring key fails tag verification; it never yields
/// garbage plaintext.
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const HKDF_INFO: &[u8] = b"chat-fabric/envelope/v1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

/// Parsed four-part envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            hex::encode(self.salt),
            hex::encode(self.nonce),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }

    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let mut parts = encoded.split(':');
        let (Some(salt), Some(nonce), Some(tag), Some(ciphertext), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CryptoError::Malformed("expected four ':'-separated parts"));
        };

        Ok(Self {
            salt: decode_fixed::<SALT_LEN>(salt, "salt")?,
            nonce: decode_fixed::<NONCE_LEN>(nonce, "nonce")?,
            tag: decode_fixed::<TAG_LEN>(tag, "tag")?,
            ciphertext: hex::decode(ciphertext)
                .map_err(|_| CryptoError::Malformed("ciphertext is not hex"))?,
        })
    }
}

fn decode_fixed<const N: usize>(part: &str, what: &'static str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(part).map_err(|_| CryptoError::Malformed(what))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::Malformed(what))
}

/// Format detection: true when `value` has the exact envelope shape.
///
/// Callers must check this before attempting [`open`], otherwise plaintext
/// would be mistaken for a failed decryption.
pub fn looks_like_envelope(value: &str) -> bool {
    Envelope::parse(value).is_ok()
}

/// Fresh random 32-byte ring key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn cipher_for(key: &[u8], salt: &[u8; SALT_LEN]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), key);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::Encryption)?;
    Aes256Gcm::new_from_slice(&okm).map_err(|_| CryptoError::InvalidKeyLength)
}

pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let cipher = cipher_for(key, &salt)?;
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    // aes-gcm appends the tag to the ciphertext
    let tag_bytes = ciphertext.split_off(ciphertext.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(Envelope {
        salt,
        nonce,
        tag,
        ciphertext,
    })
}

pub fn open(key: &[u8], envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key, &envelope.salt)?;
    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.tag);

    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), sealed.as_slice())
        .map_err(|_| CryptoError::Decryption)
}
