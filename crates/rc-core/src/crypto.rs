//! Sealing of account secrets at rest.
//!
//! Passwords and session cookies are encrypted with ChaCha20-Poly1305 and
//! stored as hex text `nonce || ciphertext || tag`. Key material is zeroed
//! when dropped.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 256-bit key.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("encryption failed")]
    Encryption,
    /// Wrong key, tampered ciphertext or truncated input.
    #[error("decryption failed")]
    Decryption,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random key from system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded key, as written to a key file.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(
            hex::decode(text.trim()).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?,
        );
        Self::from_bytes(&raw)
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Nonce Management
// ---------------------------------------------------------------------------

/// Hands out exactly one nonce, so each key binding seals a single message.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption/Decryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let mut sealing_key = SealingKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Reverse of [`encrypt`].
pub fn decrypt(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            sealed.len()
        )));
    }

    let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
    let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Decryption)?;
    let mut opening_key = OpeningKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = body.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?;
    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// SecretBox
// ---------------------------------------------------------------------------

/// String-in, hex-out wrapper used by account stores.
#[derive(Clone, Debug)]
pub struct SecretBox {
    key: EncryptionKey,
}

impl SecretBox {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// A box with a fresh random key; secrets do not survive a restart.
    pub fn ephemeral() -> Result<Self, CryptoError> {
        Ok(Self::new(EncryptionKey::generate()?))
    }

    pub fn seal_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        encrypt(&self.key, plaintext.as_bytes()).map(hex::encode)
    }

    pub fn open_str(&self, sealed_hex: &str) -> Result<String, CryptoError> {
        let sealed =
            hex::decode(sealed_hex).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        let plain = Zeroizing::new(decrypt(&self.key, &sealed)?);
        String::from_utf8(plain.to_vec())
            .map_err(|_| CryptoError::InvalidFormat("secret is not valid UTF-8".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
