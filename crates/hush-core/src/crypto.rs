//! Crypto collaborators used during decryption.
//!
//! The engine treats the primitives as opaque: it only needs a symmetric
//! decrypt, an asymmetric unwrap of a feed key, and the homomorphic tally
//! decrypt for reactions. [`XChaChaCipher`] is the reference [`FeedCipher`]:
//!
//! ```text
//! payload     = nonce (24) || ciphertext+tag
//! wrapped key = ephemeral_pubkey (32) || nonce (24) || encrypted_key (32 + 16 tag)
//! ```
//!
//! The wrapping key is HKDF-SHA256 over the X25519 shared secret.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// Domain separation label for feed key wrapping
const WRAP_LABEL: &[u8] = b"hush-feed-key-v1";

const PUBKEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const WRAPPED_KEY_SIZE: usize = PUBKEY_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Symmetric payload decryption and asymmetric feed-key unwrapping.
pub trait FeedCipher: Send + Sync {
    /// Decrypt a symmetric payload with a feed or group key.
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Recover a symmetric key wrapped for the holder of `private_key`.
    fn unwrap_key(&self, wrapped: &[u8], private_key: &[u8]) -> Result<Vec<u8>>;
}

/// Homomorphic reaction-tally decryption.
///
/// Returns one count per emoji slot of the tally.
pub trait TallyDecryptor: Send + Sync {
    fn decrypt_tally(&self, c1: &[u8], c2: &[u8], key: &[u8]) -> Result<Vec<u32>>;
}

/// XChaCha20-Poly1305 payloads with X25519 key wrapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipher;

impl XChaChaCipher {
    /// Generate a random 32-byte symmetric key.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Generate an X25519 keypair as (private, public).
    pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
        let private = Self::generate_key();
        let public = PublicKey::from(&StaticSecret::from(private));
        (private, public.to_bytes())
    }

    /// Encrypt `plaintext` under `key`, producing `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let key = to_key(key)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(&key.into());
        let sealed = cipher
            .encrypt(&nonce.into(), plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Wrap a symmetric key for the owner of `recipient_public`.
    pub fn wrap_key(&self, key: &[u8], recipient_public: &[u8; 32]) -> Result<Vec<u8>> {
        let key = to_key(key)?;
        let mut rng = rand::thread_rng();

        let mut ephemeral_bytes = [0u8; 32];
        rng.fill_bytes(&mut ephemeral_bytes);
        let ephemeral_secret = StaticSecret::from(ephemeral_bytes);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient_public));
        let wrapping_key = derive_wrapping_key(shared.as_bytes())?;

        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new(&wrapping_key.into());
        let encrypted = cipher
            .encrypt(&nonce.into(), key.as_slice())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }
}

impl FeedCipher for XChaChaCipher {
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption("payload too short".to_string()));
        }
        let key = to_key(key)?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce
            .try_into()
            .map_err(|_| Error::Decryption("bad nonce".to_string()))?;

        XChaCha20Poly1305::new(&key.into())
            .decrypt(&nonce.into(), sealed)
            .map_err(|e| Error::Decryption(e.to_string()))
    }

    fn unwrap_key(&self, wrapped: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(Error::KeyUnwrap(format!(
                "wrapped key must be {WRAPPED_KEY_SIZE} bytes, got {}",
                wrapped.len()
            )));
        }
        let private_key = to_key(private_key)?;

        let ephemeral: [u8; PUBKEY_SIZE] = wrapped[..PUBKEY_SIZE]
            .try_into()
            .map_err(|_| Error::KeyUnwrap("bad ephemeral key".to_string()))?;
        let nonce: [u8; NONCE_SIZE] = wrapped[PUBKEY_SIZE..PUBKEY_SIZE + NONCE_SIZE]
            .try_into()
            .map_err(|_| Error::KeyUnwrap("bad nonce".to_string()))?;
        let encrypted = &wrapped[PUBKEY_SIZE + NONCE_SIZE..];

        let shared = StaticSecret::from(private_key).diffie_hellman(&PublicKey::from(ephemeral));
        let wrapping_key = derive_wrapping_key(shared.as_bytes())?;

        let key = XChaCha20Poly1305::new(&wrapping_key.into())
            .decrypt(&nonce.into(), encrypted)
            .map_err(|e| Error::KeyUnwrap(e.to_string()))?;
        if key.len() != KEY_SIZE {
            return Err(Error::KeyUnwrap("unwrapped key has wrong length".to_string()));
        }
        Ok(key)
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", bytes.len())))
}

fn derive_wrapping_key(shared_secret: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut out = [0u8; KEY_SIZE];
    hk.expand(WRAP_LABEL, &mut out)
        .map_err(|e| Error::KeyUnwrap(e.to_string()))?;
    Ok(out)
}
