//! Pairwise authenticated encryption for direct messages.
//!
//! Every direct-message pair shares one derived secret: an X25519
//! Diffie-Hellman agreement between one party's static secret and the other
//! party's public key, expanded through HKDF-SHA256 into a ChaCha20-Poly1305
//! key. The agreement is symmetric, so `(A_secret, B_public)` and
//! `(B_secret, A_public)` produce the same key and either party can re-open
//! the whole history with only their own secret plus the peer's public key.
//!
//! Wire form: `base64(nonce || box)` with a fresh random 12-byte nonce per
//! call.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Nonce length prepended to every boxed payload.
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

const HKDF_SALT: &[u8] = b"pairbox/direct-message-salt";
const HKDF_INFO: &[u8] = b"pairbox/direct-message/v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key material is not valid base64")]
    KeyEncoding,
    #[error("key material must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    #[error("ciphertext is not valid base64")]
    CiphertextEncoding,
    #[error("ciphertext too short to carry a nonce")]
    Truncated,
    #[error("authentication failed or ciphertext corrupt")]
    Opening,
    #[error("encryption failed")]
    Sealing,
    #[error("decrypted payload is not valid utf-8")]
    PlaintextEncoding,
}

/// Base64-encoded key pair, the at-rest and over-the-wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub public_key: String,
    pub secret_key: String,
}

/// A freshly generated X25519 identity pair. Pure value; nothing is
/// persisted until the caller stores the [`KeyMaterial`].
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial {
            public_key: STANDARD.encode(self.public.as_bytes()),
            secret_key: STANDARD.encode(self.secret.to_bytes()),
        }
    }
}

fn decode_key(b64: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut raw = STANDARD
        .decode(b64.trim())
        .map_err(|_| CryptoError::KeyEncoding)?;
    if raw.len() != KEY_LEN {
        let len = raw.len();
        raw.zeroize();
        return Err(CryptoError::KeyLength(len));
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&raw);
    raw.zeroize();
    Ok(bytes)
}

/// Derives the pair key. Only the shared secret feeds the HKDF, so the
/// derivation is direction-free.
fn derive_pair_key(
    own_secret: &StaticSecret,
    their_public: &PublicKey,
) -> Result<Key, CryptoError> {
    let shared = own_secret.diffie_hellman(their_public);
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::Sealing)?;
    let key = Key::from(okm);
    okm.zeroize();
    Ok(key)
}

/// Encrypts `plaintext` for `recipient_public_b64`, authenticated by
/// `sender_secret_b64`. Returns `base64(nonce || box)`.
pub fn encrypt(
    plaintext: &str,
    recipient_public_b64: &str,
    sender_secret_b64: &str,
) -> Result<String, CryptoError> {
    let secret = StaticSecret::from(decode_key(sender_secret_b64)?);
    let public = PublicKey::from(decode_key(recipient_public_b64)?);
    let key = derive_pair_key(&secret, &public)?;

    let cipher = ChaCha20Poly1305::new(&key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let boxed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Sealing)?;

    let mut framed = Vec::with_capacity(NONCE_LEN + boxed.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&boxed);
    Ok(STANDARD.encode(framed))
}

/// Opens `base64(nonce || box)` produced by the peer. Fails closed on
/// authentication failure, corrupt input, or bad key material.
pub fn decrypt(
    ciphertext_b64: &str,
    peer_public_b64: &str,
    own_secret_b64: &str,
) -> Result<String, CryptoError> {
    let secret = StaticSecret::from(decode_key(own_secret_b64)?);
    let public = PublicKey::from(decode_key(peer_public_b64)?);
    let key = derive_pair_key(&secret, &public)?;

    let framed = STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|_| CryptoError::CiphertextEncoding)?;
    if framed.len() <= NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, boxed) = framed.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(&key);
    let opened = cipher
        .decrypt(Nonce::from_slice(nonce), boxed)
        .map_err(|_| CryptoError::Opening)?;

    String::from_utf8(opened).map_err(|err| {
        let mut bytes = err.into_bytes();
        bytes.zeroize();
        CryptoError::PlaintextEncoding
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair() -> KeyMaterial {
        KeyPair::generate().to_material()
    }

    #[test]
    fn round_trip_recovers_plaintext() {
        let alice = pair();
        let bob = pair();

        let boxed = encrypt("hello bob", &bob.public_key, &alice.secret_key).expect("encrypt");
        let opened = decrypt(&boxed, &alice.public_key, &bob.secret_key).expect("decrypt");
        assert_eq!(opened, "hello bob");
    }

    #[test]
    fn pair_key_is_symmetric_across_directions() {
        let alice = pair();
        let bob = pair();

        // Alice encrypts for Bob; Alice can also re-open her own box using
        // only her secret and Bob's public key.
        let boxed = encrypt("history entry", &bob.public_key, &alice.secret_key).expect("encrypt");
        let opened_by_bob =
            decrypt(&boxed, &alice.public_key, &bob.secret_key).expect("bob decrypts");
        let opened_by_alice =
            decrypt(&boxed, &bob.public_key, &alice.secret_key).expect("alice re-decrypts");
        assert_eq!(opened_by_bob, "history entry");
        assert_eq!(opened_by_alice, "history entry");
    }

    #[test]
    fn fresh_nonce_per_call() {
        let alice = pair();
        let bob = pair();

        let first = encrypt("same text", &bob.public_key, &alice.secret_key).expect("encrypt");
        let second = encrypt("same text", &bob.public_key, &alice.secret_key).expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let alice = pair();
        let bob = pair();

        let boxed = encrypt("payload", &bob.public_key, &alice.secret_key).expect("encrypt");
        let mut raw = STANDARD.decode(&boxed).expect("base64");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = STANDARD.encode(raw);

        assert!(matches!(
            decrypt(&tampered, &alice.public_key, &bob.secret_key),
            Err(CryptoError::Opening)
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let alice = pair();
        let bob = pair();
        let mallory = pair();

        let boxed = encrypt("secret", &bob.public_key, &alice.secret_key).expect("encrypt");
        assert!(matches!(
            decrypt(&boxed, &alice.public_key, &mallory.secret_key),
            Err(CryptoError::Opening)
        ));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let alice = pair();
        let bob = pair();

        assert!(matches!(
            encrypt("x", "not base64!!", &alice.secret_key),
            Err(CryptoError::KeyEncoding)
        ));
        assert!(matches!(
            encrypt("x", &STANDARD.encode([0u8; 7]), &alice.secret_key),
            Err(CryptoError::KeyLength(7))
        ));
        assert!(matches!(
            decrypt("%%%", &alice.public_key, &bob.secret_key),
            Err(CryptoError::CiphertextEncoding)
        ));
        assert!(matches!(
            decrypt(&STANDARD.encode([0u8; NONCE_LEN]), &alice.public_key, &bob.secret_key),
            Err(CryptoError::Truncated)
        ));
    }

    proptest! {
        #[test]
        fn round_trip_over_arbitrary_utf8(plaintext in ".{1,512}") {
            let alice = pair();
            let bob = pair();

            let boxed = encrypt(&plaintext, &bob.public_key, &alice.secret_key).unwrap();
            let opened = decrypt(&boxed, &alice.public_key, &bob.secret_key).unwrap();
            prop_assert_eq!(opened, plaintext);
        }
    }
}
