//! Crypto collaborator: the opaque engine the session drives, and the default
//! X25519 + HKDF-SHA256 + ChaCha20-Poly1305 implementation.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::integrity;
use crate::wire;

const NONCE_LEN: usize = 12;
const SESSION_KEY_INFO: &[u8] = b"connect-session-v1";
/// Length of the challenge salt.
pub const SALT_LEN: usize = 32;

/// X25519 public key (32 bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        wire::to_base64(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = wire::from_base64(s).map_err(|_| CryptoError::Key)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::Key)?;
        Ok(PublicKey(arr))
    }
}

/// X25519 keypair. The initiator uses a fresh one per session; the responder's
/// public key is the pairing key carried in the QR code.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Associated data binding a ciphertext to the step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoContext {
    Challenge,
    Transfer,
    Pull,
}

impl CryptoContext {
    fn label(self) -> &'static [u8] {
        match self {
            CryptoContext::Challenge => b"connect-challenge",
            CryptoContext::Transfer => b"connect-transfer",
            CryptoContext::Pull => b"connect-pull",
        }
    }
}

/// Cryptographic capability consumed by the session. The protocol never looks
/// inside what it encrypts or decrypts.
pub trait CryptoEngine: Send {
    /// Local public key announced in `challenge`.
    fn ephemeral_public_key(&self) -> PublicKey;

    /// Derive and install the session key from the peer's key and the salt.
    fn agree(&mut self, peer_key: &PublicKey, salt: &[u8]) -> Result<(), CryptoError>;

    fn encrypt(&self, plaintext: &[u8], context: CryptoContext) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], context: CryptoContext) -> Result<Vec<u8>, CryptoError>;

    /// Answering side of the challenge: agree on a key, return the salt encrypted under it.
    fn derive_challenge_response(
        &mut self,
        ephemeral_key: &PublicKey,
        salt: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.agree(ephemeral_key, salt)?;
        self.encrypt(salt, CryptoContext::Challenge)
    }

    fn digest(&self, bytes: &[u8]) -> integrity::Hash {
        integrity::hash_blob(bytes)
    }
}

/// Default engine: ECDH over X25519, HKDF-SHA256 keyed by the challenge salt,
/// ChaCha20-Poly1305 with a random nonce prefixed to every ciphertext.
pub struct PairingCrypto {
    keypair: Keypair,
    session_key: Option<[u8; 32]>,
}

impl PairingCrypto {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            session_key: None,
        }
    }

    /// Fresh ephemeral keypair, as the initiator uses.
    pub fn ephemeral() -> Self {
        Self::new(Keypair::generate())
    }

    fn key(&self) -> Result<&[u8; 32], CryptoError> {
        self.session_key.as_ref().ok_or(CryptoError::NoSessionKey)
    }
}

impl CryptoEngine for PairingCrypto {
    fn ephemeral_public_key(&self) -> PublicKey {
        *self.keypair.public_key()
    }

    fn agree(&mut self, peer_key: &PublicKey, salt: &[u8]) -> Result<(), CryptoError> {
        let shared = self.keypair.shared_secret(peer_key);
        self.session_key = Some(derive_session_key(&shared, salt)?);
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8], context: CryptoContext) -> Result<Vec<u8>, CryptoError> {
        encrypt_wire(self.key()?, plaintext, context.label())
    }

    fn decrypt(&self, ciphertext: &[u8], context: CryptoContext) -> Result<Vec<u8>, CryptoError> {
        decrypt_wire(self.key()?, ciphertext, context.label())
    }
}

/// Random challenge salt.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// HKDF-SHA256 over the ECDH secret, salted with the challenge salt.
pub fn derive_session_key(shared_secret: &[u8; 32], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SESSION_KEY_INFO, &mut key)
        .map_err(|_| CryptoError::Key)?;
    Ok(key)
}

/// ChaCha20-Poly1305; output is `nonce || ciphertext`.
pub fn encrypt_wire(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_wire(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("no session key agreed yet")]
    NoSessionKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreed_pair() -> (PairingCrypto, PairingCrypto, Vec<u8>) {
        let pairing = Keypair::generate();
        let pairing_pub = *pairing.public_key();
        let mut initiator = PairingCrypto::ephemeral();
        let mut responder = PairingCrypto::new(pairing);
        let salt = generate_salt();
        initiator.agree(&pairing_pub, &salt).unwrap();
        let echo = responder
            .derive_challenge_response(&initiator.ephemeral_public_key(), &salt)
            .unwrap();
        assert_eq!(
            initiator.decrypt(&echo, CryptoContext::Challenge).unwrap(),
            salt
        );
        (initiator, responder, salt)
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            a.shared_secret(b.public_key()),
            b.shared_secret(a.public_key())
        );
    }

    #[test]
    fn challenge_echo_roundtrip() {
        let (initiator, responder, _) = agreed_pair();
        let sealed = responder
            .encrypt(b"vault digest", CryptoContext::Transfer)
            .unwrap();
        assert_eq!(
            initiator.decrypt(&sealed, CryptoContext::Transfer).unwrap(),
            b"vault digest"
        );
    }

    #[test]
    fn context_is_bound() {
        let (initiator, responder, _) = agreed_pair();
        let sealed = responder.encrypt(b"x", CryptoContext::Pull).unwrap();
        assert!(initiator.decrypt(&sealed, CryptoContext::Transfer).is_err());
    }

    #[test]
    fn different_salt_breaks_agreement() {
        let pairing = Keypair::generate();
        let pairing_pub = *pairing.public_key();
        let mut initiator = PairingCrypto::ephemeral();
        let mut responder = PairingCrypto::new(pairing);
        initiator.agree(&pairing_pub, &generate_salt()).unwrap();
        let echo = responder
            .derive_challenge_response(&initiator.ephemeral_public_key(), &generate_salt())
            .unwrap();
        assert!(initiator.decrypt(&echo, CryptoContext::Challenge).is_err());
    }

    #[test]
    fn encrypt_requires_agreement() {
        let engine = PairingCrypto::ephemeral();
        assert!(matches!(
            engine.encrypt(b"x", CryptoContext::Transfer),
            Err(CryptoError::NoSessionKey)
        ));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = [9u8; 32];
        assert!(matches!(
            decrypt_wire(&key, &[0u8; 5], b""),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let kp = Keypair::generate();
        let encoded = kp.public_key().to_base64();
        assert_eq!(PublicKey::from_base64(&encoded).unwrap(), *kp.public_key());
        assert!(PublicKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn keypair_from_secret_bytes_is_stable() {
        let kp = Keypair::generate();
        let again = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(again.public_key(), kp.public_key());
    }
}
