//! Device identity and crypto: keypairs, device ID, session keys, sealed
//! payloads, and the storage boundary for identity persistence.
//!
//! Key exchange is deferred until the first real message to a peer rather
//! than performed at discovery: the exchange payload is far too large for
//! the minimal beacon frame, so the first message silently piggybacks an
//! `Initial` frame ahead of itself (the protocol's 0-RTT property).

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Device public key (32 bytes, X25519). Carried in `Initial` packets.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Device ID: first 32 bits of SHA-256 over the public key, rendered as
/// 8 uppercase hex characters. Fits the transport's character budget; the
/// collision space is a documented tradeoff, not a security boundary.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 4]);

impl DeviceId {
    /// Derive a device ID from a public key (same derivation `Keypair`
    /// uses for its own).
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 4];
        id.copy_from_slice(&digest[..4]);
        DeviceId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Parse error for the 8-character uppercase-hex device id form.
#[derive(Debug, thiserror::Error)]
#[error("device id must be 8 uppercase hex characters")]
pub struct ParseDeviceIdError;

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    /// Strict: exactly 8 characters, uppercase hex only. Lowercase is
    /// rejected so that every id has one canonical wire rendering.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 8 {
            return Err(ParseDeviceIdError);
        }
        let mut id = [0u8; 4];
        for (i, pair) in bytes.chunks(2).enumerate() {
            let hi = hex_val(pair[0]).ok_or(ParseDeviceIdError)?;
            let lo = hex_val(pair[1]).ok_or(ParseDeviceIdError)?;
            id[i] = (hi << 4) | lo;
        }
        Ok(DeviceId(id))
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Errors in the identity and crypto layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The platform cannot produce secure random bytes. Fatal at identity
    /// creation time; nothing else in the system is.
    #[error("secure random source unavailable")]
    Unavailable,
    /// Malformed or non-contributory peer key material.
    #[error("key agreement failed")]
    KeyAgreement,
    /// AEAD open failed: tampered input or mismatched key. Always
    /// non-fatal to callers.
    #[error("authentication failed")]
    Authentication,
    /// AEAD seal failed.
    #[error("encryption failed")]
    Seal,
}

/// X25519 keypair. The secret never leaves this struct except through
/// `secret_bytes` for persistence.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::Unavailable)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Rebuild a keypair from persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let device_id = DeviceId::from_public_key(&public);
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Derive the pairwise AEAD key with a peer: X25519 agreement followed
    /// by a labeled SHA-256 KDF. Rejects low-order peer keys.
    pub fn session_key(&self, peer: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement);
        }
        let mut hasher = Sha256::new();
        hasher.update(b"glint-session-v1");
        hasher.update(shared.as_bytes());
        Ok(hasher.finalize().into())
    }
}

/// Authenticated encryption with a random 96-bit nonce. The channel is
/// connectionless and replays frames freely, so counter nonces do not
/// apply here.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12]), CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Seal)?;
    let mut nonce = [0u8; 12];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::Unavailable)?;
    let ciphertext = cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;
    Ok((ciphertext, nonce))
}

/// Authenticated decryption.
pub fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Authentication)?;
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Seal a text payload into the wire's armored form:
/// base64(nonce || ciphertext).
pub fn seal_text(key: &[u8; 32], text: &str) -> Result<String, CryptoError> {
    let (ciphertext, nonce) = seal(key, text.as_bytes())?;
    let mut buf = Vec::with_capacity(nonce.len() + ciphertext.len());
    buf.extend_from_slice(&nonce);
    buf.extend_from_slice(&ciphertext);
    Ok(STANDARD_NO_PAD.encode(buf))
}

/// Open an armored text payload. Every malformed input maps to
/// `Authentication`; callers surface it as an undecryptable message, never
/// as an abort.
pub fn open_text(key: &[u8; 32], payload: &str) -> Result<String, CryptoError> {
    let buf = STANDARD_NO_PAD
        .decode(payload)
        .map_err(|_| CryptoError::Authentication)?;
    if buf.len() < 12 {
        return Err(CryptoError::Authentication);
    }
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&buf[..12]);
    let plain = open(key, &nonce, &buf[12..])?;
    String::from_utf8(plain).map_err(|_| CryptoError::Authentication)
}

/// Storage boundary: a synchronous string key-value store with last-write-
/// wins semantics. The host supplies the backend; the core uses it once at
/// startup to load or persist the identity.
pub trait IdentityStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
}

/// Storage key under which the identity record lives.
pub const IDENTITY_STORE_KEY: &str = "glint.identity";

const IDENTITY_RECORD_VERSION: u8 = 1;

/// Persisted identity: a versioned record, bincode-encoded and
/// hex-rendered for the string-valued store.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u8,
    secret: [u8; 32],
}

/// Load the persisted identity, or generate and persist a fresh one.
/// Identity is created once and never changes for the lifetime of a
/// device's participation.
pub fn load_or_create(store: &mut dyn IdentityStore) -> anyhow::Result<Keypair> {
    if let Some(value) = store.get(IDENTITY_STORE_KEY)? {
        let bytes = hex::decode(value.trim())?;
        let record: StoredIdentity = bincode::deserialize(&bytes)?;
        if record.version != IDENTITY_RECORD_VERSION {
            bail!("unsupported identity record version {}", record.version);
        }
        return Ok(Keypair::from_secret_bytes(record.secret));
    }
    let keypair = Keypair::generate()?;
    let record = StoredIdentity {
        version: IDENTITY_RECORD_VERSION,
        secret: keypair.secret_bytes(),
    };
    store.set(IDENTITY_STORE_KEY, &hex::encode(bincode::serialize(&record)?))?;
    Ok(keypair)
}
