//! NX-pattern encrypted transport
//!
//! The initiator opens with a 4-byte magic and its ephemeral public key; the
//! responder answers with its own ephemeral key plus its static key sealed
//! under the post-`ee` cipher. Both sides then derive one AEAD state per
//! direction. The key schedule is a sha256 chaining key mixing each public
//! key and DH result; a direction rekeys after 2^16 records.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use secp256k1::ecdh::SharedSecret;
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bytes a v2 client sends before its ephemeral key; the protocol detector
/// keys off this prefix.
pub const V2_MAGIC: [u8; 4] = *b"STR2";

/// Compressed secp256k1 public key length.
pub const PUBKEY_LEN: usize = 33;

/// AEAD tag length.
pub const TAG_LEN: usize = 16;

/// Responder handshake reply length: ephemeral key + sealed static key.
pub const RESPONSE_LEN: usize = PUBKEY_LEN + PUBKEY_LEN + TAG_LEN;

/// Records per direction before a rekey.
const REKEY_INTERVAL: u64 = 1 << 16;

const PROTOCOL_NAME: &[u8] = b"forgepool-nx-secp256k1+chachapoly+sha256";

/// Noise layer errors
#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Authentication failed on an AEAD open; the transport is dead
    #[error("transport cipher failure")]
    Cipher,

    #[error("record too large for u16 framing: {0} bytes")]
    RecordTooLarge(usize),
}

fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// One step of the chaining-key schedule: absorb `ikm`, emit a cipher key.
fn kdf2(ck: [u8; 32], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let temp = sha256_concat(&[&ck, ikm]);
    let next_ck = sha256_concat(&[&temp, &[0x01]]);
    let key = sha256_concat(&[&temp, &[0x02]]);
    (next_ck, key)
}

fn aead_seal(key: &[u8; 32], counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(counter);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| NoiseError::Cipher)
}

fn aead_open(key: &[u8; 32], counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(counter);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| NoiseError::Cipher)
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// One direction of the established transport.
pub struct CipherState {
    key: [u8; 32],
    counter: u64,
    since_rekey: u64,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0, since_rekey: 0 }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = aead_seal(&self.key, self.counter, &[], plaintext)?;
        self.advance();
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = aead_open(&self.key, self.counter, &[], ciphertext)?;
        self.advance();
        Ok(plaintext)
    }

    fn advance(&mut self) {
        self.counter += 1;
        self.since_rekey += 1;
        if self.since_rekey >= REKEY_INTERVAL {
            self.rekey();
        }
    }

    fn rekey(&mut self) {
        self.key = sha256_concat(&[&self.key, b"rekey"]);
        self.counter = 0;
        self.since_rekey = 0;
    }

    /// Seal a plaintext frame into a `u16 LE` length-prefixed record.
    pub fn seal_record(&mut self, frame: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = self.encrypt(frame)?;
        if ciphertext.len() > u16::MAX as usize {
            return Err(NoiseError::RecordTooLarge(ciphertext.len()));
        }
        let mut record = Vec::with_capacity(2 + ciphertext.len());
        record.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open one record body (length prefix already consumed by the reader).
    pub fn open_record(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.decrypt(ciphertext)
    }
}

/// Both directions of an established noise session.
pub struct NoiseTransport {
    send: CipherState,
    recv: CipherState,
}

impl NoiseTransport {
    /// Seal a plaintext frame into a `u16 LE` length-prefixed record.
    pub fn seal_record(&mut self, frame: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.send.seal_record(frame)
    }

    /// Open one record body (length prefix already consumed by the reader).
    pub fn open_record(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.recv.open_record(ciphertext)
    }

    /// Split into independent send/receive halves so a connection can run
    /// separate reader and writer tasks.
    pub fn into_split(self) -> (CipherState, CipherState) {
        (self.send, self.recv)
    }
}

/// Server side of the NX handshake.
pub struct HandshakeResponder {
    secp: Secp256k1<All>,
    static_secret: SecretKey,
    static_public: PublicKey,
}

impl HandshakeResponder {
    /// Responder with a fresh random static key (no operator identity pinning).
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let static_secret = SecretKey::new(&mut rand::thread_rng());
        let static_public = PublicKey::from_secret_key(&secp, &static_secret);
        Self { secp, static_secret, static_public }
    }

    pub fn static_public_bytes(&self) -> [u8; PUBKEY_LEN] {
        self.static_public.serialize()
    }

    /// Consume the initiator's ephemeral key (33 bytes, magic already
    /// stripped); produce the 82-byte reply and the transport states.
    pub fn respond(
        &self,
        initiator_ephemeral: &[u8],
    ) -> Result<(Vec<u8>, NoiseTransport), NoiseError> {
        let e_i = PublicKey::from_slice(initiator_ephemeral)
            .map_err(|e| NoiseError::Handshake(format!("initiator ephemeral: {e}")))?;

        let mut ck = sha256_concat(&[PROTOCOL_NAME]);
        ck = sha256_concat(&[&ck, initiator_ephemeral]);

        let e_r_secret = SecretKey::new(&mut rand::thread_rng());
        let e_r_public = PublicKey::from_secret_key(&self.secp, &e_r_secret);
        let e_r_bytes = e_r_public.serialize();
        ck = sha256_concat(&[&ck, &e_r_bytes]);

        let ee = SharedSecret::new(&e_i, &e_r_secret);
        let (ck, k1) = kdf2(ck, &ee.secret_bytes());

        let sealed_static = aead_seal(&k1, 0, &ck, &self.static_public.serialize())?;
        let ck = sha256_concat(&[&ck, &sealed_static]);

        let es = SharedSecret::new(&e_i, &self.static_secret);
        let (_, transport_seed) = kdf2(ck, &es.secret_bytes());
        let (k_i2r, k_r2i) = split_transport_keys(&transport_seed);

        let mut response = Vec::with_capacity(RESPONSE_LEN);
        response.extend_from_slice(&e_r_bytes);
        response.extend_from_slice(&sealed_static);

        Ok((
            response,
            NoiseTransport { send: CipherState::new(k_r2i), recv: CipherState::new(k_i2r) },
        ))
    }
}

impl Default for HandshakeResponder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side of the NX handshake; used by tests and by pool-to-pool tools.
pub struct HandshakeInitiator {
    ephemeral_secret: SecretKey,
    ephemeral_public: PublicKey,
}

impl HandshakeInitiator {
    /// Create the initiator and its opening bytes (magic + ephemeral key).
    pub fn new() -> (Self, Vec<u8>) {
        let secp = Secp256k1::new();
        let ephemeral_secret = SecretKey::new(&mut rand::thread_rng());
        let ephemeral_public = PublicKey::from_secret_key(&secp, &ephemeral_secret);

        let mut first_message = Vec::with_capacity(V2_MAGIC.len() + PUBKEY_LEN);
        first_message.extend_from_slice(&V2_MAGIC);
        first_message.extend_from_slice(&ephemeral_public.serialize());

        (Self { ephemeral_secret, ephemeral_public }, first_message)
    }

    /// Consume the responder's 82-byte reply; yield the transport and the
    /// responder's authenticated static key.
    pub fn finalize(
        self,
        response: &[u8],
    ) -> Result<(NoiseTransport, [u8; PUBKEY_LEN]), NoiseError> {
        if response.len() != RESPONSE_LEN {
            return Err(NoiseError::Handshake(format!(
                "bad response length {} (expected {RESPONSE_LEN})",
                response.len()
            )));
        }
        let (e_r_bytes, sealed_static) = response.split_at(PUBKEY_LEN);
        let e_r = PublicKey::from_slice(e_r_bytes)
            .map_err(|e| NoiseError::Handshake(format!("responder ephemeral: {e}")))?;

        let mut ck = sha256_concat(&[PROTOCOL_NAME]);
        ck = sha256_concat(&[&ck, &self.ephemeral_public.serialize()]);
        ck = sha256_concat(&[&ck, e_r_bytes]);

        let ee = SharedSecret::new(&e_r, &self.ephemeral_secret);
        let (ck, k1) = kdf2(ck, &ee.secret_bytes());

        let static_bytes = aead_open(&k1, 0, &ck, sealed_static)?;
        let s_r = PublicKey::from_slice(&static_bytes)
            .map_err(|e| NoiseError::Handshake(format!("responder static: {e}")))?;
        let ck = sha256_concat(&[&ck, sealed_static]);

        let es = SharedSecret::new(&s_r, &self.ephemeral_secret);
        let (_, transport_seed) = kdf2(ck, &es.secret_bytes());
        let (k_i2r, k_r2i) = split_transport_keys(&transport_seed);

        let mut static_key = [0u8; PUBKEY_LEN];
        static_key.copy_from_slice(&static_bytes);

        Ok((
            NoiseTransport { send: CipherState::new(k_i2r), recv: CipherState::new(k_r2i) },
            static_key,
        ))
    }
}

fn split_transport_keys(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let k_i2r = sha256_concat(&[seed, &[0x01]]);
    let k_r2i = sha256_concat(&[seed, &[0x02]]);
    (k_i2r, k_r2i)
}
