//! Cryptographic primitives the relay itself needs.
//!
//! The relay never holds a client session key. What it does need:
//!   - SHA-256 content hashing, for the manifest_hash capability binding (I5)
//!   - HMAC-SHA256 signing, for capability tokens (§4.1)
//!   - constant-time comparison, for signatures and single-use hashes
//!   - random byte generation, for IDs, tokens, and scan keys
//!   - bounded ChaCha20-Poly1305 decryption, for scan_finalize (§4.6) only —
//!     this is the one place the server decrypts anything, and only a
//!     throwaway scan-session key it minted itself, never the session key.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;
const B64_STD: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// SHA-256 of a byte slice.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    buf
}

pub fn b64url_encode(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(s).map_err(|_| CryptoError::BadEncoding)
}

/// Standard-alphabet base64 (with `+`/`/`/`=`), for the one field the spec
/// calls out as plain `base64` rather than `base64url`: the TURN ephemeral
/// credential (§4.7), which a TURN server decodes with the RFC 5766
/// short-term-credential convention, not this relay's own token encoding.
pub fn b64_std_encode(data: &[u8]) -> String {
    B64_STD.encode(data)
}

/// Generate `n` cryptographically random bytes, base64url-encoded.
/// Used for transfer IDs, session/claim IDs, JTIs, and tokens.
pub fn random_token(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    b64url_encode(&buf)
}

/// Generate a fresh 32-byte key. Used for scan_key — never the session key.
pub fn random_key32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Constant-time byte comparison. Use for signatures, token hashes, and any
/// other secret-equivalent comparison — never `==` on raw bytes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 the capability signing key, and capability tokens, use.
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    pub fn sign(&self, payload: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        let out = mac.finalize().into_bytes();
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        buf
    }

    /// Verify a signature in constant time.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let expected = self.sign(payload);
        constant_time_eq(&expected, signature)
    }
}

/// Derive the AAD-less nonce for scan chunk `index`: 4 zero bytes followed
/// by the big-endian u64 chunk index (I7 / §4.6).
pub fn scan_nonce(chunk_index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&chunk_index.to_be_bytes());
    nonce
}

/// Decrypt one sealed scan chunk. `key` is the scan session's fresh key,
/// never the client's session key.
pub fn scan_open(key: &[u8; 32], chunk_index: u64, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = scan_nonce(chunk_index);
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, sealed)
        .map_err(|_| CryptoError::AeadVerifyFailed)
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64url encoding")]
    BadEncoding,
    #[error("AEAD verification failed")]
    AeadVerifyFailed,
}
