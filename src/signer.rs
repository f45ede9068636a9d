//! signify-compatible Ed25519 key, secret-key, and signature handling.
//!
//! Wire formats (see `spec.md` §3): a public key is 42 decoded bytes, a
//! secret key is 104, a signature is 74. All three lead with a 2-byte
//! algorithm tag (`Ed`) followed by an 8-byte key number, which binds a
//! signature to the key that produced it without needing a full public key
//! comparison.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};

use crate::error::{Result, UpdaterError};

const ALGO_TAG: [u8; 2] = [0x45, 0x64]; // "Ed"
const PKALG_KEYNUM_LEN: usize = 10;

const PUBLIC_KEY_LEN: usize = 42;
const SECRET_KEY_LEN: usize = 104;
const SIGNATURE_LEN: usize = 74;

/// A signify-format Ed25519 public key (42 raw bytes: `Ed` ‖ key-number ‖ key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key_number: [u8; 8],
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Decode a base64-encoded signify public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| UpdaterError::BadLength {
                expected: PUBLIC_KEY_LEN,
                actual: 0,
            })?;
        Self::from_bytes(&raw)
    }

    fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != PUBLIC_KEY_LEN {
            return Err(UpdaterError::BadLength {
                expected: PUBLIC_KEY_LEN,
                actual: raw.len(),
            });
        }
        check_algo_tag(&raw[0..2])?;
        let mut key_number = [0u8; 8];
        key_number.copy_from_slice(&raw[2..10]);
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&raw[10..42]);
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| UpdaterError::ChecksumMismatch)?;
        Ok(Self {
            key_number,
            verifying_key,
        })
    }

    fn prefix(&self) -> [u8; PKALG_KEYNUM_LEN] {
        let mut out = [0u8; PKALG_KEYNUM_LEN];
        out[0..2].copy_from_slice(&ALGO_TAG);
        out[2..10].copy_from_slice(&self.key_number);
        out
    }

    /// Encode this public key back to its base64 signify wire form.
    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(PUBLIC_KEY_LEN);
        raw.extend_from_slice(&ALGO_TAG);
        raw.extend_from_slice(&self.key_number);
        raw.extend_from_slice(self.verifying_key.as_bytes());
        STANDARD.encode(raw)
    }
}

/// A signify-format Ed25519 secret key (104 raw bytes, unencrypted only).
#[derive(Clone)]
pub struct SecretKey {
    key_number: [u8; 8],
    signing_key: SigningKey,
}

impl SecretKey {
    /// Decode a base64-encoded signify secret key.
    ///
    /// Rejects KDF-encrypted keys (KDF algorithm must be `00 00`, rounds
    /// must be zero) and validates the embedded checksum, which is the
    /// first 8 bytes of SHA-512 over the key-number+secret-key tail.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| UpdaterError::BadLength {
                expected: SECRET_KEY_LEN,
                actual: 0,
            })?;
        if raw.len() != SECRET_KEY_LEN {
            return Err(UpdaterError::BadLength {
                expected: SECRET_KEY_LEN,
                actual: raw.len(),
            });
        }
        check_algo_tag(&raw[0..2])?;
        if raw[2..4] != [0x00, 0x00] || raw[4..8] != [0x00, 0x00, 0x00, 0x00] {
            return Err(UpdaterError::UnsupportedKDF);
        }
        let checksum = &raw[24..32];
        let tail = &raw[40..104];
        let computed = Sha512::digest(tail);
        if checksum != &computed[0..8] {
            return Err(UpdaterError::ChecksumMismatch);
        }
        let mut key_number = [0u8; 8];
        key_number.copy_from_slice(&raw[32..40]);
        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&raw[40..72]);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        Ok(Self {
            key_number,
            signing_key,
        })
    }

    fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(SECRET_KEY_LEN);
        raw.extend_from_slice(&ALGO_TAG);
        raw.extend_from_slice(&[0x00, 0x00]); // unencrypted KDF
        raw.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // zero rounds
        raw.extend_from_slice(&[0u8; 16]); // salt (unused, unencrypted)
        let tail = full_secret_tail(&self.signing_key);
        let checksum = Sha512::digest(tail);
        raw.extend_from_slice(&checksum[0..8]);
        raw.extend_from_slice(&self.key_number);
        raw.extend_from_slice(&tail);
        STANDARD.encode(raw)
    }
}

/// `32-byte seed ‖ 32-byte public key`, the 64-byte tail that the
/// secret-key checksum covers.
fn full_secret_tail(signing_key: &SigningKey) -> [u8; 64] {
    let mut tail = [0u8; 64];
    tail[0..32].copy_from_slice(&signing_key.to_bytes());
    tail[32..64].copy_from_slice(signing_key.verifying_key().as_bytes());
    tail
}

fn check_algo_tag(tag: &[u8]) -> Result<()> {
    if tag != ALGO_TAG {
        let mut got = [0u8; 2];
        got.copy_from_slice(tag);
        return Err(UpdaterError::UnknownAlgorithm(got));
    }
    Ok(())
}

/// Generate a fresh signify-compatible keypair with a random key number.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let mut csprng = OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let mut key_number = [0u8; 8];
    rand::RngCore::fill_bytes(&mut csprng, &mut key_number);
    let verifying_key = signing_key.verifying_key();
    (
        PublicKey {
            key_number,
            verifying_key,
        },
        SecretKey {
            key_number,
            signing_key,
        },
    )
}

/// Sign `text` (as UTF-8 bytes) with `secret_key`, returning a base64-encoded
/// signify signature.
pub fn sign(secret_key: &SecretKey, text: &str) -> String {
    let signature = secret_key.signing_key.sign(text.as_bytes());
    let mut raw = Vec::with_capacity(SIGNATURE_LEN);
    raw.extend_from_slice(&ALGO_TAG);
    raw.extend_from_slice(&secret_key.key_number);
    raw.extend_from_slice(&signature.to_bytes());
    STANDARD.encode(raw)
}

/// Verify a base64-encoded signify signature over `text` against the first
/// key in `public_keys` whose 10-byte algorithm+key-number prefix matches.
pub fn verify(public_keys: &[PublicKey], signature_b64: &str, text: &str) -> Result<()> {
    let raw = STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| UpdaterError::BadLength {
            expected: SIGNATURE_LEN,
            actual: 0,
        })?;
    if raw.len() != SIGNATURE_LEN {
        return Err(UpdaterError::BadLength {
            expected: SIGNATURE_LEN,
            actual: raw.len(),
        });
    }
    check_algo_tag(&raw[0..2])?;

    let mut sig_prefix = [0u8; PKALG_KEYNUM_LEN];
    sig_prefix.copy_from_slice(&raw[0..10]);

    let key = public_keys
        .iter()
        .find(|k| constant_time_eq(&k.prefix(), &sig_prefix))
        .ok_or(UpdaterError::NoMatchingKey)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&raw[10..74]);
    let signature = DalekSignature::from_bytes(&sig_bytes);

    key.verifying_key
        .verify(text.as_bytes(), &signature)
        .map_err(|_| UpdaterError::InvalidSignature)
}

/// Constant-time byte-slice comparison, used for all comparisons that touch
/// secret-derived data (key prefixes, checksums).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
