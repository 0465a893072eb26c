//! Ed25519 identity, canonical signing strings, and stable-id derivation.
//!
//! `spec.md` §4.1: signing strings are pipe-joined ASCII fields in a fixed
//! order per operation, empty optional fields represented as empty
//! strings. Stable ids are the first 8 hex chars of SHA-256(pubkey).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("identity file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file malformed: {0}")]
    Malformed(String),
}

/// An Ed25519 keypair plus the convenience methods the relay needs for
/// signing canonical content strings.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing_key: SigningKey::from_bytes(&arr) })
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn stable_id(&self) -> String {
        stable_id_for_pubkey(&self.public_key_bytes())
    }
}

/// Verify a detached signature over `message` under `pubkey`.
pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pubkey: [u8; 32] = pubkey.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key = VerifyingKey::from_bytes(&pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of two byte slices, used for the court's
/// selection seed: `SHA-256(proposal_id || disputant_nonce || server_nonce)`.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `first 8 hex chars of SHA-256(pubkey_bytes)`. `spec.md` §3/§4.1.
pub fn stable_id_for_pubkey(pubkey: &[u8]) -> String {
    hex::encode(sha256(pubkey))[..8].to_string()
}

/// Generate a random 8-character alphanumeric id for the ephemeral path.
pub fn random_alnum_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Generate a random 32-byte nonce, used both for auth challenges and
/// court commit-reveal.
pub fn random_nonce() -> [u8; 32] {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Join fields with `|`, matching `spec.md` §4.1's canonical signing
/// strings. Empty optional fields must already be represented as `""`
/// by the caller.
pub fn signing_string(fields: &[&str]) -> String {
    fields.join("|")
}

// =============================================================================
// IDENTITY FILE PERSISTENCE
// =============================================================================

/// Maximum identity file size before it's rejected unread, mirroring the
/// teacher's bounded-deserialize discipline for ban-list files.
const MAX_IDENTITY_FILE_BYTES: u64 = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    pubkey: String,
    privkey: String,
}

/// Persist `{pubkey, privkey}` as base64-wrapped JSON, `0600` on Unix.
/// `spec.md` §6: "Identity files: `{pubkey, privkey}` in PEM/base64,
/// permissions 0600."
pub fn save_identity<P: AsRef<Path>>(path: P, keypair: &Keypair) -> Result<(), CryptoError> {
    use base64::Engine as _;
    let doc = IdentityFile {
        pubkey: base64::engine::general_purpose::STANDARD.encode(keypair.public_key_bytes()),
        privkey: base64::engine::general_purpose::STANDARD.encode(keypair.secret_bytes()),
    };
    let data = serde_json::to_vec_pretty(&doc).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    fs::write(&path, &data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Load a keypair written by [`save_identity`].
pub fn load_identity<P: AsRef<Path>>(path: P) -> Result<Keypair, CryptoError> {
    use base64::Engine as _;
    let meta = fs::metadata(&path)?;
    if meta.len() > MAX_IDENTITY_FILE_BYTES {
        return Err(CryptoError::Malformed(format!(
            "identity file too large: {} bytes",
            meta.len()
        )));
    }
    let data = fs::read(&path)?;
    let doc: IdentityFile =
        serde_json::from_slice(&data).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let secret = base64::engine::general_purpose::STANDARD
        .decode(doc.privkey)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    Keypair::from_secret_bytes(&secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = signing_string(&["to", "task", "10", "USD", "", ""]);
        let sig = kp.sign(msg.as_bytes());
        assert!(verify(&kp.public_key_bytes(), msg.as_bytes(), &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(verify(&kp.public_key_bytes(), b"goodbye", &sig).is_err());
    }

    #[test]
    fn stable_id_is_deterministic() {
        let kp = Keypair::generate();
        let id1 = kp.stable_id();
        let id2 = stable_id_for_pubkey(&kp.public_key_bytes());
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 8);
    }

    #[test]
    fn identity_roundtrip_via_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let kp = Keypair::generate();
        save_identity(&path, &kp).unwrap();
        let loaded = load_identity(&path).unwrap();
        assert_eq!(kp.public_key_bytes(), loaded.public_key_bytes());
    }
}
