// Vault secret encryption.
//
// AES-256-GCM over a small key ring: one active key for sealing, any
// number of retired keys kept for opening, so the master key can rotate
// without re-encrypting every row at once. Stored values are ASCII
// envelopes
//
//     wv1:<key_id>:<base64(nonce || ciphertext)>
//
// The key id is fed to the AEAD as associated data, so an envelope
// relabeled with a different key id fails authentication instead of
// decrypting under the wrong key.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

const FORMAT_TAG: &str = "wv1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

struct Ring {
    active_id: String,
    keys: HashMap<String, Aes256Gcm>,
}

/// Vault cipher with rotation support
///
/// Cheap to clone; shared by the API and worker processes. New values are
/// sealed with the active key, every key in the ring can open.
#[derive(Clone)]
pub struct SecretCipher {
    ring: Arc<Ring>,
}

impl SecretCipher {
    /// Build a ring from key strings
    ///
    /// Accepted formats: `key_id:base64_key`, or a bare base64 key which
    /// gets the id `k1`. The first argument is the active key.
    pub fn new(active: &str, retired: &[&str]) -> Result<Self> {
        let (active_id, active_key) = parse_key(active)?;

        let mut keys = HashMap::new();
        keys.insert(active_id.clone(), active_key);
        for spec in retired {
            let (id, key) = parse_key(spec)?;
            if keys.insert(id.clone(), key).is_some() {
                bail!("encryption key id '{id}' appears twice");
            }
        }

        Ok(Self {
            ring: Arc::new(Ring { active_id, keys }),
        })
    }

    /// Build the ring from `ENCRYPTION_KEY` and, when rotating,
    /// `ENCRYPTION_KEY_PREVIOUS`
    pub fn from_env() -> Result<Self> {
        let active = std::env::var("ENCRYPTION_KEY")
            .context("ENCRYPTION_KEY environment variable not set")?;
        let previous = std::env::var("ENCRYPTION_KEY_PREVIOUS").ok();
        let retired: Vec<&str> = previous.as_deref().into_iter().collect();
        Self::new(&active, &retired)
    }

    /// Seal a secret under the active key, returning envelope bytes for
    /// database storage
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = self
            .ring
            .keys
            .get(&self.ring.active_id)
            .context("active key missing from the ring")?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: self.ring.active_id.as_bytes(),
                },
            )
            .map_err(|_| anyhow::anyhow!("sealing failed"))?;

        let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        body.extend_from_slice(&nonce_bytes);
        body.extend_from_slice(&ciphertext);

        Ok(format!("{FORMAT_TAG}:{}:{}", self.ring.active_id, BASE64.encode(body)).into_bytes())
    }

    /// Open an envelope with whichever ring key sealed it
    pub fn open(&self, stored: &[u8]) -> Result<String> {
        let (key_id, body) = split_envelope(stored)?;

        let cipher = self
            .ring
            .keys
            .get(key_id)
            .ok_or_else(|| anyhow::anyhow!("no key in the ring for id '{key_id}'"))?;

        if body.len() < NONCE_LEN {
            bail!("envelope body shorter than a nonce");
        }
        let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| anyhow::anyhow!("opening failed (wrong key or corrupted data)"))?;

        String::from_utf8(plaintext).context("sealed value is not valid UTF-8")
    }

    /// Key id an envelope was sealed with, without opening it
    pub fn key_id_of(stored: &[u8]) -> Result<String> {
        let (key_id, _) = split_envelope(stored)?;
        Ok(key_id.to_string())
    }

    /// Re-seal with the active key; `None` when already current
    ///
    /// Lets a maintenance pass migrate rows off a retired key.
    pub fn reseal(&self, stored: &[u8]) -> Result<Option<Vec<u8>>> {
        if Self::key_id_of(stored)? == self.ring.active_id {
            return Ok(None);
        }
        let plaintext = self.open(stored)?;
        Ok(Some(self.seal(&plaintext)?))
    }

    pub fn active_key_id(&self) -> &str {
        &self.ring.active_id
    }
}

/// `key_id:base64_key`, or bare base64 which becomes key id `k1`
fn parse_key(spec: &str) -> Result<(String, Aes256Gcm)> {
    let (id, encoded) = match spec.split_once(':') {
        Some((id, b64)) => (id, b64),
        None => ("k1", spec),
    };
    if id.is_empty() {
        bail!("encryption key id is empty");
    }

    let bytes = BASE64
        .decode(encoded)
        .with_context(|| format!("key '{id}' is not valid base64"))?;
    if bytes.len() != KEY_LEN {
        bail!("key '{id}' is {} bytes, expected {KEY_LEN}", bytes.len());
    }

    let cipher = Aes256Gcm::new_from_slice(&bytes)
        .map_err(|_| anyhow::anyhow!("key '{id}' was rejected by the cipher"))?;
    Ok((id.to_string(), cipher))
}

/// Tear an envelope into its key id and decoded body
fn split_envelope(stored: &[u8]) -> Result<(&str, Vec<u8>)> {
    let text = std::str::from_utf8(stored).context("envelope is not ASCII")?;

    let mut parts = text.splitn(3, ':');
    let tag = parts.next().unwrap_or_default();
    let key_id = parts.next().context("envelope is missing a key id")?;
    let encoded = parts.next().context("envelope is missing a body")?;

    if tag != FORMAT_TAG {
        bail!("unknown envelope format '{tag}'");
    }
    if key_id.is_empty() {
        bail!("envelope has an empty key id");
    }

    let body = BASE64
        .decode(encoded)
        .context("envelope body is not valid base64")?;
    Ok((key_id, body))
}

/// Generate a fresh random key in `key_id:base64_key` form
pub fn generate_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{}:{}", key_id, BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();

        let plaintext = "sk-test-api-key-12345";
        let stored = cipher.seal(plaintext).unwrap();
        assert_eq!(cipher.open(&stored).unwrap(), plaintext);
    }

    #[test]
    fn test_envelope_shape() {
        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();
        let stored = cipher.seal("v").unwrap();

        let text = std::str::from_utf8(&stored).unwrap();
        assert!(text.starts_with("wv1:kek-v1:"));
        assert_eq!(SecretCipher::key_id_of(&stored).unwrap(), "kek-v1");
    }

    #[test]
    fn test_stored_bytes_never_contain_plaintext() {
        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();
        let plaintext = "super-secret-token";
        let stored = cipher.seal(plaintext).unwrap();
        assert!(!String::from_utf8_lossy(&stored).contains(plaintext));
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.open(&a).unwrap(), "same");
        assert_eq!(cipher.open(&b).unwrap(), "same");
    }

    #[test]
    fn test_tampered_body_fails() {
        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();
        let stored = cipher.seal("value").unwrap();

        // Flip one bit inside the base64 body
        let text = std::str::from_utf8(&stored).unwrap();
        let mut tampered = text.to_string().into_bytes();
        let last = tampered.len() - 2;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };

        assert!(cipher.open(&tampered).is_err());
    }

    #[test]
    fn test_relabeled_key_id_fails_authentication() {
        // Same key under two ids: an envelope relabeled to the other id
        // must not open, because the id is associated data.
        let key = generate_key("kek-v1");
        let same_key_other_id = format!("kek-v2:{}", key.split_once(':').unwrap().1);
        let cipher = SecretCipher::new(&key, &[&same_key_other_id]).unwrap();

        let stored = cipher.seal("value").unwrap();
        let relabeled = std::str::from_utf8(&stored)
            .unwrap()
            .replacen("kek-v1", "kek-v2", 1)
            .into_bytes();

        assert!(cipher.open(&relabeled).is_err());
    }

    #[test]
    fn test_rotation_opens_old_seals_and_reseals() {
        let old_key = generate_key("kek-v1");
        let new_key = generate_key("kek-v2");

        let old = SecretCipher::new(&old_key, &[]).unwrap();
        let stored_v1 = old.seal("secret").unwrap();

        let rotated = SecretCipher::new(&new_key, &[&old_key]).unwrap();
        assert_eq!(rotated.open(&stored_v1).unwrap(), "secret");
        assert_eq!(rotated.active_key_id(), "kek-v2");

        let stored_v2 = rotated.reseal(&stored_v1).unwrap().unwrap();
        assert_eq!(SecretCipher::key_id_of(&stored_v2).unwrap(), "kek-v2");
        assert_eq!(rotated.open(&stored_v2).unwrap(), "secret");

        // Already on the active key: nothing to do
        assert!(rotated.reseal(&stored_v2).unwrap().is_none());
    }

    #[test]
    fn test_unknown_key_id_rejected() {
        let a = SecretCipher::new(&generate_key("kek-a"), &[]).unwrap();
        let b = SecretCipher::new(&generate_key("kek-b"), &[]).unwrap();

        let stored = a.seal("secret").unwrap();
        assert!(b.open(&stored).is_err());
    }

    #[test]
    fn test_bare_base64_key_gets_default_id() {
        let bare = generate_key("x").split_once(':').unwrap().1.to_string();
        let cipher = SecretCipher::new(&bare, &[]).unwrap();
        assert_eq!(cipher.active_key_id(), "k1");

        let stored = cipher.seal("v").unwrap();
        assert_eq!(cipher.open(&stored).unwrap(), "v");
    }

    #[test]
    fn test_bad_keys_and_envelopes_rejected() {
        assert!(SecretCipher::new("kek-v1:not-base64!!!", &[]).is_err());
        let short = format!("kek-v1:{}", BASE64.encode([0u8; 16]));
        assert!(SecretCipher::new(&short, &[]).is_err());

        let k = generate_key("dup");
        assert!(SecretCipher::new(&k, &[&k]).is_err());

        let cipher = SecretCipher::new(&generate_key("kek-v1"), &[]).unwrap();
        assert!(cipher.open(b"not an envelope").is_err());
        assert!(cipher.open(b"wv9:kek-v1:AAAA").is_err());
        assert!(cipher.open(b"wv1:kek-v1:@@@@").is_err());
        assert!(cipher.open(b"wv1:kek-v1:AAAA").is_err()); // shorter than a nonce
    }
}
