//! Key management and symmetric encryption for the settings blob.
//!
//! The key is derived once from a host fingerprint and then cached in a key
//! file; a readable key file always wins over re-derivation so that a change
//! in the fingerprint never orphans an existing settings file.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KDF_ITERATIONS: u32 = 100_000;
const KDF_CONTEXT: &[u8] = b"dlp-job-agent-secure-settings-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is shorter than the nonce")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("decrypted settings are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// `host-arch-cpu` string used as key-derivation input.
pub fn host_fingerprint() -> String {
    let host = System::host_name().unwrap_or_else(|| "unknown-host".to_string());
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    let cpu = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    format!("{}-{}-{}", host, std::env::consts::ARCH, cpu)
}

/// PBKDF2-HMAC-SHA256 over the fixed context string, salted with SHA-256(fingerprint).
pub fn derive_key(fingerprint: &str) -> [u8; KEY_LEN] {
    let salt = Sha256::digest(fingerprint.as_bytes());
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(KDF_CONTEXT, &salt, KDF_ITERATIONS, &mut key);
    key
}

/// Reuses the key stored at `key_path`, or derives and persists a new one.
///
/// Failing to write the key file is logged; the derived key is still returned
/// so the current process can encrypt.
pub fn load_or_create_key(key_path: &Path) -> [u8; KEY_LEN] {
    if let Some(key) = read_key_file(key_path) {
        return key;
    }

    tracing::info!("Deriving settings key from host fingerprint");
    let key = derive_key(&host_fingerprint());
    if let Err(e) = write_key_file(key_path, &key) {
        tracing::warn!("Failed to persist key file at {}: {}", key_path.display(), e);
    }
    key
}

fn read_key_file(key_path: &Path) -> Option<[u8; KEY_LEN]> {
    let encoded = fs::read_to_string(key_path).ok()?;
    let decoded = match URL_SAFE.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Key file at {} is not valid base64: {}", key_path.display(), e);
            return None;
        }
    };
    match <[u8; KEY_LEN]>::try_from(decoded.as_slice()) {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(
                "Key file at {} holds {} bytes, expected {}",
                key_path.display(),
                decoded.len(),
                KEY_LEN
            );
            None
        }
    }
}

fn write_key_file(key_path: &Path, key: &[u8; KEY_LEN]) -> std::io::Result<()> {
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(key_path)?;

    // `mode` only applies on creation; a replaced file keeps its old bits otherwise.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(URL_SAFE.encode(key).as_bytes())?;
    file.sync_all()
}

/// AES-256-GCM cipher. Blobs are laid out as `nonce || ciphertext+tag`.
#[derive(Clone)]
pub struct SettingsCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SettingsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SettingsCipher { .. }")
    }
}

impl SettingsCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        SettingsCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<String, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let cipher = SettingsCipher::new(&[7u8; KEY_LEN]);
        let blob = cipher.encrypt(r#"{"video_quality":"720p"}"#).unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), r#"{"video_quality":"720p"}"#);
    }

    #[test]
    fn nonces_differ_between_saves() {
        let cipher = SettingsCipher::new(&[7u8; KEY_LEN]);
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let blob = SettingsCipher::new(&[1u8; KEY_LEN]).encrypt("secret").unwrap();
        let err = SettingsCipher::new(&[2u8; KEY_LEN]).decrypt(&blob).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn short_blob_is_rejected() {
        let cipher = SettingsCipher::new(&[1u8; KEY_LEN]);
        assert!(matches!(cipher.decrypt(b"abc"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn derivation_is_stable_per_fingerprint() {
        assert_eq!(derive_key("host-x86_64-cpu"), derive_key("host-x86_64-cpu"));
        assert_ne!(derive_key("host-x86_64-cpu"), derive_key("other-x86_64-cpu"));
    }

    #[test]
    fn existing_key_file_is_reused_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join(".key");
        let key = [9u8; KEY_LEN];
        write_key_file(&key_path, &key).unwrap();
        assert_eq!(load_or_create_key(&key_path), key);
    }

    #[test]
    fn malformed_key_file_falls_back_to_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join(".key");
        fs::write(&key_path, "not base64 !!").unwrap();
        let key = load_or_create_key(&key_path);
        assert_eq!(key, derive_key(&host_fingerprint()));
        // The freshly derived key replaces the unreadable file.
        assert_eq!(read_key_file(&key_path), Some(key));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;

        let fresh = dir.path().join("keys").join(".key");
        load_or_create_key(&fresh);
        assert_eq!(mode(&fresh), 0o600);

        let loose = dir.path().join(".loose");
        fs::write(&loose, "garbage").unwrap();
        fs::set_permissions(&loose, fs::Permissions::from_mode(0o644)).unwrap();
        let key = load_or_create_key(&loose);
        assert_eq!(mode(&loose), 0o600);
        assert_eq!(read_key_file(&loose), Some(key));
    }
}
