//! Client-side sealing of roster and settings payloads.
//!
//! ```text
//! Roster ──► compact form ──► JSON ──► AES-256-GCM ──► base64(nonce ‖ ct)
//! ```
//!
//! The key is the SHA-256 digest of a pre-shared secret. Every seal draws a
//! fresh 96-bit nonce. The hub only ever sees the base64 string.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{AttendanceRecord, PublicSettings, Roster};

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("shared secret must not be empty")]
    EmptySecret,
    #[error("sealed payload is not valid base64: {0}")]
    Base64(String),
    #[error("sealed payload of {0} bytes is too short")]
    Truncated(usize),
    #[error("sealed payload failed authentication")]
    Authentication,
    #[error("sealed payload JSON error: {0}")]
    Json(String),
}

/// Short-field form of [`AttendanceRecord`].
#[derive(Serialize, Deserialize)]
struct CompactRecord {
    i: String,
    n: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    k: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    g: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    c: Option<String>,
    a: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
}

impl From<&AttendanceRecord> for CompactRecord {
    fn from(r: &AttendanceRecord) -> Self {
        Self {
            i: r.employee_id.clone(),
            n: r.name.clone(),
            k: r.kana.clone(),
            g: r.group.clone(),
            c: r.nationality.clone(),
            a: r.attending,
            t: r.checked_at.clone(),
        }
    }
}

impl From<CompactRecord> for AttendanceRecord {
    fn from(c: CompactRecord) -> Self {
        Self {
            employee_id: c.i,
            name: c.n,
            kana: c.k,
            group: c.g,
            nationality: c.c,
            attending: c.a,
            checked_at: c.t,
        }
    }
}

/// Short-field form of [`PublicSettings`].
#[derive(Serialize, Deserialize)]
struct CompactSettings {
    s: bool,
    #[serde(default)]
    p: BTreeMap<String, bool>,
}

/// Symmetric cipher shared by every client of one deployment.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}

impl PayloadCipher {
    pub fn new(secret: &str) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::EmptySecret);
        }
        let key = Sha256::digest(secret.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }

    pub fn seal_roster(&self, roster: &[AttendanceRecord]) -> Result<String, CipherError> {
        let compact: Vec<CompactRecord> = roster.iter().map(CompactRecord::from).collect();
        self.seal_json(&compact)
    }

    /// An empty string opens to an empty roster.
    pub fn open_roster(&self, sealed: &str) -> Result<Roster, CipherError> {
        if sealed.is_empty() {
            return Ok(Vec::new());
        }
        let compact: Vec<CompactRecord> = self.open_json(sealed)?;
        Ok(compact.into_iter().map(AttendanceRecord::from).collect())
    }

    pub fn seal_settings(&self, settings: &PublicSettings) -> Result<String, CipherError> {
        self.seal_json(&CompactSettings {
            s: settings.show_list,
            p: settings.public_columns.clone(),
        })
    }

    /// An empty string opens to [`PublicSettings::default`].
    pub fn open_settings(&self, sealed: &str) -> Result<PublicSettings, CipherError> {
        if sealed.is_empty() {
            return Ok(PublicSettings::default());
        }
        let compact: CompactSettings = self.open_json(sealed)?;
        Ok(PublicSettings {
            show_list: compact.s,
            public_columns: compact.p,
        })
    }

    fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, CipherError> {
        let plaintext = serde_json::to_vec(value).map_err(|e| CipherError::Json(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CipherError::Authentication)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    fn open_json<T: for<'de> Deserialize<'de>>(&self, sealed: &str) -> Result<T, CipherError> {
        let framed = STANDARD
            .decode(sealed.trim())
            .map_err(|e| CipherError::Base64(e.to_string()))?;
        if framed.len() <= NONCE_LEN {
            return Err(CipherError::Truncated(framed.len()));
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)?;
        serde_json::from_slice(&plaintext).map_err(|e| CipherError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        let mut alice = AttendanceRecord::new("E1", "Alice");
        alice.kana = Some("アリス".into());
        alice.attending = true;
        alice.checked_at = Some("2024-01-01T09:05:00Z".into());
        vec![alice, AttendanceRecord::new("E2", "Bob")]
    }

    #[test]
    fn test_roster_seal_open() {
        let cipher = PayloadCipher::new("s3cret").unwrap();
        let sealed = cipher.seal_roster(&roster()).unwrap();
        assert!(!sealed.contains("Alice"));
        assert_eq!(cipher.open_roster(&sealed).unwrap(), roster());
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let cipher = PayloadCipher::new("s3cret").unwrap();
        assert_ne!(cipher.seal_roster(&roster()).unwrap(), cipher.seal_roster(&roster()).unwrap());
    }

    #[test]
    fn test_compact_is_smaller_than_plain() {
        let plain = serde_json::to_vec(&roster()).unwrap();
        let compact: Vec<CompactRecord> = roster().iter().map(CompactRecord::from).collect();
        assert!(serde_json::to_vec(&compact).unwrap().len() < plain.len());
    }

    #[test]
    fn test_settings_seal_open() {
        let cipher = PayloadCipher::new("s3cret").unwrap();
        let mut settings = PublicSettings::default();
        settings.show_list = true;
        settings.public_columns.insert("kana".into(), true);

        let sealed = cipher.seal_settings(&settings).unwrap();
        assert_eq!(cipher.open_settings(&sealed).unwrap(), settings);
    }

    #[test]
    fn test_empty_opens_to_default() {
        let cipher = PayloadCipher::new("s3cret").unwrap();
        assert!(cipher.open_roster("").unwrap().is_empty());
        assert_eq!(cipher.open_settings("").unwrap(), PublicSettings::default());
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let sealed = PayloadCipher::new("right").unwrap().seal_roster(&roster()).unwrap();
        let err = PayloadCipher::new("wrong").unwrap().open_roster(&sealed).unwrap_err();
        assert_eq!(err, CipherError::Authentication);
    }

    #[test]
    fn test_garbage_input() {
        let cipher = PayloadCipher::new("s3cret").unwrap();
        assert!(matches!(cipher.open_roster("not base64!"), Err(CipherError::Base64(_))));
        assert_eq!(cipher.open_roster("AAAA"), Err(CipherError::Truncated(3)));
        assert_eq!(PayloadCipher::new("").unwrap_err(), CipherError::EmptySecret);
    }
}
