//! Credential bags at rest.
//!
//! When `COURIER_CREDENTIAL_KEY` is set, bags are sealed with AES-256-GCM
//! and stored as `enc:v1:<base64(nonce || ciphertext)>`. Without a key the
//! bag is plain JSON; a sealed bag read without a key is an error rather
//! than a silent fallback.

use aes_gcm::Aes256Gcm;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::AeadCore;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::OsRng;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde_json::Map;
use serde_json::Value;

use crate::error::CourierErr;
use crate::error::Result;
use crate::flags::COURIER_CREDENTIAL_KEY;

const SEALED_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

fn cipher() -> Result<Option<Aes256Gcm>> {
    let Some(encoded) = *COURIER_CREDENTIAL_KEY else {
        return Ok(None);
    };
    let key_bytes = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| CourierErr::Credentials(format!("credential key is not base64: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|_| CourierErr::Credentials("credential key must be 32 bytes".to_string()))?;
    Ok(Some(cipher))
}

/// Decrypt (or just parse) a stored credential column into a bag.
pub fn open_bag(raw: &str) -> Result<Map<String, Value>> {
    if raw.is_empty() {
        return Ok(Map::new());
    }

    let plaintext = match raw.strip_prefix(SEALED_PREFIX) {
        Some(sealed) => {
            let Some(cipher) = cipher()? else {
                return Err(CourierErr::Credentials(
                    "credentials are sealed but no credential key is configured".to_string(),
                ));
            };
            let blob = BASE64_STANDARD
                .decode(sealed.as_bytes())
                .map_err(|e| CourierErr::Credentials(format!("sealed bag is not base64: {e}")))?;
            if blob.len() <= NONCE_LEN {
                return Err(CourierErr::Credentials("sealed bag is truncated".to_string()));
            }
            let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
            let decrypted = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CourierErr::Credentials("credential decryption failed".to_string()))?;
            String::from_utf8(decrypted)
                .map_err(|_| CourierErr::Credentials("decrypted bag is not UTF-8".to_string()))?
        }
        None => raw.to_string(),
    };

    match serde_json::from_str::<Value>(&plaintext) {
        Ok(Value::Object(bag)) => Ok(bag),
        Ok(_) => Err(CourierErr::Credentials(
            "credential bag is not a JSON object".to_string(),
        )),
        Err(e) => Err(CourierErr::Credentials(format!(
            "credential bag is not valid JSON: {e}"
        ))),
    }
}

/// Serialize a bag for storage, sealing it when a key is configured.
pub fn seal_bag(bag: &Map<String, Value>) -> Result<String> {
    let plaintext = serde_json::to_string(bag)?;
    let Some(cipher) = cipher()? else {
        return Ok(plaintext);
    };

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CourierErr::Credentials("credential encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(format!("{SEALED_PREFIX}{}", BASE64_STANDARD.encode(blob)))
}
