#![deny(missing_docs)]
//! Credential decryption and environment assembly for the persona
//! orchestrator (§4.3 step 2).
//!
//! This crate defines [`SecretValue`], a zeroize-backed in-memory secret
//! wrapper with scoped exposure (no `Display`, no `Clone`, memory zeroed
//! on drop), the [`MasterKey`]/[`EncryptedCredential`] pair used to
//! decrypt per-persona credentials with AES-256-GCM, and
//! [`CredentialMaterializer`], which turns a persona's bound credentials
//! and model-profile overrides into the environment map handed to a
//! worker in `assign`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use persona_types::ModelProfile;
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Errors from credential decryption and materialization.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SecretError {
    /// The ciphertext was not valid base64, or too short to contain a nonce.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// AES-GCM rejected the ciphertext (wrong key, tampered data, wrong nonce).
    #[error("decryption failed")]
    DecryptionFailed,

    /// The master key bytes were not exactly 32 bytes.
    #[error("invalid master key length: expected 32 bytes, got {0}")]
    InvalidMasterKey(usize),
}

/// A decrypted credential's plaintext bytes (a bearer token, an API key, a
/// client secret) between [`decrypt_credential`] producing it and
/// [`CredentialMaterializer::assemble_env`] copying it into a worker's
/// environment map. Never implements `Display`, `Clone`, `Serialize`, or
/// `PartialEq`, so it cannot end up in a log line, a trace span, or a
/// second live copy by accident; the wrapped buffer is zeroed on drop via
/// [`Zeroizing`] so the plaintext doesn't linger once the env map is built.
///
/// [`SecretValue::with_bytes`] is the only way to reach the plaintext — the
/// caller's closure sees a `&[u8]` borrow that cannot outlive the call.
pub struct SecretValue {
    inner: Zeroizing<Vec<u8>>,
}

impl SecretValue {
    /// Wrap already-decrypted plaintext. Takes ownership of the buffer
    /// rather than copying it.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Zeroizing::new(bytes),
        }
    }

    /// Run `f` with a borrow of the plaintext. The only way in or out of
    /// the wrapper.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner)
    }

    /// Plaintext length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True for a zero-length credential (e.g. a blank bound secret).
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// No Display, Clone, Serialize, or PartialEq: a worker's decrypted
// credential should only ever flow into assemble_env's output map, never
// be duplicated, compared, or printed on its way there.

/// The operator's master key, held in process memory for the lifetime of
/// the orchestrator and used only inside [`CredentialMaterializer`].
pub struct MasterKey {
    bytes: Zeroizing<[u8; 32]>,
}

impl MasterKey {
    /// Build a master key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Build a master key from a slice, failing if it is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecretError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SecretError::InvalidMasterKey(bytes.len()))?;
        Ok(Self::from_bytes(array))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.bytes))
    }
}

/// An encrypted per-persona secret as stored at rest: base64-encoded
/// `nonce || ciphertext`.
#[derive(Debug, Clone)]
pub struct EncryptedCredential {
    /// Base64 (standard) encoding of `nonce (12 bytes) || ciphertext`.
    pub ciphertext_b64: String,
}

impl EncryptedCredential {
    /// Wrap an already-encoded ciphertext string.
    pub fn new(ciphertext_b64: impl Into<String>) -> Self {
        Self {
            ciphertext_b64: ciphertext_b64.into(),
        }
    }

    /// Encrypt plaintext with `key`, returning the stored form.
    pub fn encrypt(key: &MasterKey, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Self {
        let cipher = key.cipher();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .expect("AES-GCM encryption does not fail for well-formed inputs");
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(nonce);
        combined.extend_from_slice(&ciphertext);
        Self {
            ciphertext_b64: base64::engine::general_purpose::STANDARD.encode(combined),
        }
    }
}

/// Decrypt a stored credential with the operator's master key (§4.3 step 2).
pub fn decrypt_credential(
    key: &MasterKey,
    credential: &EncryptedCredential,
) -> Result<SecretValue, SecretError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&credential.ciphertext_b64)
        .map_err(|e| SecretError::MalformedCiphertext(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(SecretError::MalformedCiphertext(
            "ciphertext shorter than nonce".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = key.cipher();
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SecretError::DecryptionFailed)?;
    Ok(SecretValue::new(plaintext))
}

/// A bound credential ready for materialization: its declared name (used
/// to derive the `CONNECTOR_<NAME>` env var family) and its ciphertext.
pub struct BoundCredential {
    /// Declared credential name, e.g. `"github"`.
    pub name: String,
    /// The encrypted secret.
    pub ciphertext: EncryptedCredential,
}

/// Default env var name carrying the bearer token (§4.3 step 2).
pub const BEARER_ENV_VAR: &str = "BEARER_TOKEN";

/// Turns bound credentials and a model-profile override into the
/// environment map handed to a worker in `assign`.
pub struct CredentialMaterializer<'a> {
    master_key: &'a MasterKey,
}

/// Result of assembling a worker environment: the env map itself and the
/// base credential names used, surfaced to the prompt assembler as
/// `credentialHints`.
pub struct AssembledEnv {
    /// The environment variables to hand the worker.
    pub env: BTreeMap<String, String>,
    /// Base credential names that were materialized, in bind order.
    pub credential_hints: Vec<String>,
}

impl<'a> CredentialMaterializer<'a> {
    /// Build a materializer over the given master key.
    pub fn new(master_key: &'a MasterKey) -> Self {
        Self { master_key }
    }

    /// Assemble the worker environment (§4.3 step 2).
    ///
    /// Starts from `{BEARER_ENV_VAR: token}`, decrypts each bound
    /// credential and injects it either as a flat `CONNECTOR_<NAME>` value
    /// or, when the plaintext parses as a flat string-valued JSON object,
    /// as one `CONNECTOR_<NAME>_<FIELD>` per field. Finally applies the
    /// persona's model-profile overrides, which may remove the default
    /// bearer env var.
    pub fn assemble_env(
        &self,
        bearer_token: &str,
        credentials: &[BoundCredential],
        model_profile: Option<&ModelProfile>,
    ) -> AssembledEnv {
        let mut env = BTreeMap::new();
        env.insert(BEARER_ENV_VAR.to_string(), bearer_token.to_string());

        let mut credential_hints = Vec::with_capacity(credentials.len());
        for cred in credentials {
            let base_name = format!("CONNECTOR_{}", cred.name.to_uppercase());
            credential_hints.push(base_name.clone());

            let plaintext = match decrypt_credential(self.master_key, &cred.ciphertext) {
                Ok(value) => value,
                Err(_) => continue,
            };

            plaintext.with_bytes(|bytes| {
                let as_fields = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
                    .and_then(|v| v.as_object().cloned())
                    .filter(|obj| obj.values().all(|v| v.is_string()));

                match as_fields {
                    Some(fields) => {
                        for (field, value) in fields {
                            let value = value.as_str().unwrap_or_default();
                            env.insert(
                                format!("{}_{}", base_name, field.to_uppercase()),
                                value.to_string(),
                            );
                        }
                    }
                    None => {
                        env.insert(base_name.clone(), String::from_utf8_lossy(bytes).into_owned());
                    }
                }
            });
        }

        apply_model_profile_overrides(&mut env, model_profile);

        AssembledEnv {
            env,
            credential_hints,
        }
    }
}

fn apply_model_profile_overrides(env: &mut BTreeMap<String, String>, profile: Option<&ModelProfile>) {
    match profile {
        None | Some(ModelProfile::Default) => {}
        Some(ModelProfile::Ollama { base_url }) => {
            env.remove(BEARER_ENV_VAR);
            env.insert("OLLAMA_BASE_URL".to_string(), base_url.clone());
        }
        Some(ModelProfile::Litellm {
            base_url,
            auth_env_var,
        }) => {
            let token = env.remove(BEARER_ENV_VAR);
            env.insert("LITELLM_BASE_URL".to_string(), base_url.clone());
            if let Some(token) = token {
                env.insert(auth_env_var.clone(), token);
            }
        }
        Some(ModelProfile::Custom {
            base_url_env_var,
            base_url,
            auth_env_var,
        }) => {
            let token = env.remove(BEARER_ENV_VAR);
            env.insert(base_url_env_var.clone(), base_url.clone());
            if let Some(token) = token {
                env.insert(auth_env_var.clone(), token);
            }
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::from_bytes([7u8; 32])
    }

    #[test]
    fn secret_value_debug_is_redacted() {
        let secret = SecretValue::new(b"super-secret-key".to_vec());
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let k = key();
        let nonce = [1u8; NONCE_LEN];
        let cred = EncryptedCredential::encrypt(&k, b"hunter2", &nonce);
        let decrypted = decrypt_credential(&k, &cred).unwrap();
        decrypted.with_bytes(|b| assert_eq!(b, b"hunter2"));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let k = key();
        let other = MasterKey::from_bytes([9u8; 32]);
        let nonce = [1u8; NONCE_LEN];
        let cred = EncryptedCredential::encrypt(&k, b"hunter2", &nonce);
        assert!(matches!(
            decrypt_credential(&other, &cred),
            Err(SecretError::DecryptionFailed)
        ));
    }

    #[test]
    fn decrypt_malformed_base64_reports_malformed() {
        let k = key();
        let cred = EncryptedCredential::new("not-valid-base64!!!");
        assert!(matches!(
            decrypt_credential(&k, &cred),
            Err(SecretError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn assemble_env_starts_with_bearer_token() {
        let k = key();
        let materializer = CredentialMaterializer::new(&k);
        let assembled = materializer.assemble_env("tok-123", &[], None);
        assert_eq!(assembled.env.get(BEARER_ENV_VAR), Some(&"tok-123".to_string()));
        assert!(assembled.credential_hints.is_empty());
    }

    #[test]
    fn assemble_env_injects_flat_string_credential_as_base_name() {
        let k = key();
        let nonce = [2u8; NONCE_LEN];
        let cred = BoundCredential {
            name: "github".to_string(),
            ciphertext: EncryptedCredential::encrypt(&k, b"ghp_abc123", &nonce),
        };
        let materializer = CredentialMaterializer::new(&k);
        let assembled = materializer.assemble_env("tok", &[cred], None);
        assert_eq!(
            assembled.env.get("CONNECTOR_GITHUB"),
            Some(&"ghp_abc123".to_string())
        );
        assert_eq!(assembled.credential_hints, vec!["CONNECTOR_GITHUB"]);
    }

    #[test]
    fn assemble_env_expands_object_credential_into_fields() {
        let k = key();
        let nonce = [3u8; NONCE_LEN];
        let plaintext = serde_json::json!({"client_id": "abc", "client_secret": "xyz"}).to_string();
        let cred = BoundCredential {
            name: "oauth_app".to_string(),
            ciphertext: EncryptedCredential::encrypt(&k, plaintext.as_bytes(), &nonce),
        };
        let materializer = CredentialMaterializer::new(&k);
        let assembled = materializer.assemble_env("tok", &[cred], None);
        assert_eq!(
            assembled.env.get("CONNECTOR_OAUTH_APP_CLIENT_ID"),
            Some(&"abc".to_string())
        );
        assert_eq!(
            assembled.env.get("CONNECTOR_OAUTH_APP_CLIENT_SECRET"),
            Some(&"xyz".to_string())
        );
        assert!(assembled.env.get("CONNECTOR_OAUTH_APP").is_none());
    }

    #[test]
    fn ollama_profile_removes_bearer_and_sets_base_url() {
        let k = key();
        let materializer = CredentialMaterializer::new(&k);
        let profile = ModelProfile::Ollama {
            base_url: "http://localhost:11434".to_string(),
        };
        let assembled = materializer.assemble_env("tok", &[], Some(&profile));
        assert!(assembled.env.get(BEARER_ENV_VAR).is_none());
        assert_eq!(
            assembled.env.get("OLLAMA_BASE_URL"),
            Some(&"http://localhost:11434".to_string())
        );
    }

    #[test]
    fn litellm_profile_moves_token_to_custom_auth_var() {
        let k = key();
        let materializer = CredentialMaterializer::new(&k);
        let profile = ModelProfile::Litellm {
            base_url: "http://proxy.internal".to_string(),
            auth_env_var: "LITELLM_AUTH".to_string(),
        };
        let assembled = materializer.assemble_env("tok-456", &[], Some(&profile));
        assert!(assembled.env.get(BEARER_ENV_VAR).is_none());
        assert_eq!(
            assembled.env.get("LITELLM_AUTH"),
            Some(&"tok-456".to_string())
        );
        assert_eq!(
            assembled.env.get("LITELLM_BASE_URL"),
            Some(&"http://proxy.internal".to_string())
        );
    }
}
