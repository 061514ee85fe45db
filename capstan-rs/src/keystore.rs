//! Contract of the project keystore used to decrypt per-playbook secrets.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("unknown project key `{0}`")]
    UnknownKey(String),
    #[error("could not decrypt secret: {0}")]
    Decrypt(String),
}

pub trait Keystore: Send + Sync {
    /// Decrypt an opaque secret blob with the project key named by
    /// `key_ref`, yielding the secret's structured value.
    fn decrypt(&self, key_ref: &str, blob: &str) -> Result<serde_json::Value, KeystoreError>;
}

/// Passthrough keystore: blobs are plain JSON. Used in tests and in
/// deployments that terminate encryption elsewhere.
#[derive(Default, Debug, Clone, Copy)]
pub struct PlainKeystore;

impl Keystore for PlainKeystore {
    fn decrypt(&self, _key_ref: &str, blob: &str) -> Result<serde_json::Value, KeystoreError> {
        serde_json::from_str(blob).map_err(|err| KeystoreError::Decrypt(err.to_string()))
    }
}
