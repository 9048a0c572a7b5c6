//! Curve-key admission registry and key file handling.
//!
//! The registry is the one deliberately process-global piece of state in
//! Convoy: key admission mirrors the transport library's own global auth
//! table in the reference deployment. Keys are 32-byte curve keys carried
//! as Z85 text.

use std::sync::OnceLock;

use dashmap::DashSet;
use tracing::{info, warn};

use crate::error::PipeError;

/// Environment toggle that disables authentication entirely.
pub const ENV_DISABLE_AUTH: &str = "DISABLE_AUTH";

/// Environment override for the server private key path.
pub const ENV_PRIVATE_KEY: &str = "PRIVATE_KEY";

/// Environment override for the server public key path.
pub const ENV_PUBLIC_KEY: &str = "PUBLIC_KEY";

/// Default server private key path.
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "./manager.key";

/// Default server public key path.
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "./manager.pub";

const KEY_BYTES: usize = 32;

/// Admitted client public keys.
#[derive(Debug, Default)]
pub struct AuthRegistry {
    keys: DashSet<String>,
}

impl AuthRegistry {
    /// Create an empty registry. Production code uses [`global`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a batch of client keys, mapped from client name to Z85 key.
    /// Keys that fail to decode are skipped with a warning, the rest are
    /// admitted. Returns how many were added.
    pub fn add_keys<'a>(&self, keys: impl IntoIterator<Item = (&'a str, &'a str)>) -> usize {
        let mut added = 0;
        for (client, key) in keys {
            match decode_key(key) {
                Ok(_) => {
                    self.keys.insert(key.to_owned());
                    added += 1;
                }
                Err(e) => {
                    warn!(client = %client, error = %e, "unable to decode client key");
                }
            }
        }
        info!(count = added, "admitted client keys");
        added
    }

    /// Withdraw one client key.
    pub fn remove_key(&self, key: &str) {
        self.keys.remove(key);
        info!("removed client key");
    }

    /// True when `key` has been admitted.
    #[must_use]
    pub fn is_admitted(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// The process-global registry.
pub fn global() -> &'static AuthRegistry {
    static REGISTRY: OnceLock<AuthRegistry> = OnceLock::new();
    REGISTRY.get_or_init(AuthRegistry::new)
}

/// Decode and validate a Z85 curve key.
pub fn decode_key(encoded: &str) -> Result<Vec<u8>, PipeError> {
    let decoded = z85::decode(encoded.trim())
        .map_err(|e| PipeError::InvalidKey(format!("not Z85: {e}")))?;
    if decoded.len() != KEY_BYTES {
        return Err(PipeError::InvalidKey(format!(
            "expected {KEY_BYTES} key bytes, got {}",
            decoded.len()
        )));
    }
    Ok(decoded)
}

/// Encode a raw curve key as Z85 text.
#[must_use]
pub fn encode_key(raw: &[u8]) -> String {
    z85::encode(raw)
}

/// Read a key file, taking the path from `env_var` when set and falling
/// back to `default_path`. The file content is trimmed.
pub fn read_key_file(env_var: &str, default_path: &str) -> Result<String, PipeError> {
    let path = std::env::var(env_var).unwrap_or_else(|_| default_path.to_owned());
    let content = std::fs::read_to_string(&path)
        .map_err(|e| PipeError::InvalidKey(format!("error reading {path}: {e}")))?;
    Ok(content.trim().to_owned())
}

/// True when the deployment toggle disables authentication.
#[must_use]
pub fn disabled_by_env() -> bool {
    matches!(
        std::env::var(ENV_DISABLE_AUTH).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("True")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // 32 bytes encode to exactly 40 Z85 characters.
    const GOOD_KEY: &str = "rq:rM>}U?@Lns47E1%kR.o@n%FcmmsL/@{H8]yf7";

    #[test]
    fn decode_valid_key() {
        let raw = decode_key(GOOD_KEY).expect("decode");
        assert_eq!(raw.len(), 32);
        assert_eq!(encode_key(&raw), GOOD_KEY);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode_key("HelloWorld").is_err());
        assert!(decode_key("").is_err());
    }

    #[test]
    fn admit_and_withdraw() {
        let registry = AuthRegistry::new();
        assert!(!registry.is_admitted(GOOD_KEY));

        let added = registry.add_keys([("agent-1", GOOD_KEY), ("agent-2", "garbage")]);
        assert_eq!(added, 1);
        assert!(registry.is_admitted(GOOD_KEY));

        registry.remove_key(GOOD_KEY);
        assert!(!registry.is_admitted(GOOD_KEY));
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manager.pub");
        std::fs::write(&path, format!("{GOOD_KEY}\n")).expect("write");

        let var = "CONVOY_TEST_PUBLIC_KEY";
        std::env::set_var(var, &path);
        let key = read_key_file(var, "./nonexistent").expect("read");
        std::env::remove_var(var);
        assert_eq!(key, GOOD_KEY);
    }
}
