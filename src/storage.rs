//! Backend credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Only the backend
//! endpoint, its API key and the terminal id are kept here; everything else
//! lives in `local_settings`.

use keyring::Entry;
use tracing::{info, warn};

use crate::remote::normalize_backend_url;

const SERVICE_NAME: &str = "laundromat-pos";

// Credential keys
const KEY_BACKEND_URL: &str = "backend_url";
const KEY_API_KEY: &str = "backend_api_key";
const KEY_TERMINAL_ID: &str = "terminal_id";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_TERMINAL_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store cannot be read.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Connection details for the remote backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub backend_url: String,
    pub api_key: String,
    pub terminal_id: String,
}

impl std::fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("backend_url", &self.backend_url)
            .field("api_key", &"<redacted>")
            .field("terminal_id", &self.terminal_id)
            .finish()
    }
}

impl BackendCredentials {
    pub fn new(backend_url: &str, api_key: &str, terminal_id: &str) -> Self {
        Self {
            backend_url: normalize_backend_url(backend_url),
            api_key: api_key.trim().to_string(),
            terminal_id: terminal_id.trim().to_string(),
        }
    }

    /// Read all three values; `None` unless every one is present.
    pub fn load() -> Option<Self> {
        Some(Self {
            backend_url: get_credential(KEY_BACKEND_URL)?,
            api_key: get_credential(KEY_API_KEY)?,
            terminal_id: get_credential(KEY_TERMINAL_ID)?,
        })
    }

    pub fn save(&self) -> Result<(), String> {
        if self.backend_url.is_empty() || self.api_key.is_empty() || self.terminal_id.is_empty() {
            return Err("backend url, api key and terminal id are all required".to_string());
        }
        set_credential(KEY_BACKEND_URL, &self.backend_url)?;
        set_credential(KEY_API_KEY, &self.api_key)?;
        set_credential(KEY_TERMINAL_ID, &self.terminal_id)?;
        info!(terminal_id = %self.terminal_id, "backend credentials updated");
        Ok(())
    }
}

/// The terminal can sync once backend URL, API key and terminal id exist.
pub fn is_configured() -> bool {
    ALL_KEYS.iter().all(|key| get_credential(key).is_some())
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<(), String> {
    info!("performing factory reset, deleting backend credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_fields() {
        let creds = BackendCredentials::new(" demo.example.co/ ", " key ", " t-1 ");
        assert_eq!(creds.backend_url, "https://demo.example.co");
        assert_eq!(creds.api_key, "key");
        assert_eq!(creds.terminal_id, "t-1");
    }

    #[test]
    fn test_save_rejects_missing_fields() {
        let creds = BackendCredentials::new("demo.example.co", "", "t-1");
        assert!(creds.save().is_err());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let creds = BackendCredentials::new("demo.example.co", "secret-key", "t-1");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("secret-key"));
        assert!(shown.contains("redacted"));
    }
}
