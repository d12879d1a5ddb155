//! Terminal configuration.
//!
//! Sync tunables live in the `local_settings` table under the `sync`
//! category so an administrator can adjust them per device. Missing or
//! unparseable values fall back to the defaults.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::db;
use crate::error::StoreError;
use crate::store::LocalStore;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "LAUNDROMAT_POS_DATA_DIR";

const APP_DIR_NAME: &str = "laundromat-pos";
const SETTINGS_CATEGORY: &str = "sync";

const KEY_CONFLICT_RETRIES: &str = "session_conflict_retries";
const KEY_TICKET_BATCH_SIZE: &str = "ticket_batch_size";
const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";
const KEY_CHECK_TIMEOUT: &str = "connectivity_timeout_secs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Extra session upsert attempts after an identifier collision.
    pub session_conflict_retries: u32,
    /// Tickets per upload request.
    pub ticket_batch_size: usize,
    pub request_timeout_secs: u64,
    /// Timeout of the HEAD request deciding online/offline.
    pub connectivity_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            session_conflict_retries: 2,
            ticket_batch_size: 5,
            request_timeout_secs: 20,
            connectivity_timeout_secs: 5,
        }
    }
}

fn read_or<T: FromStr>(conn: &Connection, key: &str, fallback: T) -> T {
    match db::get_setting(conn, SETTINGS_CATEGORY, key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparseable sync setting");
            fallback
        }),
        None => fallback,
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }

    pub fn from_conn(conn: &Connection) -> Self {
        let defaults = Self::default();
        let mut settings = Self {
            session_conflict_retries: read_or(
                conn,
                KEY_CONFLICT_RETRIES,
                defaults.session_conflict_retries,
            ),
            ticket_batch_size: read_or(conn, KEY_TICKET_BATCH_SIZE, defaults.ticket_batch_size),
            request_timeout_secs: read_or(
                conn,
                KEY_REQUEST_TIMEOUT,
                defaults.request_timeout_secs,
            ),
            connectivity_timeout_secs: read_or(
                conn,
                KEY_CHECK_TIMEOUT,
                defaults.connectivity_timeout_secs,
            ),
        };
        if settings.ticket_batch_size == 0 {
            warn!("ticket_batch_size of 0 is not usable, using default");
            settings.ticket_batch_size = defaults.ticket_batch_size;
        }
        settings
    }

    /// Load from the store, or defaults when it is unavailable.
    pub fn load(store: &LocalStore) -> Self {
        store
            .with_conn(|conn| Ok(Self::from_conn(conn)))
            .unwrap_or_else(|e| {
                warn!("Using default sync settings: {e}");
                Self::default()
            })
    }

    pub fn save(&self, store: &LocalStore) -> Result<(), StoreError> {
        store.with_conn(|conn| {
            db::set_setting(
                conn,
                SETTINGS_CATEGORY,
                KEY_CONFLICT_RETRIES,
                &self.session_conflict_retries.to_string(),
            )?;
            db::set_setting(
                conn,
                SETTINGS_CATEGORY,
                KEY_TICKET_BATCH_SIZE,
                &self.ticket_batch_size.to_string(),
            )?;
            db::set_setting(
                conn,
                SETTINGS_CATEGORY,
                KEY_REQUEST_TIMEOUT,
                &self.request_timeout_secs.to_string(),
            )?;
            db::set_setting(
                conn,
                SETTINGS_CATEGORY,
                KEY_CHECK_TIMEOUT,
                &self.connectivity_timeout_secs.to_string(),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

fn platform_data_base() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

/// Directory holding `laundromat.db` and the `logs/` folder.
pub fn data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => platform_data_base().join(APP_DIR_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serial_test::serial;

    #[test]
    fn test_defaults_when_nothing_stored() {
        let store = test_store();
        assert_eq!(SyncSettings::load(&store), SyncSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let store = test_store();
        let settings = SyncSettings {
            session_conflict_retries: 4,
            ticket_batch_size: 10,
            request_timeout_secs: 30,
            connectivity_timeout_secs: 2,
        };
        settings.save(&store).unwrap();
        assert_eq!(SyncSettings::load(&store), settings);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let store = test_store();
        store
            .with_conn(|conn| {
                db::set_setting(conn, SETTINGS_CATEGORY, KEY_TICKET_BATCH_SIZE, "0")?;
                db::set_setting(conn, SETTINGS_CATEGORY, KEY_CONFLICT_RETRIES, "lots")
            })
            .unwrap();

        let settings = SyncSettings::load(&store);
        assert_eq!(settings.ticket_batch_size, 5);
        assert_eq!(settings.session_conflict_retries, 2);
    }

    #[test]
    fn test_unavailable_store_uses_defaults() {
        let store = LocalStore::unavailable("no disk");
        assert_eq!(SyncSettings::load(&store), SyncSettings::default());
        assert!(SyncSettings::default().save(&store).is_err());
    }

    #[test]
    #[serial]
    fn test_data_dir_env_override() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/laundromat-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/laundromat-test"));

        std::env::set_var(DATA_DIR_ENV, "   ");
        assert!(data_dir().ends_with(APP_DIR_NAME));

        std::env::remove_var(DATA_DIR_ENV);
        assert!(data_dir().ends_with(APP_DIR_NAME));
    }
}
