//! Session credential storage.
//!
//! Access and refresh tokens live in the OS credential store (Keychain on
//! macOS, DPAPI-backed Credential Manager on Windows, Secret Service on
//! Linux) through the `keyring` crate. An in-memory store backs tests and
//! headless runs.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::StoreError;

const SERVICE_NAME: &str = "orderit-client";

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN];

/// Secret key/value storage for session credentials.
pub trait CredentialStore: Send + Sync {
    /// Returns `None` when the entry does not exist.
    fn get(&self, key: &str) -> Option<Zeroizing<String>>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Silently succeeds if the entry does not exist.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every session credential.
    fn clear(&self) -> Result<(), StoreError> {
        for key in ALL_KEYS {
            self.delete(key)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct KeyringStore;

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Option<Zeroizing<String>> {
        let entry = match Entry::new(SERVICE_NAME, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(Zeroizing::new(pw)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| StoreError::Keyring(e.to_string()))?;
        entry
            .set_password(value)
            .map_err(|e| StoreError::Keyring(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| StoreError::Keyring(e.to_string()))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for key in ALL_KEYS {
            self.delete(key)?;
        }
        info!("session credentials cleared from keyring");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Zeroizing<String>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_clears() {
        let store = MemoryStore::new();
        assert!(store.get(KEY_ACCESS_TOKEN).is_none());

        store.set(KEY_ACCESS_TOKEN, "a1").expect("set access");
        store.set(KEY_REFRESH_TOKEN, "r1").expect("set refresh");
        assert_eq!(store.get(KEY_ACCESS_TOKEN).as_deref().map(String::as_str), Some("a1"));

        store.clear().expect("clear");
        assert!(store.get(KEY_ACCESS_TOKEN).is_none());
        assert!(store.get(KEY_REFRESH_TOKEN).is_none());
    }

    #[test]
    fn deleting_missing_entry_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete("never-set").is_ok());
    }
}
