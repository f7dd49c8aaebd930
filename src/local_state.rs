//! Owner of every locally persisted key.
//!
//! Screens and services never touch `local_settings` directly: each key has
//! exactly one accessor here so reads and writes cannot drift apart.

use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::PoisonError;
use tracing::{debug, warn};

use crate::db::{self, DbState};
use crate::error::StoreError;

const CAT_SESSION: &str = "session";
const CAT_PAID_ITEMS: &str = "paid_items";
const CAT_PREFERENCES: &str = "preferences";

const KEY_RESTAURANT_ID: &str = "restaurant_id";
const KEY_USER_ID: &str = "user_id";
const KEY_ACTIVE_RESERVATION: &str = "active_reservation_id";
const KEY_DASHBOARD_FILTER: &str = "dashboard_filter";

pub struct LocalState {
    db: DbState,
}

impl LocalState {
    pub fn new(db: DbState) -> Self {
        Self { db }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(db::open_in_memory()?))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.db.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn read(&self, category: &str, key: &str) -> Option<String> {
        self.with_conn(|conn| Ok(db::get_setting(conn, category, key)))
            .ok()
            .flatten()
            .filter(|v| !v.trim().is_empty())
    }

    fn write(&self, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| db::set_setting(conn, category, key, value))
    }

    fn remove(&self, category: &str, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| db::delete_setting(conn, category, key))
    }

    // -- Session ------------------------------------------------------------

    pub fn restaurant_id(&self) -> Option<String> {
        self.read(CAT_SESSION, KEY_RESTAURANT_ID)
    }

    pub fn set_restaurant_id(&self, id: &str) -> Result<(), StoreError> {
        self.write(CAT_SESSION, KEY_RESTAURANT_ID, id)
    }

    /// Id of the logged-in staff member (sent as `serverId` on orders).
    pub fn user_id(&self) -> Option<String> {
        self.read(CAT_SESSION, KEY_USER_ID)
    }

    pub fn set_user_id(&self, id: &str) -> Result<(), StoreError> {
        self.write(CAT_SESSION, KEY_USER_ID, id)
    }

    pub fn active_reservation_id(&self) -> Option<String> {
        self.read(CAT_SESSION, KEY_ACTIVE_RESERVATION)
    }

    pub fn set_active_reservation_id(&self, id: &str) -> Result<(), StoreError> {
        debug!(reservation_id = id, "persisting active reservation");
        self.write(CAT_SESSION, KEY_ACTIVE_RESERVATION, id)
    }

    pub fn clear_active_reservation_id(&self) -> Result<(), StoreError> {
        self.remove(CAT_SESSION, KEY_ACTIVE_RESERVATION)
    }

    /// Drop everything tied to the logged-in session. Ledgers and
    /// preferences survive a logout.
    pub fn clear_session(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| db::delete_all_settings(conn, CAT_SESSION))
    }

    // -- Paid-items ledgers -------------------------------------------------

    /// Paid fingerprints recorded for a reservation. A corrupt entry reads
    /// as an empty ledger.
    pub fn paid_items(&self, reservation_id: &str) -> BTreeSet<String> {
        let Some(raw) = self.read(CAT_PAID_ITEMS, reservation_id) else {
            return BTreeSet::new();
        };
        match serde_json::from_str::<BTreeSet<String>>(&raw) {
            Ok(set) => set,
            Err(e) => {
                warn!(reservation_id, error = %e, "paid-items ledger is corrupt, ignoring");
                BTreeSet::new()
            }
        }
    }

    pub fn save_paid_items(
        &self,
        reservation_id: &str,
        items: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(items)?;
        self.write(CAT_PAID_ITEMS, reservation_id, &raw)
    }

    pub fn clear_paid_items(&self, reservation_id: &str) -> Result<(), StoreError> {
        self.remove(CAT_PAID_ITEMS, reservation_id)
    }

    /// Reservation ids that currently have a ledger.
    pub fn paid_item_reservations(&self) -> Vec<String> {
        self.with_conn(|conn| db::list_setting_keys(conn, CAT_PAID_ITEMS))
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to list paid-items ledgers");
                Vec::new()
            })
    }

    // -- Preferences --------------------------------------------------------

    pub fn dashboard_filter(&self) -> Option<String> {
        self.read(CAT_PREFERENCES, KEY_DASHBOARD_FILTER)
    }

    pub fn set_dashboard_filter(&self, value: &str) -> Result<(), StoreError> {
        self.write(CAT_PREFERENCES, KEY_DASHBOARD_FILTER, value)
    }
}
