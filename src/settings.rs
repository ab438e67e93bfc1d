//! Durable key/value settings with documented defaults.
//!
//! All values are strings on disk. Typed accessors below parse the keys the
//! core itself consumes and fall back to the default when a stored value is
//! unusable.

use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::database::{ClipStore, DbWriter};
use crate::error::StoreError;

pub const RETENTION_DAYS: &str = "retention_days";
pub const MAX_RECORDS: &str = "max_records";
pub const CAPTURE_IMAGES: &str = "capture_images";

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

const DEFAULTS: &[(&str, &str)] = &[
    (RETENTION_DAYS, "90"),
    (MAX_RECORDS, ""),
    (CAPTURE_IMAGES, "false"),
];

fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Lives in the clip store's database and shares its writer, so a
/// suspended store refuses settings changes too.
pub struct SettingsStore {
    writer: Arc<DbWriter>,
    cache: RwLock<HashMap<String, String>>,
}

impl SettingsStore {
    pub fn open(store: &ClipStore) -> Result<Self, StoreError> {
        let cache = {
            let conn = store.pool().get()?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )?;

            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            rows
        };
        debug!(count = cache.len(), "Loaded settings");

        Ok(Self {
            writer: store.writer().clone(),
            cache: RwLock::new(cache),
        })
    }

    /// Stored value, else the documented default, else `None`.
    pub fn get_setting(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(key)
            .cloned()
            .or_else(|| default_for(key).map(str::to_string))
    }

    /// Persist first, then update the cache, so a failed write changes nothing.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::Invalid("setting key cannot be empty".to_string()));
        }

        self.writer.run(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        debug!(key = %key, value = %value, "Saved setting");
        Ok(())
    }

    pub fn retention_days(&self) -> i64 {
        let raw = self.get_setting(RETENTION_DAYS).unwrap_or_default();
        match raw.trim().parse::<i64>() {
            Ok(days) if days >= 1 => days,
            _ => {
                warn!(value = %raw, "Invalid retention_days, using default");
                DEFAULT_RETENTION_DAYS
            }
        }
    }

    /// `None` means unlimited.
    pub fn max_records(&self) -> Option<usize> {
        let raw = self.get_setting(MAX_RECORDS).unwrap_or_default();
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse::<usize>() {
            Ok(max) if max > 0 => Some(max),
            _ => {
                warn!(value = %raw, "Invalid max_records, treating as unlimited");
                None
            }
        }
    }

    pub fn capture_images(&self) -> bool {
        let raw = self.get_setting(CAPTURE_IMAGES).unwrap_or_default();
        matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
    }

    /// Whether `key` has been written explicitly, as opposed to defaulted.
    pub fn is_set(&self, key: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn open_store(dir: &Path) -> ClipStore {
        ClipStore::open(&dir.join("clips.db"), &dir.join("images")).unwrap()
    }

    fn open_temp() -> (tempfile::TempDir, ClipStore, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let settings = SettingsStore::open(&store).unwrap();
        (dir, store, settings)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let (_dir, _store, settings) = open_temp();
        assert_eq!(settings.get_setting(RETENTION_DAYS).as_deref(), Some("90"));
        assert_eq!(settings.get_setting("unknown"), None);
        assert_eq!(settings.retention_days(), 90);
        assert_eq!(settings.max_records(), None);
        assert!(!settings.capture_images());
        assert!(!settings.is_set(RETENTION_DAYS));
    }

    #[test]
    fn set_is_visible_immediately_and_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let settings = SettingsStore::open(&open_store(dir.path())).unwrap();
            settings.set_setting(RETENTION_DAYS, "30").unwrap();
            settings.set_setting("theme", "dark").unwrap();
            assert_eq!(settings.retention_days(), 30);
        }

        let settings = SettingsStore::open(&open_store(dir.path())).unwrap();
        assert_eq!(settings.retention_days(), 30);
        assert_eq!(settings.get_setting("theme").as_deref(), Some("dark"));
    }

    #[test]
    fn bad_values_fall_back() {
        let (_dir, _store, settings) = open_temp();
        settings.set_setting(RETENTION_DAYS, "0").unwrap();
        assert_eq!(settings.retention_days(), DEFAULT_RETENTION_DAYS);
        settings.set_setting(RETENTION_DAYS, "soon").unwrap();
        assert_eq!(settings.retention_days(), DEFAULT_RETENTION_DAYS);
        settings.set_setting(MAX_RECORDS, "-5").unwrap();
        assert_eq!(settings.max_records(), None);
        settings.set_setting(MAX_RECORDS, " 200 ").unwrap();
        assert_eq!(settings.max_records(), Some(200));
    }

    #[test]
    fn capture_images_parses_common_spellings() {
        let (_dir, _store, settings) = open_temp();
        settings.set_setting(CAPTURE_IMAGES, "TRUE").unwrap();
        assert!(settings.capture_images());
        settings.set_setting(CAPTURE_IMAGES, "off").unwrap();
        assert!(!settings.capture_images());
    }

    #[test]
    fn suspended_store_refuses_setting_changes() {
        let (_dir, store, settings) = open_temp();
        settings.set_setting(RETENTION_DAYS, "30").unwrap();
        store.suspend_writes_for_test();

        assert!(matches!(
            settings.set_setting(RETENTION_DAYS, "1"),
            Err(StoreError::WritesSuspended)
        ));
        assert_eq!(settings.retention_days(), 30);

        assert!(store.reconcile().unwrap());
        settings.set_setting(RETENTION_DAYS, "1").unwrap();
        assert_eq!(settings.retention_days(), 1);
    }

    #[test]
    fn empty_key_is_rejected() {
        let (_dir, _store, settings) = open_temp();
        assert!(matches!(settings.set_setting("  ", "x"), Err(StoreError::Invalid(_))));
    }
}
