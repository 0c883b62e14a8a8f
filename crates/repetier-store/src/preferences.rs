// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Host preference storage.
//
// The host owns a flat string key/value store. The link only ever reads and
// rewrites whole values, so the trait is deliberately tiny.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use repetier_core::error::{RepetierError, Result};
use tracing::{debug, instrument, warn};

/// String key/value storage provided by the host.
pub trait Preferences: Send {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Replace the value stored under `key`.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// Preferences shared between the stores of one process.
pub type SharedPreferences = Arc<Mutex<dyn Preferences>>;

/// Wrap a preference backend for sharing.
pub fn shared(prefs: impl Preferences + 'static) -> SharedPreferences {
    Arc::new(Mutex::new(prefs))
}

/// Lock shared preferences, recovering from a poisoned lock. The stored
/// values are plain strings, so a panic mid-write cannot leave them torn.
pub(crate) fn lock(prefs: &SharedPreferences) -> MutexGuard<'_, dyn Preferences + 'static> {
    prefs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory preferences, used in tests and when the host provides none.
#[derive(Debug, Default, Clone)]
pub struct MemoryPreferences {
    values: HashMap<String, String>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Preferences persisted as a JSON object in a single file. Every `set`
/// rewrites the file.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFilePreferences {
    /// Open (or lazily create) the preference file at `path`.
    ///
    /// A missing file starts empty; an unreadable one is reported as an error
    /// rather than silently discarded.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                warn!(error = %e, "preference file is not a JSON object");
                RepetierError::Preferences(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(RepetierError::Io(e)),
        };
        debug!(entries = values.len(), "preferences loaded");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl Preferences for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_preferences_overwrite_values() {
        let mut prefs = MemoryPreferences::new();
        assert_eq!(prefs.get("a"), None);
        prefs.set("a", "1").unwrap();
        prefs.set("a", "2").unwrap();
        assert_eq!(prefs.get("a").as_deref(), Some("2"));
    }

    #[test]
    fn file_preferences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let mut prefs = JsonFilePreferences::open(&path).unwrap();
        prefs.set("Repetier/keys_cache", "abc").unwrap();

        let reopened = JsonFilePreferences::open(&path).unwrap();
        assert_eq!(reopened.get("Repetier/keys_cache").as_deref(), Some("abc"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            JsonFilePreferences::open(&path),
            Err(RepetierError::Preferences(_))
        ));
    }

    #[test]
    fn shared_preferences_are_visible_to_all_holders() {
        let prefs = shared(MemoryPreferences::new());
        let other = Arc::clone(&prefs);
        lock(&prefs).set("k", "v").unwrap();
        assert_eq!(lock(&other).get("k").as_deref(), Some("v"));
    }
}
