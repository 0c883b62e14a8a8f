// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Instances the user entered by hand, persisted as a JSON object keyed by
// the instance name.

use std::collections::BTreeMap;

use repetier_core::error::{RepetierError, Result};
use repetier_core::types::{BasicAuth, InstanceDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::preferences::{SharedPreferences, lock};

/// Preference key holding the manual instance list.
pub const MANUAL_INSTANCES: &str = "Repetier/manual_instances";

/// One stored manual entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualInstance {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(rename = "useHttps", default)]
    pub use_https: bool,
    #[serde(rename = "userName", default)]
    pub user_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub repetier_id: String,
}

fn default_path() -> String {
    "/".into()
}

impl ManualInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            path: default_path(),
            use_https: false,
            user_name: String::new(),
            password: String::new(),
            repetier_id: String::new(),
        }
    }

    /// Descriptor for this entry, registered under `name`.
    pub fn to_descriptor(&self, name: &str) -> InstanceDescriptor {
        InstanceDescriptor::new(name, self.address.clone(), self.port)
            .with_path(&self.path)
            .with_https(self.use_https)
            .with_basic_auth(BasicAuth::from_parts(&self.user_name, &self.password))
            .with_repetier_id(Some(self.repetier_id.clone()))
            .manual()
    }
}

/// Persisted list of manual instances.
pub struct ManualInstanceStore {
    prefs: SharedPreferences,
    entries: BTreeMap<String, ManualInstance>,
}

impl ManualInstanceStore {
    /// Load from preferences. A value that is not a JSON object of entries
    /// is discarded.
    #[instrument(skip_all)]
    pub fn load(prefs: SharedPreferences) -> Self {
        let raw = lock(&prefs).get(MANUAL_INSTANCES).unwrap_or_default();
        let entries = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable manual instance list");
                BTreeMap::new()
            })
        };
        Self { prefs, entries }
    }

    /// Add or replace the entry called `name`.
    #[instrument(skip(self, entry), fields(address = %entry.address, port = entry.port))]
    pub fn add(&mut self, name: &str, entry: ManualInstance) -> Result<InstanceDescriptor> {
        if name.trim().is_empty() {
            return Err(RepetierError::InvalidDescriptor("empty instance name".into()));
        }
        if entry.address.trim().is_empty() {
            return Err(RepetierError::InvalidDescriptor(format!("{name}: empty address")));
        }
        let descriptor = entry.to_descriptor(name);
        self.entries.insert(name.to_owned(), entry);
        self.persist()?;
        info!("manual instance stored");
        Ok(descriptor)
    }

    /// Remove the entry called `name`. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        if self.entries.remove(name).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ManualInstance> {
        self.entries.get(name)
    }

    /// Descriptors for every stored entry, ordered by name.
    pub fn descriptors(&self) -> Vec<InstanceDescriptor> {
        self.entries
            .iter()
            .map(|(name, entry)| entry.to_descriptor(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string(&self.entries)?;
        lock(&self.prefs).set(MANUAL_INSTANCES, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{MemoryPreferences, Preferences, shared};

    #[test]
    fn entries_persist_with_host_field_names() {
        let prefs = shared(MemoryPreferences::new());
        let mut store = ManualInstanceStore::load(prefs.clone());

        let mut entry = ManualInstance::new("10.0.0.9", 3344);
        entry.use_https = true;
        entry.user_name = "proxy".into();
        entry.password = "pw".into();
        entry.repetier_id = "mk3".into();
        store.add("Workshop", entry).unwrap();

        let raw = lock(&prefs).get(MANUAL_INSTANCES).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["Workshop"]["address"], "10.0.0.9");
        assert_eq!(json["Workshop"]["useHttps"], true);
        assert_eq!(json["Workshop"]["userName"], "proxy");
        assert_eq!(json["Workshop"]["repetier_id"], "mk3");

        let reloaded = ManualInstanceStore::load(prefs);
        assert!(reloaded.contains("Workshop"));
    }

    #[test]
    fn descriptors_are_manual_and_normalised() {
        let mut store = ManualInstanceStore::load(shared(MemoryPreferences::new()));
        let mut entry = ManualInstance::new("printer.local", 80);
        entry.path = "repetier".into();
        store.add("Lab", entry).unwrap();

        let descs = store.descriptors();
        assert_eq!(descs.len(), 1);
        let desc = &descs[0];
        assert!(desc.manual);
        assert_eq!(desc.id, "Lab");
        assert_eq!(desc.path, "/repetier/");
        assert_eq!(desc.basic_auth, None);
        assert_eq!(desc.repetier_id, None);
    }

    #[test]
    fn partial_entries_take_defaults() {
        let mut mem = MemoryPreferences::new();
        mem.set(MANUAL_INSTANCES, r#"{"Old": {"address": "h", "port": 3344}}"#)
            .unwrap();
        let store = ManualInstanceStore::load(shared(mem));
        let entry = store.get("Old").unwrap();
        assert_eq!(entry.path, "/");
        assert!(!entry.use_https);
    }

    #[test]
    fn unreadable_list_starts_empty() {
        let mut mem = MemoryPreferences::new();
        mem.set(MANUAL_INSTANCES, "[]").unwrap();
        assert!(ManualInstanceStore::load(shared(mem)).is_empty());
    }

    #[test]
    fn add_rejects_blank_address() {
        let mut store = ManualInstanceStore::load(shared(MemoryPreferences::new()));
        let err = store.add("x", ManualInstance::new(" ", 1)).unwrap_err();
        assert!(matches!(err, RepetierError::InvalidDescriptor(_)));
    }

    #[test]
    fn remove_only_touches_named_entry() {
        let mut store = ManualInstanceStore::load(shared(MemoryPreferences::new()));
        store.add("a", ManualInstance::new("h1", 1)).unwrap();
        store.add("b", ManualInstance::new("h2", 2)).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.contains("b"));
    }
}
