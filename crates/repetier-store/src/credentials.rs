// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Instance-id → API key cache.
//
// Stored under a single preference key as base64-encoded JSON. Older
// installations wrote plain JSON, so that is accepted on load too. Anything
// else is discarded and the cache starts empty.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use repetier_core::error::Result;
use tracing::{debug, instrument, warn};

use crate::preferences::{SharedPreferences, lock};

/// Preference key holding the encoded cache.
pub const KEYS_CACHE: &str = "Repetier/keys_cache";

/// Remembers the API key last used for each instance id.
pub struct CredentialCache {
    prefs: SharedPreferences,
    keys: BTreeMap<String, String>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("instances", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialCache {
    /// Load the cache from preferences.
    #[instrument(skip_all)]
    pub fn load(prefs: SharedPreferences) -> Self {
        let raw = lock(&prefs).get(KEYS_CACHE).unwrap_or_default();
        let keys = decode(&raw);
        debug!(entries = keys.len(), "API key cache loaded");
        Self { prefs, keys }
    }

    /// Cached key for `instance_id`.
    pub fn get(&self, instance_id: &str) -> Option<&str> {
        self.keys.get(instance_id).map(String::as_str)
    }

    /// Remember `api_key` for `instance_id` and persist the whole cache.
    #[instrument(skip(self, api_key))]
    pub fn set(&mut self, instance_id: &str, api_key: &str) -> Result<()> {
        self.keys.insert(instance_id.to_owned(), api_key.to_owned());
        self.persist()
    }

    /// Forget the key for `instance_id`. Returns whether one was cached.
    pub fn remove(&mut self, instance_id: &str) -> Result<bool> {
        if self.keys.remove(instance_id).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let encoded = encode(&self.keys)?;
        lock(&self.prefs).set(KEYS_CACHE, &encoded)
    }
}

fn encode(keys: &BTreeMap<String, String>) -> Result<String> {
    let json = serde_json::to_string(keys)?;
    Ok(STANDARD.encode(json))
}

fn decode(raw: &str) -> BTreeMap<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return BTreeMap::new();
    }

    if let Some(keys) = STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        return keys;
    }

    // Legacy plain JSON.
    match serde_json::from_str(raw) {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "discarding unreadable API key cache");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{MemoryPreferences, Preferences, shared};

    fn prefs_with(value: &str) -> SharedPreferences {
        let mut mem = MemoryPreferences::new();
        mem.set(KEYS_CACHE, value).unwrap();
        shared(mem)
    }

    #[test]
    fn set_persists_base64_json() {
        let prefs = shared(MemoryPreferences::new());
        let mut cache = CredentialCache::load(prefs.clone());
        cache.set("office", "abc123").unwrap();

        let stored = lock(&prefs).get(KEYS_CACHE).unwrap();
        let json = STANDARD.decode(stored).unwrap();
        let map: BTreeMap<String, String> = serde_json::from_slice(&json).unwrap();
        assert_eq!(map.get("office").map(String::as_str), Some("abc123"));

        let reloaded = CredentialCache::load(prefs);
        assert_eq!(reloaded.get("office"), Some("abc123"));
    }

    #[test]
    fn legacy_plain_json_is_accepted() {
        let cache = CredentialCache::load(prefs_with(r#"{"lab": "k1"}"#));
        assert_eq!(cache.get("lab"), Some("k1"));
    }

    #[test]
    fn garbage_yields_empty_cache() {
        assert!(CredentialCache::load(prefs_with("%%% not a cache")).is_empty());
        // Valid base64 and valid JSON, but not an object.
        assert!(CredentialCache::load(prefs_with(&STANDARD.encode("[1,2]"))).is_empty());
        assert!(CredentialCache::load(prefs_with("")).is_empty());
    }

    #[test]
    fn remove_reports_whether_key_existed() {
        let mut cache = CredentialCache::load(shared(MemoryPreferences::new()));
        cache.set("a", "1").unwrap();
        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn debug_output_omits_keys() {
        let mut cache = CredentialCache::load(shared(MemoryPreferences::new()));
        cache.set("office", "secret-key").unwrap();
        let dbg = format!("{cache:?}");
        assert!(dbg.contains("office"));
        assert!(!dbg.contains("secret-key"));
    }
}
