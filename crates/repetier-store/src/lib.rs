// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persisted state of the Repetier link: the host's key/value preference
// storage, the instance-id → API key cache, and the list of instances the
// user entered by hand. Everything is stored as opaque string values under
// fixed preference keys.

pub mod credentials;
pub mod manual;
pub mod preferences;

pub use credentials::CredentialCache;
pub use manual::{ManualInstance, ManualInstanceStore};
pub use preferences::{JsonFilePreferences, MemoryPreferences, Preferences, SharedPreferences, shared};
