// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plugin configuration and the per-machine preferences the host hands over.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Metadata keys the host stores on the selected machine.
pub mod keys {
    pub const INSTANCE_ID: &str = "id";
    pub const API_KEY: &str = "repetier_api_key";
    pub const AUTO_PRINT: &str = "repetier_auto_print";
    pub const STORE_PRINT: &str = "repetier_store_print";
    pub const STORE_GROUP: &str = "repetier_store_group";
    pub const STORE_SD: &str = "Repetier_store_sd";
    pub const SHOW_CAMERA: &str = "repetier_show_camera";
    pub const WEBCAM_FLIP_Y: &str = "repetier_webcamflip_y";
    pub const WEBCAM_FLIP_X: &str = "repetier_webcamflip_x";
    pub const WEBCAM_ROT_90: &str = "repetier_webcamrot_90";
    pub const WEBCAM_ROT_180: &str = "repetier_webcamrot_180";
    pub const WEBCAM_ROT_270: &str = "repetier_webcamrot_270";
}

/// Process-wide settings for the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Host application name, first part of the `User-Agent`.
    pub app_name: String,
    /// Host application version.
    pub app_version: String,
    /// Version of this integration.
    pub plugin_version: String,
    /// Interval between state/job polls while connected.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Base timeout: per-request limit and the silence threshold before a
    /// session drops into the error state.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Silence after which the transport is thrown away and rebuilt. Scaled by
    /// the session's retry counter.
    #[serde(with = "millis")]
    pub recreate_transport_after: Duration,
    /// How often a dead mDNS listener is restarted.
    #[serde(with = "millis")]
    pub discovery_keepalive: Duration,
    /// Poll cadence of a pending API-key pairing request.
    #[serde(with = "millis")]
    pub pairing_poll_interval: Duration,
    /// mDNS service type browsed for Repetier-Server instances.
    pub service_type: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            app_name: "cura".into(),
            app_version: "5.0.0".into(),
            plugin_version: env!("CARGO_PKG_VERSION").into(),
            poll_interval: Duration::from_millis(2000),
            request_timeout: Duration::from_secs(10),
            recreate_transport_after: Duration::from_secs(30),
            discovery_keepalive: Duration::from_millis(2000),
            pairing_poll_interval: Duration::from_millis(500),
            service_type: "_repetier._tcp.local.".into(),
        }
    }
}

impl PluginConfig {
    /// `User-Agent` sent on every request.
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} RepetierIntegration/{}",
            self.app_name, self.app_version, self.plugin_version
        )
    }
}

/// Per-machine preferences stored by the host next to the selected printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterPreferences {
    /// Start printing right after the upload finishes.
    pub auto_print: bool,
    /// Store the upload in a model group.
    pub store_print: bool,
    /// Model group used when `store_print` is set.
    pub store_group: String,
    /// Prefer the printer's SD card when the server supports it.
    pub store_sd: bool,
    pub show_camera: bool,
    pub webcam_flip_y: bool,
    pub webcam_flip_x: bool,
    pub webcam_rot_90: bool,
    pub webcam_rot_180: bool,
    pub webcam_rot_270: bool,
}

impl Default for PrinterPreferences {
    fn default() -> Self {
        Self {
            auto_print: true,
            store_print: false,
            store_group: "#".into(),
            store_sd: false,
            show_camera: true,
            webcam_flip_y: false,
            webcam_flip_x: false,
            webcam_rot_90: false,
            webcam_rot_180: false,
            webcam_rot_270: false,
        }
    }
}

impl PrinterPreferences {
    /// Read preferences from the host's string metadata, falling back to the
    /// defaults for missing entries.
    pub fn from_metadata(meta: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| meta.get(key).map(|v| parse_bool(v)).unwrap_or(default);

        Self {
            auto_print: flag(keys::AUTO_PRINT, defaults.auto_print),
            store_print: flag(keys::STORE_PRINT, defaults.store_print),
            store_group: meta
                .get(keys::STORE_GROUP)
                .cloned()
                .unwrap_or(defaults.store_group),
            store_sd: flag(keys::STORE_SD, defaults.store_sd),
            show_camera: flag(keys::SHOW_CAMERA, defaults.show_camera),
            webcam_flip_y: flag(keys::WEBCAM_FLIP_Y, false),
            webcam_flip_x: flag(keys::WEBCAM_FLIP_X, false),
            webcam_rot_90: flag(keys::WEBCAM_ROT_90, false),
            webcam_rot_180: flag(keys::WEBCAM_ROT_180, false),
            webcam_rot_270: flag(keys::WEBCAM_ROT_270, false),
        }
    }
}

/// The machine the host currently has selected, passed explicitly into
/// `SessionRegistry::recheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMachine {
    pub instance_id: String,
    pub api_key: String,
    pub preferences: PrinterPreferences,
}

impl ActiveMachine {
    pub fn new(instance_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            api_key: api_key.into(),
            preferences: PrinterPreferences::default(),
        }
    }

    /// Build from the host's metadata map (`id`, `repetier_api_key`
    /// and the preference keys).
    pub fn from_metadata(meta: &HashMap<String, String>) -> Option<Self> {
        let instance_id = meta.get(keys::INSTANCE_ID)?.clone();
        Some(Self {
            instance_id,
            api_key: meta.get(keys::API_KEY).cloned().unwrap_or_default(),
            preferences: PrinterPreferences::from_metadata(meta),
        })
    }
}

/// Lenient boolean parsing matching the host's preference values.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
