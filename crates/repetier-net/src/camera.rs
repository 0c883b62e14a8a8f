// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Webcam stream location and orientation.

use tracing::warn;

use repetier_core::config::PrinterPreferences;
use repetier_core::types::{CameraConfig, CameraOrientation, InstanceDescriptor, Rotation};

/// Placeholder the server uses for its own address in webcam URLs.
const LOOPBACK: &str = "127.0.0.1";

/// Resolve a server-provided webcam URL against the instance address.
///
/// Returns `(url, shares_proxy)`. Only a path on the instance's own port
/// shares the job API's proxy.
pub fn normalize_camera_url(raw: &str, instance: &InstanceDescriptor) -> (Option<String>, bool) {
    let url = raw.replace(LOOPBACK, &instance.host);
    let scheme = instance.scheme();

    if url.is_empty() {
        (None, false)
    } else if url.starts_with("http") {
        (Some(url), false)
    } else if url.starts_with("//") {
        (Some(format!("{scheme}:{url}")), false)
    } else if url.starts_with(':') {
        (Some(format!("{scheme}://{}{url}", instance.host)), false)
    } else if url.starts_with('/') {
        (
            Some(format!("{scheme}://{}:{}{url}", instance.host, instance.port)),
            true,
        )
    } else {
        warn!(url = %url, "unusable webcam stream URL");
        (None, false)
    }
}

/// Camera orientation from the host's webcam flags.
///
/// Flags are applied in a fixed order and each one that is set overwrites
/// the rotation chosen before it.
pub fn orientation(prefs: &PrinterPreferences) -> CameraOrientation {
    let mut result = CameraOrientation {
        mirror: prefs.webcam_flip_y,
        rotation: Rotation::None,
    };
    if prefs.webcam_flip_x {
        result.rotation = Rotation::Cw180;
        result.mirror = true;
    }
    if prefs.webcam_rot_90 {
        result.rotation = Rotation::Cw90;
    }
    if prefs.webcam_rot_180 {
        result.rotation = Rotation::Cw180;
    }
    if prefs.webcam_rot_270 {
        result.rotation = Rotation::Cw270;
    }
    result
}

/// Full camera record for an instance.
pub fn camera_config(
    raw_url: &str,
    instance: &InstanceDescriptor,
    prefs: &PrinterPreferences,
) -> CameraConfig {
    let (url, shares_proxy) = normalize_camera_url(raw_url, instance);
    CameraConfig {
        url,
        shares_proxy,
        orientation: orientation(prefs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(https: bool) -> InstanceDescriptor {
        InstanceDescriptor::new("office", "192.168.1.20", 3344).with_https(https)
    }

    #[test]
    fn absolute_urls_are_kept() {
        let (url, proxy) = normalize_camera_url("https://cam.local/stream", &instance(false));
        assert_eq!(url.as_deref(), Some("https://cam.local/stream"));
        assert!(!proxy);
    }

    #[test]
    fn scheme_match_is_case_sensitive() {
        assert_eq!(normalize_camera_url("HTTP://cam.local/stream", &instance(false)), (None, false));
    }

    #[test]
    fn loopback_is_replaced_before_rules() {
        let (url, _) = normalize_camera_url("http://127.0.0.1:8080/?action=stream", &instance(false));
        assert_eq!(url.as_deref(), Some("http://192.168.1.20:8080/?action=stream"));
    }

    #[test]
    fn protocol_relative_takes_session_scheme() {
        let (url, proxy) = normalize_camera_url("//cam:81/mjpg", &instance(true));
        assert_eq!(url.as_deref(), Some("https://cam:81/mjpg"));
        assert!(!proxy);
    }

    #[test]
    fn port_relative_uses_instance_host() {
        let (url, proxy) = normalize_camera_url(":8080/?action=stream", &instance(false));
        assert_eq!(url.as_deref(), Some("http://192.168.1.20:8080/?action=stream"));
        assert!(!proxy);
    }

    #[test]
    fn path_shares_proxy() {
        let (url, proxy) = normalize_camera_url("/webcam/?action=stream", &instance(false));
        assert_eq!(url.as_deref(), Some("http://192.168.1.20:3344/webcam/?action=stream"));
        assert!(proxy);
    }

    #[test]
    fn empty_and_relative_urls_mean_no_camera() {
        assert_eq!(normalize_camera_url("", &instance(false)), (None, false));
        assert_eq!(normalize_camera_url("webcam/stream", &instance(false)), (None, false));
    }

    #[test]
    fn last_rotation_flag_wins() {
        let prefs = PrinterPreferences {
            webcam_flip_x: true,
            webcam_rot_90: true,
            webcam_rot_270: true,
            ..Default::default()
        };
        let result = orientation(&prefs);
        assert_eq!(result.rotation, Rotation::Cw270);
        assert!(result.mirror);
        assert_eq!(orientation(&prefs), result);
    }

    #[test]
    fn mirror_is_either_flip() {
        let flip_y = PrinterPreferences {
            webcam_flip_y: true,
            ..Default::default()
        };
        assert!(orientation(&flip_y).mirror);
        assert_eq!(orientation(&flip_y).rotation, Rotation::None);

        let flip_x = PrinterPreferences {
            webcam_flip_x: true,
            ..Default::default()
        };
        assert!(orientation(&flip_x).mirror);
        assert_eq!(orientation(&flip_x).rotation, Rotation::Cw180);

        assert_eq!(orientation(&PrinterPreferences::default()), CameraOrientation::default());
    }
}
