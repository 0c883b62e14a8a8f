// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-aware data directory resolution.

use std::path::PathBuf;

const APP_DIR: &str = "repetier";

/// Return the application data directory, creating it if needed.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let dir = resolve(std::env::var("XDG_DATA_HOME").ok(), std::env::var("HOME").ok());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// XDG data dir, then `~/.local/share`, then `/tmp`.
fn resolve(xdg_data_home: Option<String>, home: Option<String>) -> PathBuf {
    let base = match (xdg_data_home.filter(|v| !v.is_empty()), home) {
        (Some(xdg), _) => PathBuf::from(xdg),
        (None, Some(home)) => PathBuf::from(home).join(".local").join("share"),
        // Last resort
        (None, None) => PathBuf::from("/tmp"),
    };
    base.join(APP_DIR)
}
