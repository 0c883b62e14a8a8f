// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Repetier link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Basic-auth credentials for an instance behind a reverse proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BasicAuth {
    /// Credentials are only usable when both halves are present.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

/// One addressable Repetier-Server endpoint, discovered or user-entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Unique key within a registry (mDNS full name or the manual entry name).
    pub id: String,
    /// Name shown to the user.
    pub name: String,
    /// Host name or address. IPv6 addresses are bracketed.
    pub host: String,
    pub port: u16,
    /// Server path prefix, always ending in `/`.
    pub path: String,
    pub use_https: bool,
    pub basic_auth: Option<BasicAuth>,
    /// Slug of the sub-printer on a multi-printer server, when known.
    pub repetier_id: Option<String>,
    /// Whether the user entered this instance by hand.
    pub manual: bool,
    pub discovered_at: DateTime<Utc>,
}

impl InstanceDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            path: "/".into(),
            use_https: false,
            basic_auth: None,
            repetier_id: None,
            manual: false,
            discovered_at: Utc::now(),
        }
    }

    /// Set the path, normalising it to start and end with `/`.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    pub fn with_basic_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.basic_auth = auth;
        self
    }

    pub fn with_repetier_id(mut self, slug: Option<String>) -> Self {
        self.repetier_id = slug.filter(|s| !s.is_empty());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_https { "https" } else { "http" }
    }

    /// `scheme://host:port/path/`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme(), self.host, self.port, self.path)
    }

    /// Sub-printer slug, empty when not yet known.
    pub fn slug(&self) -> &str {
        self.repetier_id.as_deref().unwrap_or("")
    }
}

/// Make sure a server path starts and ends with a slash.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut out = String::with_capacity(trimmed.len() + 2);
    if !trimmed.starts_with('/') {
        out.push('/');
    }
    out.push_str(trimmed);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    /// Communication broke down; the interrupted state is kept by the session.
    Error,
}

/// Printer or job activity as the host displays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    /// Nothing reported yet.
    #[default]
    Unknown,
    Idle,
    Printing,
    Paused,
    Offline,
}

impl PrinterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Offline => "offline",
        }
    }

    /// A new job may only start on an idle printer or one that has not
    /// reported yet.
    pub fn accepts_new_job(&self) -> bool {
        matches!(self, Self::Idle | Self::Unknown)
    }
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target and measured temperature in °C, rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperature {
    pub target: f64,
    pub actual: f64,
}

impl Temperature {
    pub fn new(target: f64, actual: f64) -> Self {
        Self {
            target: round2(target),
            actual: round2(actual),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Latest known printer status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    pub state: PrinterState,
    pub extruders: Vec<Temperature>,
    pub bed: Temperature,
}

impl PrinterSnapshot {
    pub fn new(extruder_count: usize) -> Self {
        Self {
            state: PrinterState::Unknown,
            extruders: vec![Temperature::default(); extruder_count],
            bed: Temperature::default(),
        }
    }

    pub fn extruder_count(&self) -> usize {
        self.extruders.len()
    }
}

impl Default for PrinterSnapshot {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Active print job as reported by the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    pub state: PrinterState,
    /// Seconds printed so far.
    pub time_elapsed: f64,
    /// Estimated total seconds.
    pub time_total: f64,
    /// Percent done, 0 to 100.
    pub progress: f64,
}

impl JobSnapshot {
    /// The snapshot used when the server reports no job.
    pub fn idle() -> Self {
        Self {
            state: PrinterState::Idle,
            ..Default::default()
        }
    }
}

/// Camera stream rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraOrientation {
    pub mirror: bool,
    pub rotation: Rotation,
}

/// Normalised camera stream location.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Absolute stream URL, `None` when the server has no usable camera.
    pub url: Option<String>,
    /// The stream is served through the same proxy as the job API.
    pub shares_proxy: bool,
    pub orientation: CameraOrientation,
}

/// Unique identifier for an upload started by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an upload ends up on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadDestination {
    Local,
    SdCard,
}

/// Which user-facing notice a [`Notice`] occupies. A session shows at most
/// one notice per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeSlot {
    /// Upload progress ("sending" / "storing").
    Progress,
    /// Errors and the busy-printer refusal.
    Error,
    /// Informational results such as "saved".
    Info,
}

/// Action the user can trigger from a notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeAction {
    /// Abort the running upload.
    CancelUpload,
    /// Upload anyway, queued instead of printed.
    QueueJob,
    /// Open the instance's web interface.
    OpenWebUi { url: String },
}

/// A user-facing notification surfaced by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub slot: NoticeSlot,
    pub title: String,
    pub text: String,
    /// Percent for progress notices; `None` for indeterminate.
    pub progress: Option<u8>,
    pub actions: Vec<NoticeAction>,
}

impl Notice {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            slot: NoticeSlot::Error,
            title: "Repetier error".into(),
            text: text.into(),
            progress: None,
            actions: Vec::new(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            slot: NoticeSlot::Info,
            title: "Repetier".into(),
            text: text.into(),
            progress: None,
            actions: Vec::new(),
        }
    }

    pub fn progress(text: impl Into<String>, progress: Option<u8>) -> Self {
        Self {
            slot: NoticeSlot::Progress,
            title: "Repetier".into(),
            text: text.into(),
            progress,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.actions.push(action);
        self
    }
}
