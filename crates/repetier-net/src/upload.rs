// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print-job upload: request construction, progress bookkeeping and reply
// classification. The session drives these; nothing here touches the network.

use repetier_core::config::PrinterPreferences;
use repetier_core::error::Result;
use repetier_core::types::{InstanceDescriptor, UploadDestination};

use crate::transport::{FormPart, Reply, with_query};

/// Name used when the host supplies an empty job name.
pub const UNTITLED: &str = "untitled_print";

/// Extension appended to every uploaded job.
pub const EXTENSION: &str = ".gcode";

/// Turn a job name into the file name stored on the server.
pub fn job_file_name(job_name: &str) -> String {
    let trimmed = job_name.trim();
    let base = if trimmed.is_empty() { UNTITLED } else { trimmed };
    let clean: String = base
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if clean.to_ascii_lowercase().ends_with(EXTENSION) {
        clean
    } else {
        format!("{clean}{EXTENSION}")
    }
}

/// Everything needed to send one job.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPlan {
    pub file_name: String,
    /// Stored for later rather than printed right away.
    pub queued: bool,
    pub destination: UploadDestination,
    pub url: String,
    pub parts: Vec<FormPart>,
}

/// Build the upload for `gcode`.
///
/// Queued jobs (forced, or auto-print disabled) go to the model store,
/// everything else to the job endpoint where the server starts it.
pub fn plan_upload(
    instance: &InstanceDescriptor,
    prefs: &PrinterPreferences,
    sd_supported: bool,
    forced_queue: bool,
    job_name: &str,
    gcode: Vec<u8>,
) -> Result<UploadPlan> {
    let file_name = job_file_name(job_name);
    let queued = forced_queue || !prefs.auto_print;

    let target = if queued { "printer/model/" } else { "printer/job/" };
    let base = format!("{}{target}{}", instance.base_url(), instance.slug());
    let mut params = vec![("a", "upload"), ("name", file_name.as_str())];
    if prefs.store_print {
        params.push(("group", prefs.store_group.as_str()));
    }
    let url = with_query(&base, &params)?;

    let mut parts = vec![FormPart::text("a", "upload")];
    if !queued {
        // Print trigger: a field named after the file.
        parts.push(FormPart::text(file_name.clone(), "upload"));
    }
    parts.push(FormPart::file("file", file_name.clone(), gcode));

    let destination = if sd_supported && prefs.store_sd {
        UploadDestination::SdCard
    } else {
        UploadDestination::Local
    };

    Ok(UploadPlan {
        file_name,
        queued,
        destination,
        url,
        parts,
    })
}

/// What the surfaced progress indicator should do after a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStep {
    Unchanged,
    /// Show this percentage.
    Advanced(u8),
    /// Body fully sent; replace "sending" with "storing".
    Storing,
}

/// Keeps upload progress monotonic and fires the storing swap once.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
    storing: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sent: u64, total: u64) -> ProgressStep {
        if self.storing {
            return ProgressStep::Unchanged;
        }
        if total == 0 {
            return self.advance(0);
        }
        let pct = (sent.saturating_mul(100) / total).min(100) as u8;
        if pct >= 100 {
            self.storing = true;
            return ProgressStep::Storing;
        }
        self.advance(pct)
    }

    fn advance(&mut self, pct: u8) -> ProgressStep {
        match self.last {
            Some(last) if pct <= last => ProgressStep::Unchanged,
            _ => {
                self.last = Some(pct);
                ProgressStep::Advanced(pct)
            }
        }
    }

    /// Last percentage shown, if any.
    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Not sent: auto-print is on and the printer cannot take a new job.
    Busy,
    /// Stored for later. `file_name` comes from the `Location` header.
    Stored { file_name: Option<String> },
    /// Uploaded for printing; `select` is the follow-up action, when the
    /// server told us where the job ended up.
    Print { select: Option<String> },
    Failed(String),
}

/// Classify an upload reply.
pub fn classify_reply(reply: &Reply, plan: &UploadPlan, api_prefix: &str) -> UploadOutcome {
    match reply.status {
        401 => UploadOutcome::Failed(
            "You are not allowed to upload files to Repetier with the configured API key.".into(),
        ),
        409 => UploadOutcome::Failed(match plan.destination {
            UploadDestination::SdCard => "Can't store the printjob on the printer sd card.".into(),
            UploadDestination::Local => {
                "Can't store the printjob with the same name as the one that is currently printing."
                    .into()
            }
        }),
        200 | 201 if plan.queued => UploadOutcome::Stored {
            file_name: reply.location.as_deref().and_then(location_file_name),
        },
        200 | 201 => UploadOutcome::Print {
            select: reply
                .location
                .as_deref()
                .and_then(|l| select_action(l, api_prefix)),
        },
        _ => {
            let text = reply.text();
            if text.trim().is_empty() {
                UploadOutcome::Failed(reply.reason.clone())
            } else {
                UploadOutcome::Failed(text)
            }
        }
    }
}

/// Last path segment of a `Location` value.
pub fn location_file_name(location: &str) -> Option<String> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// The API action named by a `Location` value: whatever follows the session's
/// API prefix, without the leading `?a=`.
pub fn select_action(location: &str, api_prefix: &str) -> Option<String> {
    let (_, rest) = location.split_once(api_prefix)?;
    let rest = rest.trim_start_matches('/');
    let rest = rest.strip_prefix("?a=").unwrap_or(rest);
    (!rest.is_empty()).then(|| rest.to_owned())
}
