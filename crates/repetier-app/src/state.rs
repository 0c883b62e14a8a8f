// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Monitor state: the latest status of every session, folded from session
// events, and its one-line text rendering.

use std::collections::BTreeMap;

use repetier_core::error::RepetierError;
use repetier_core::human_errors::humanize_error;
use repetier_core::types::{ConnectionState, JobSnapshot, PrinterSnapshot};
use repetier_net::{SessionEvent, SessionStatus};

/// What the monitor knows about each session.
#[derive(Debug, Default)]
pub struct MonitorState {
    sessions: BTreeMap<String, SessionStatus>,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the view with fresh statuses from the registry.
    pub fn refresh(&mut self, statuses: Vec<SessionStatus>) {
        self.sessions = statuses.into_iter().map(|s| (s.id.clone(), s)).collect();
    }

    /// Fold one event into the session's status. Returns a log line for
    /// events worth reporting on their own.
    pub fn apply(&mut self, id: &str, event: &SessionEvent) -> Option<String> {
        let status = self.sessions.get_mut(id)?;
        match event {
            SessionEvent::ConnectionState(state) => {
                status.connection = *state;
                Some(format!("{}: {}", status.name, connection_label(*state)))
            }
            SessionEvent::ConnectionText(text) => {
                status.connection_text = text.clone();
                Some(format!("{}: {text}", status.name))
            }
            SessionEvent::AcceptsCommands(accepts) => {
                status.accepts_commands = *accepts;
                None
            }
            SessionEvent::AuthRejected(rejected) => {
                status.auth_rejected = *rejected;
                rejected.then(|| format!("{}: API key rejected", status.name))
            }
            SessionEvent::Printer(printer) => {
                status.printer = printer.clone();
                None
            }
            SessionEvent::Job(job) => {
                status.job = job.clone();
                None
            }
            SessionEvent::Camera(camera) => {
                status.camera = camera.clone();
                None
            }
            SessionEvent::Notice(notice) => {
                let progress = notice.progress.map(|p| format!(" ({p}%)")).unwrap_or_default();
                Some(format!("{}: {}{progress}", status.name, notice.text))
            }
            SessionEvent::NoticeHidden(_) => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&SessionStatus> {
        self.sessions.get(id)
    }

    /// One line per session, ordered by id.
    pub fn summary(&self) -> Vec<String> {
        self.sessions.values().map(summary_line).collect()
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Closed => "closed",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Error => "error",
    }
}

fn printer_line(printer: &PrinterSnapshot) -> String {
    let mut parts = Vec::with_capacity(printer.extruders.len() + 2);
    if !printer.state.as_str().is_empty() {
        parts.push(printer.state.to_string());
    }
    for (i, t) in printer.extruders.iter().enumerate() {
        parts.push(format!("E{i} {:.1}/{:.1}", t.actual, t.target));
    }
    parts.push(format!("B {:.1}/{:.1}", printer.bed.actual, printer.bed.target));
    parts.join(" ")
}

fn job_line(job: &JobSnapshot) -> Option<String> {
    if job.name.is_empty() {
        return None;
    }
    Some(format!("job {} {:.1}%", job.name, job.progress))
}

/// `name [state] printer-state temps job`, e.g.
/// `Office [connected] printing E0 214.6/215.0 B 59.9/60.0 job part.gcode 22.8%`.
pub fn summary_line(status: &SessionStatus) -> String {
    let mut line = format!(
        "{} [{}] {}",
        status.name,
        connection_label(status.connection),
        printer_line(&status.printer)
    );
    if let Some(job) = status.job.as_ref().and_then(job_line) {
        line.push(' ');
        line.push_str(&job);
    }
    if status.auth_rejected {
        line.push_str(" (API key rejected)");
    }
    line
}

/// Message plus suggestion for an error shown to the user.
pub fn error_line(err: &RepetierError) -> String {
    let human = humanize_error(err);
    format!("{} {}", human.message, human.suggestion)
}
