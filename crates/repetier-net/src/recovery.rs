// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Silence tracking for a session.
//
// A session that keeps sending requests but stops hearing back drops into the
// error state once, remembering where it was. Any later response restores that
// state. If the silence drags on, the transport is rebuilt; each rebuild pushes
// the next one further out, because some network stacks report a dead link as
// healthy after sleep/resume and only a fresh client recovers.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use repetier_core::types::ConnectionState;

/// What a periodic silence check asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SilenceCheck {
    /// Enter the error state (first detection only).
    pub enter_error: bool,
    /// Throw away the transport and build a new one.
    pub recreate_transport: bool,
}

/// Request/response bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct SilenceMonitor {
    timeout: Duration,
    recreate_after: Duration,
    last_request: Option<Instant>,
    last_response: Option<Instant>,
    /// State interrupted by the error state.
    saved_state: Option<ConnectionState>,
    consecutive_timeouts: u32,
    /// Multiplier for `recreate_after`; starts at 1.
    recreate_count: u32,
}

impl SilenceMonitor {
    pub fn new(timeout: Duration, recreate_after: Duration) -> Self {
        Self {
            timeout,
            recreate_after,
            last_request: None,
            last_response: None,
            saved_state: None,
            consecutive_timeouts: 0,
            recreate_count: 1,
        }
    }

    /// Forget everything and start counting silence from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_request = None;
        self.last_response = Some(now);
        self.saved_state = None;
        self.consecutive_timeouts = 0;
        self.recreate_count = 1;
    }

    pub fn request_sent(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    /// Record that the server is alive without completing a request (upload
    /// progress).
    pub fn touch(&mut self, now: Instant) {
        self.last_response = Some(now);
    }

    /// Record a completed response. Returns the state to restore if the
    /// session was in the error state because of silence.
    pub fn response_received(&mut self, now: Instant) -> Option<ConnectionState> {
        if let (Some(last), Some(_)) = (self.last_response, self.saved_state) {
            info!(silence_ms = now.duration_since(last).as_millis() as u64, "response after silence");
        }
        self.last_response = Some(now);
        self.consecutive_timeouts = 0;
        self.recreate_count = 1;
        self.saved_state.take()
    }

    /// Record a timed-out or unreachable request. Returns `true` only for the
    /// timeout that should move the session into the error state.
    pub fn timed_out(&mut self, current: ConnectionState) -> bool {
        self.consecutive_timeouts += 1;
        debug!(consecutive = self.consecutive_timeouts, "request timed out");
        self.enter_error(current)
    }

    /// Periodic check, run on every poll tick.
    pub fn check(&mut self, now: Instant, current: ConnectionState) -> SilenceCheck {
        let (Some(last_response), Some(last_request)) = (self.last_response, self.last_request) else {
            return SilenceCheck::default();
        };
        let silence = now.duration_since(last_response);
        let since_request = now.duration_since(last_request);

        // Only silence while we are actually asking counts.
        if silence <= self.timeout || since_request > self.timeout {
            return SilenceCheck::default();
        }

        let mut check = SilenceCheck {
            enter_error: self.enter_error(current),
            recreate_transport: false,
        };
        if silence > self.recreate_after * self.recreate_count {
            warn!(
                silence_s = silence.as_secs(),
                attempt = self.recreate_count,
                "no response for too long, recreating transport"
            );
            self.recreate_count += 1;
            check.recreate_transport = true;
        }
        check
    }

    fn enter_error(&mut self, current: ConnectionState) -> bool {
        if self.saved_state.is_some() || current == ConnectionState::Error {
            return false;
        }
        self.saved_state = Some(current);
        true
    }

    pub fn saved_state(&self) -> Option<ConnectionState> {
        self.saved_state
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    #[cfg(test)]
    pub(crate) fn last_response(&self) -> Option<Instant> {
        self.last_response
    }
}
