// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One live connection to a Repetier-Server printer.
//
// A `Session` owns its transport and runs the connection state machine:
//
//   Closed ─connect()→ Connecting ─first good poll→ Connected
//                         │  ▲                         │  ▲
//                         ▼  │ response                ▼  │ response
//                         Error ◄──── timeout / silence ───┘
//
// `close()` returns to Closed from anywhere. The Error state remembers what
// it interrupted, and the first response afterwards restores it.
//
// All mutable state lives behind one mutex that is never held across an
// await. Each connect/close bumps a generation counter; replies tagged with
// an older generation are dropped, which is how in-flight polls of a closed
// session get ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use repetier_core::config::{PluginConfig, PrinterPreferences};
use repetier_core::error::{RepetierError, Result};
use repetier_core::types::{
    CameraConfig, ConnectionState, InstanceDescriptor, JobSnapshot, Notice, NoticeAction,
    NoticeSlot, PrinterSnapshot, PrinterState, UploadId,
};

use crate::camera::camera_config;
use crate::payload::{parse_job_list, parse_json, parse_printer_config, parse_state_list};
use crate::recovery::SilenceMonitor;
use crate::transport::{
    Body, Method, Reply, Request, Transport, TransportFactory, Upload, UploadProgress,
    instance_headers, with_query,
};
use crate::upload::{ProgressStep, ProgressTracker, UploadOutcome, classify_reply, plan_upload};

const EVENT_CAPACITY: usize = 128;

const SENDING_TEXT: &str = "Sending data to Repetier";
const STORING_TEXT: &str = "Storing data on Repetier";

/// Observable changes of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionState(ConnectionState),
    ConnectionText(String),
    AcceptsCommands(bool),
    AuthRejected(bool),
    Printer(PrinterSnapshot),
    Job(Option<JobSnapshot>),
    Camera(CameraConfig),
    Notice(Notice),
    NoticeHidden(NoticeSlot),
}

/// Point-in-time view of a session for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub connection: ConnectionState,
    pub connection_text: String,
    pub accepts_commands: bool,
    pub auth_rejected: bool,
    pub printer: PrinterSnapshot,
    pub job: Option<JobSnapshot>,
    pub camera: CameraConfig,
    pub show_camera: bool,
    pub sd_supported: bool,
    pub uploading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    State,
    Job,
    Config,
}

impl Poll {
    fn action(self) -> &'static str {
        match self {
            Self::State => "stateList",
            Self::Job => "listPrinter",
            Self::Config => "getPrinterConfig",
        }
    }
}

struct PendingUpload {
    id: UploadId,
    cancel: CancellationToken,
}

/// A job refused because the printer was busy, kept for "queue anyway".
struct RefusedJob {
    name: String,
    gcode: Vec<u8>,
}

struct SessionState {
    connection: ConnectionState,
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    poll_cancel: Option<CancellationToken>,
    api_key: String,
    prefs: PrinterPreferences,
    monitor: SilenceMonitor,
    printer: PrinterSnapshot,
    job: Option<JobSnapshot>,
    camera_raw: Option<String>,
    camera: CameraConfig,
    sd_supported: bool,
    accepts_commands: bool,
    auth_rejected: bool,
    connection_text: String,
    queued_commands: Vec<String>,
    flush_scheduled: bool,
    upload: Option<PendingUpload>,
    refused_job: Option<RefusedJob>,
    /// Events produced under the lock, sent once it is released.
    outbox: Vec<SessionEvent>,
}

impl SessionState {
    fn emit(&mut self, event: SessionEvent) {
        self.outbox.push(event);
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!(from = ?self.connection, to = ?state, "connection state changed");
            self.connection = state;
            self.emit(SessionEvent::ConnectionState(state));
        }
    }

    fn set_text(&mut self, text: String) {
        if self.connection_text != text {
            self.connection_text = text.clone();
            self.emit(SessionEvent::ConnectionText(text));
        }
    }

    fn set_auth_rejected(&mut self, rejected: bool) {
        if self.auth_rejected != rejected {
            self.auth_rejected = rejected;
            self.emit(SessionEvent::AuthRejected(rejected));
        }
    }

    fn advance_connecting(&mut self) {
        if self.connection == ConnectionState::Connecting {
            self.set_connection(ConnectionState::Connected);
        }
    }

    fn mark_job_offline(&mut self) {
        if let Some(job) = self.job.as_mut() {
            job.state = PrinterState::Offline;
            let job = self.job.clone();
            self.emit(SessionEvent::Job(job));
        }
    }

    fn mark_offline(&mut self) {
        self.printer.state = PrinterState::Offline;
        let printer = self.printer.clone();
        self.emit(SessionEvent::Printer(printer));
        self.mark_job_offline();
    }

    fn job_active(&self) -> Option<PrinterState> {
        self.job
            .as_ref()
            .map(|j| j.state)
            .filter(|s| matches!(s, PrinterState::Printing | PrinterState::Paused))
    }

    fn show(&mut self, notice: Notice) {
        self.emit(SessionEvent::Notice(notice));
    }

    fn hide(&mut self, slot: NoticeSlot) {
        self.emit(SessionEvent::NoticeHidden(slot));
    }
}

struct Inner {
    descriptor: InstanceDescriptor,
    config: PluginConfig,
    factory: Arc<dyn TransportFactory>,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

/// Connection to one Repetier-Server printer. Cheap to clone; clones share
/// the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.descriptor.id)
            .field("connection", &self.connection_state())
            .finish()
    }
}

impl Session {
    pub fn new(
        descriptor: InstanceDescriptor,
        config: PluginConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let monitor = SilenceMonitor::new(config.request_timeout, config.recreate_transport_after);
        let state = SessionState {
            connection: ConnectionState::Closed,
            generation: 0,
            transport: None,
            poll_cancel: None,
            api_key: String::new(),
            prefs: PrinterPreferences::default(),
            monitor,
            printer: PrinterSnapshot::default(),
            job: None,
            camera_raw: None,
            camera: CameraConfig::default(),
            sd_supported: false,
            accepts_commands: false,
            auth_rejected: false,
            connection_text: String::new(),
            queued_commands: Vec::new(),
            flush_scheduled: false,
            upload: None,
            refused_job: None,
            outbox: Vec::new(),
        };
        Self {
            inner: Arc::new(Inner {
                descriptor,
                config,
                factory,
                events,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.inner.descriptor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn is_uploading(&self) -> bool {
        self.lock().upload.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        let st = self.lock();
        let desc = &self.inner.descriptor;
        SessionStatus {
            id: desc.id.clone(),
            name: desc.name.clone(),
            base_url: desc.base_url(),
            connection: st.connection,
            connection_text: st.connection_text.clone(),
            accepts_commands: st.accepts_commands,
            auth_rejected: st.auth_rejected,
            printer: st.printer.clone(),
            job: st.job.clone(),
            camera: st.camera.clone(),
            show_camera: st.prefs.show_camera,
            sd_supported: st.sd_supported,
            uploading: st.upload.is_some(),
        }
    }

    /// Replace the API key. A new key clears a previous rejection.
    pub fn set_api_key(&self, api_key: &str) {
        self.update(|st| {
            if st.api_key != api_key {
                st.api_key = api_key.to_owned();
                st.set_auth_rejected(false);
            }
        });
    }

    /// Replace the per-machine preferences and re-derive the camera
    /// orientation from them.
    pub fn set_preferences(&self, prefs: PrinterPreferences) {
        self.update(|st| {
            st.prefs = prefs;
            if let Some(raw) = st.camera_raw.clone() {
                st.camera = camera_config(&raw, &self.inner.descriptor, &st.prefs);
                let camera = st.camera.clone();
                st.emit(SessionEvent::Camera(camera));
            }
        });
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start talking to the instance: fresh transport, an immediate state and
    /// job poll, then one every poll interval, plus a single configuration
    /// fetch. Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub fn connect(&self) -> Result<()> {
        let transport = self.inner.factory.create()?;
        let label = self.label();
        let (generation, token) = self.update(|st| {
            if let Some(token) = st.poll_cancel.take() {
                token.cancel();
            }
            st.generation += 1;
            st.transport = Some(transport);
            st.monitor.reset(Instant::now());
            st.set_auth_rejected(false);
            st.set_connection(ConnectionState::Connecting);
            st.set_text(format!("Connecting to Repetier on {label}"));
            let token = CancellationToken::new();
            st.poll_cancel = Some(token.clone());
            (st.generation, token)
        });
        info!(url = %self.inner.descriptor.base_url(), "connecting to Repetier");
        self.spawn_poll_loop(generation, token);
        Ok(())
    }

    /// Stop polling and go to `Closed`. Progress and error notices are
    /// withdrawn; a running upload is left alone.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub fn close(&self) {
        self.update(|st| {
            if let Some(token) = st.poll_cancel.take() {
                token.cancel();
            }
            st.generation += 1;
            st.set_connection(ConnectionState::Closed);
            st.hide(NoticeSlot::Progress);
            st.hide(NoticeSlot::Error);
        });
        info!("session closed");
    }

    /// Same as `close`.
    pub fn disconnect(&self) {
        self.close();
    }

    /// Fetch SD support and the webcam settings again.
    pub async fn refresh_config(&self) {
        let generation = self.lock().generation;
        self.clone().poll(generation, Poll::Config).await;
    }

    fn spawn_poll_loop(&self, generation: u64, token: CancellationToken) {
        let session = self.clone();
        let period = self.inner.config.poll_interval;
        tokio::spawn(async move {
            tokio::spawn(session.clone().poll(generation, Poll::Config));

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => session.tick(generation),
                }
            }
            debug!(instance = %session.id(), "poll loop stopped");
        });
    }

    fn tick(&self, generation: u64) {
        let check = self.update(|st| {
            if st.generation != generation {
                return None;
            }
            let check = st.monitor.check(Instant::now(), st.connection);
            if check.enter_error {
                st.set_connection(ConnectionState::Error);
                st.set_text("Repetier Connection to printer failed".into());
            }
            Some(check)
        });
        let Some(check) = check else {
            return;
        };
        if check.recreate_transport {
            self.recreate_transport(generation);
        }
        tokio::spawn(self.clone().poll(generation, Poll::State));
        tokio::spawn(self.clone().poll(generation, Poll::Job));
    }

    fn recreate_transport(&self, generation: u64) {
        match self.inner.factory.create() {
            Ok(transport) => self.update(|st| {
                if st.generation == generation {
                    st.transport = Some(transport);
                }
            }),
            Err(e) => error!(instance = %self.id(), error = %e, "failed to recreate transport"),
        }
    }

    // -- polling ------------------------------------------------------------

    async fn poll(self, generation: u64, poll: Poll) {
        let prepared = self.update(|st| {
            if st.generation != generation {
                return None;
            }
            st.monitor.request_sent(Instant::now());
            self.api_request(st, Method::Get, poll.action(), Body::Empty)
                .map_err(|e| warn!(instance = %self.id(), error = %e, "cannot build poll request"))
                .ok()
        });
        let Some((transport, request)) = prepared else {
            return;
        };
        let result = transport.request(request).await;
        self.update(|st| self.handle_poll(st, generation, poll, result));
    }

    fn handle_poll(&self, st: &mut SessionState, generation: u64, poll: Poll, result: Result<Reply>) {
        if st.generation != generation || st.connection == ConnectionState::Closed {
            debug!(instance = %self.id(), action = poll.action(), "ignoring reply for a stale session");
            return;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.is_transient() => {
                warn!(instance = %self.id(), action = poll.action(), error = %e, "request failed");
                if st.monitor.timed_out(st.connection) {
                    st.set_connection(ConnectionState::Error);
                    st.set_text("Repetier Connection to printer failed".into());
                }
                return;
            }
            Err(e) => {
                warn!(instance = %self.id(), action = poll.action(), error = %e, "request failed");
                return;
            }
        };

        if let Some(saved) = st.monitor.response_received(Instant::now()) {
            info!(instance = %self.id(), state = ?saved, "communication restored");
            st.set_connection(saved);
        }

        let label = self.label();
        match (reply.status, poll) {
            (200, Poll::State) => self.apply_state(st, &reply),
            (200, Poll::Job) => self.apply_job(st, &reply),
            (200, Poll::Config) => self.apply_config(st, &reply),
            (401, _) => {
                st.mark_offline();
                st.set_auth_rejected(true);
                st.set_text(format!("Repetier on {label} does not allow access to print"));
            }
            (409, _) => {
                st.advance_connecting();
                st.mark_offline();
                st.set_text(format!(
                    "The printer connected to Repetier on {label} is not operational"
                ));
            }
            (status, Poll::Job) => {
                warn!(instance = %self.id(), status, "unexpected job poll status");
                st.mark_job_offline();
                st.set_text(format!("Repetier on {label} bad response"));
            }
            (status, Poll::State) => {
                warn!(instance = %self.id(), status, "unexpected state poll status");
                st.mark_offline();
            }
            (status, Poll::Config) => {
                warn!(instance = %self.id(), status, "unexpected configuration status");
            }
        }
    }

    fn apply_state(&self, st: &mut SessionState, reply: &Reply) {
        if !st.accepts_commands {
            st.accepts_commands = true;
            st.emit(SessionEvent::AcceptsCommands(true));
            st.set_text(format!("Connected to Repetier on {}", self.label()));
        }
        st.advance_connecting();

        let json = parse_json(&reply.body);
        match parse_state_list(&json, self.inner.descriptor.slug()) {
            Ok(Some(update)) => {
                if let Some(extruders) = update.extruders {
                    if extruders.len() != st.printer.extruder_count() {
                        debug!(count = extruders.len(), "extruder count changed");
                    }
                    st.printer.extruders = extruders;
                }
                st.printer.bed = update.bed;
                let printer = st.printer.clone();
                st.emit(SessionEvent::Printer(printer));
            }
            Ok(None) => {}
            Err(e) => self.invalid_payload(st, &e),
        }
    }

    fn apply_job(&self, st: &mut SessionState, reply: &Reply) {
        st.advance_connecting();
        let json = parse_json(&reply.body);
        match parse_job_list(&json, self.inner.descriptor.slug()) {
            Ok(Some(update)) => {
                st.printer.state = update.printer_state;
                st.job = Some(update.job);
                let (printer, job) = (st.printer.clone(), st.job.clone());
                st.emit(SessionEvent::Printer(printer));
                st.emit(SessionEvent::Job(job));
            }
            Ok(None) => {}
            Err(e) => self.invalid_payload(st, &e),
        }
    }

    fn apply_config(&self, st: &mut SessionState, reply: &Reply) {
        let config = parse_printer_config(&parse_json(&reply.body));
        if let Some(sd) = config.sd_supported {
            st.sd_supported = sd;
        }
        if let Some(raw) = config.camera_url {
            st.camera = camera_config(&raw, &self.inner.descriptor, &st.prefs);
            st.camera_raw = Some(raw);
            debug!(url = ?st.camera.url, "camera configured");
            let camera = st.camera.clone();
            st.emit(SessionEvent::Camera(camera));
        }
    }

    fn invalid_payload(&self, st: &mut SessionState, e: &RepetierError) {
        warn!(instance = %self.id(), error = %e, "invalid payload from Repetier");
        st.mark_job_offline();
        st.set_text(format!("Repetier on {} configuration is invalid", self.label()));
    }

    // -- commands -----------------------------------------------------------

    /// Queue a raw G-code command. Commands queued before the next scheduling
    /// point are sent together in one request.
    pub fn send_command(&self, command: impl Into<String>) {
        let command = command.into();
        let schedule = self.update(|st| {
            st.queued_commands.push(command);
            !std::mem::replace(&mut st.flush_scheduled, true)
        });
        if schedule {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                session.flush_commands().await;
            });
        }
    }

    async fn flush_commands(&self) {
        let prepared = self.update(|st| {
            st.flush_scheduled = false;
            if st.queued_commands.is_empty() {
                return None;
            }
            let commands = std::mem::take(&mut st.queued_commands);
            match self.api_request(st, Method::Post, "send", command_body(&commands.join("\n"))) {
                Ok(prepared) => Some((prepared, commands.len())),
                Err(e) => {
                    warn!(instance = %self.id(), error = %e, dropped = commands.len(), "cannot send commands");
                    None
                }
            }
        });
        let Some(((transport, request), count)) = prepared else {
            return;
        };
        match transport.request(request).await.and_then(Reply::error_for_status) {
            Ok(_) => debug!(instance = %self.id(), count, "commands sent"),
            Err(e) => warn!(instance = %self.id(), error = %e, "sending commands failed"),
        }
    }

    /// Pause the running job.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub async fn pause(&self) -> Result<()> {
        self.command(Method::Post, "send", command_body("@pause")).await
    }

    /// Continue a paused job, or pause a running one. Does nothing without an
    /// active job.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub async fn resume(&self) -> Result<()> {
        let active = self.lock().job_active();
        match active {
            Some(PrinterState::Paused) => {
                self.command(Method::Get, "continueJob", Body::Empty).await
            }
            Some(_) => self.pause().await,
            None => {
                debug!("no active job to resume");
                Ok(())
            }
        }
    }

    /// Abort the running job.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub async fn cancel_job(&self) -> Result<()> {
        self.command(Method::Get, "stopJob", Body::Empty).await
    }

    async fn command(&self, method: Method, action: &str, body: Body) -> Result<()> {
        let (transport, request) = {
            let st = self.lock();
            self.api_request(&st, method, action, body)?
        };
        transport.request(request).await?.error_for_status()?;
        Ok(())
    }

    // -- upload -------------------------------------------------------------

    /// Upload `gcode` as `job_name` and, with auto-print on, start it.
    ///
    /// With auto-print on and a busy printer nothing is sent; an error notice
    /// offers to queue the job instead (see [`Session::queue_print`]).
    pub async fn print(&self, job_name: &str, gcode: Vec<u8>) -> Result<UploadOutcome> {
        self.run_upload(job_name.to_owned(), gcode, false).await
    }

    /// Upload the job refused earlier for a busy printer, stored rather than
    /// printed. Returns `None` if no job is waiting.
    pub async fn queue_print(&self) -> Result<Option<UploadOutcome>> {
        let refused = self.update(|st| {
            let job = st.refused_job.take();
            if job.is_some() {
                st.hide(NoticeSlot::Error);
            }
            job
        });
        match refused {
            Some(job) => self.run_upload(job.name, job.gcode, true).await.map(Some),
            None => Ok(None),
        }
    }

    /// Abort the running upload. Returns whether there was one.
    pub fn cancel_upload(&self) -> bool {
        self.update(|st| match st.upload.take() {
            Some(upload) => {
                info!(instance = %self.id(), upload = %upload.id, "stopping upload");
                upload.cancel.cancel();
                st.hide(NoticeSlot::Progress);
                true
            }
            None => false,
        })
    }

    #[instrument(skip(self, gcode), fields(instance = %self.id(), bytes = gcode.len()))]
    async fn run_upload(&self, job_name: String, gcode: Vec<u8>, forced_queue: bool) -> Result<UploadOutcome> {
        let started = self.update(move |st| {
            if st.upload.is_some() {
                return Err(RepetierError::UploadInProgress);
            }
            if st.prefs.auto_print && !forced_queue && !st.printer.state.accepts_new_job() {
                let text = if st.printer.state == PrinterState::Offline {
                    "The printer is offline. Unable to start a new print job."
                } else {
                    "The printer is busy. Unable to start a new print job."
                };
                st.show(Notice::error(text).with_action(NoticeAction::QueueJob));
                st.refused_job = Some(RefusedJob { name: job_name, gcode });
                return Ok(None);
            }
            let transport = st.transport.clone().ok_or(RepetierError::NoActiveSession)?;
            let plan = plan_upload(
                &self.inner.descriptor,
                &st.prefs,
                st.sd_supported,
                forced_queue,
                &job_name,
                gcode,
            )?;
            let pending = PendingUpload {
                id: UploadId::new(),
                cancel: CancellationToken::new(),
            };
            let handle = (pending.id, pending.cancel.clone());
            st.upload = Some(pending);
            st.show(Notice::progress(SENDING_TEXT, None).with_action(NoticeAction::CancelUpload));
            Ok(Some((transport, plan, self.auth_headers(&st.api_key), handle)))
        })?;
        let Some((transport, mut plan, headers, (id, cancel))) = started else {
            info!("printer busy, upload refused");
            return Ok(UploadOutcome::Busy);
        };

        info!(upload = %id, file = %plan.file_name, queued = plan.queued, "uploading print job");
        let upload = Upload {
            url: plan.url.clone(),
            headers,
            parts: std::mem::take(&mut plan.parts),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let finished = CancellationToken::new();
        let watcher = tokio::spawn(self.clone().watch_progress(rx, cancel.clone(), finished.clone()));
        let result = transport.upload(upload, tx, cancel).await;
        finished.cancel();
        let _ = watcher.await;

        self.update(|st| {
            if st.upload.as_ref().is_some_and(|u| u.id == id) {
                st.upload = None;
            }
            st.hide(NoticeSlot::Progress);
        });

        let reply = match result {
            Ok(reply) => reply,
            Err(RepetierError::Cancelled) => {
                info!(upload = %id, "upload cancelled");
                return Err(RepetierError::Cancelled);
            }
            Err(e) => {
                error!(upload = %id, error = %e, "upload failed");
                self.update(|st| {
                    st.hide(NoticeSlot::Error);
                    st.show(Notice::error("Unable to send data to Repetier."));
                });
                return Err(e);
            }
        };

        let outcome = classify_reply(&reply, &plan, &self.api_prefix());
        match &outcome {
            UploadOutcome::Failed(text) => {
                error!(upload = %id, status = reply.status, error = %text, "upload rejected");
                let notice = Notice::error(text.clone());
                self.update(|st| {
                    st.hide(NoticeSlot::Error);
                    st.show(notice);
                });
            }
            UploadOutcome::Stored { file_name } => {
                let text = match file_name {
                    Some(name) => format!("Saved to Repetier as {name}"),
                    None => "Saved to Repetier".to_owned(),
                };
                let notice = Notice::info(text).with_action(NoticeAction::OpenWebUi {
                    url: self.inner.descriptor.base_url(),
                });
                self.update(|st| st.show(notice));
            }
            UploadOutcome::Print { select: Some(action) } => {
                let body = Body::Json(json!({"command": "select", "print": true}));
                if let Err(e) = self.command(Method::Post, action, body).await {
                    warn!(upload = %id, error = %e, "select-and-print failed");
                }
            }
            UploadOutcome::Print { select: None } => {
                warn!(upload = %id, "server did not report where the job was stored");
            }
            UploadOutcome::Busy => {}
        }
        Ok(outcome)
    }

    async fn watch_progress(
        self,
        mut rx: mpsc::UnboundedReceiver<UploadProgress>,
        cancel: CancellationToken,
        finished: CancellationToken,
    ) {
        let mut tracker = ProgressTracker::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                progress = rx.recv() => match progress {
                    Some(progress) => self.on_progress(&mut tracker, progress),
                    None => return,
                },
                _ = finished.cancelled() => {
                    while let Ok(progress) = rx.try_recv() {
                        self.on_progress(&mut tracker, progress);
                    }
                    return;
                }
            }
        }
    }

    fn on_progress(&self, tracker: &mut ProgressTracker, progress: UploadProgress) {
        self.update(|st| {
            if progress.total > 0 {
                st.monitor.touch(Instant::now());
            }
            match tracker.update(progress.sent, progress.total) {
                ProgressStep::Advanced(pct) => st.show(
                    Notice::progress(SENDING_TEXT, Some(pct)).with_action(NoticeAction::CancelUpload),
                ),
                ProgressStep::Storing => {
                    st.hide(NoticeSlot::Progress);
                    st.show(Notice::progress(STORING_TEXT, None));
                }
                ProgressStep::Unchanged => {}
            }
        });
    }

    // -- helpers ------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the state lock, then publish the events it produced.
    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, events) = {
            let mut st = self.lock();
            let result = f(&mut st);
            (result, std::mem::take(&mut st.outbox))
        };
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
        result
    }

    /// Name used in connection texts: the sub-printer slug, or the display
    /// name when no slug is known.
    fn label(&self) -> String {
        let desc = &self.inner.descriptor;
        if desc.slug().is_empty() {
            desc.name.clone()
        } else {
            desc.slug().to_owned()
        }
    }

    fn api_prefix(&self) -> String {
        format!("printer/api/{}", self.inner.descriptor.slug())
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        instance_headers(&self.inner.descriptor, Some(api_key))
    }

    fn api_request(
        &self,
        st: &SessionState,
        method: Method,
        action: &str,
        body: Body,
    ) -> Result<(Arc<dyn Transport>, Request)> {
        let transport = st.transport.clone().ok_or(RepetierError::NoActiveSession)?;
        let base = format!("{}{}", self.inner.descriptor.base_url(), self.api_prefix());
        let url = with_query(&base, &[("a", action), ("apikey", st.api_key.as_str())])?;
        let request = match method {
            Method::Get => Request::get(url),
            Method::Post => Request::post(url, body),
        }
        .headers(&self.auth_headers(&st.api_key));
        Ok((transport, request))
    }
}

/// Form body of a `send` call carrying `cmd`.
fn command_body(cmd: &str) -> Body {
    Body::Form(vec![("data".to_owned(), json!({ "cmd": cmd }).to_string())])
}
