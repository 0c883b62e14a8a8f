// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP transport.
//
// Sessions never talk to `reqwest` directly. They go through the `Transport`
// trait so the whole state machine can run against a scripted transport in
// tests, and so a session can throw its transport away and build a fresh one
// through a `TransportFactory` after prolonged silence.
//
// Every reply with an HTTP status is returned as `Ok(Reply)`; callers decide
// what a 401 or 409 means for them. `Err` is reserved for requests that never
// produced a status (timeout, refused connection, unreadable body).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::redirect::Policy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use repetier_core::config::PluginConfig;
use repetier_core::error::{RepetierError, Result};
use repetier_core::types::{BasicAuth, InstanceDescriptor};

/// Header carrying the Repetier API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Size of the chunks the upload body is streamed in. Progress is reported
/// once per chunk.
const UPLOAD_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    /// `application/x-www-form-urlencoded` fields.
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// A single HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: Body) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend_from_slice(headers);
        self
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response to a request that reached the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub status: u16,
    /// HTTP reason phrase, empty when unknown.
    pub reason: String,
    /// `Location` header, if present.
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_owned();
        Self {
            status,
            reason,
            location: None,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-2xx reply into `RepetierError::HttpStatus`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RepetierError::HttpStatus {
                status: self.status,
                reason: self.reason,
            })
        }
    }
}

/// One part of a multipart upload.
#[derive(Clone, PartialEq)]
pub struct FormPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for FormPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormPart")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: value.into().into_bytes(),
        }
    }

    pub fn file(name: impl Into<String>, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: Some("application/octet-stream".into()),
            data,
        }
    }
}

/// A multipart upload request.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub parts: Vec<FormPart>,
}

/// Bytes of file data handed to the network so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

/// Request execution used by sessions, pairing and probing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a request. Any HTTP status is an `Ok` reply.
    async fn request(&self, request: Request) -> Result<Reply>;

    /// Send a multipart upload, reporting file progress on `progress`.
    ///
    /// Cancelling `cancel` aborts the transfer and returns
    /// `RepetierError::Cancelled`. A dropped progress receiver is ignored.
    async fn upload(
        &self,
        upload: Upload,
        progress: mpsc::UnboundedSender<UploadProgress>,
        cancel: CancellationToken,
    ) -> Result<Reply>;
}

/// Builds transports. Sessions call this on connect and again whenever the
/// current transport is considered dead.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Transport>>;
}

/// Append url-encoded query parameters to `url`.
pub fn with_query(url: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|e| RepetierError::InvalidDescriptor(format!("{url}: {e}")))?;
    if !params.is_empty() {
        parsed.query_pairs_mut().extend_pairs(params);
    }
    Ok(parsed.into())
}

/// `Authorization` header value for basic auth.
pub fn basic_auth_header(auth: &BasicAuth) -> String {
    let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
    format!("Basic {token}")
}

/// Headers identifying the caller to `instance`: the API key when one is
/// given, and basic auth when the descriptor carries credentials.
pub fn instance_headers(instance: &InstanceDescriptor, api_key: Option<&str>) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(2);
    if let Some(key) = api_key {
        headers.push((API_KEY_HEADER.to_owned(), key.to_owned()));
    }
    if let Some(auth) = &instance.basic_auth {
        headers.push(("Authorization".to_owned(), basic_auth_header(auth)));
    }
    headers
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// `reqwest`-backed transport.
///
/// Follows redirects and accepts self-signed certificates, since Repetier
/// servers on a LAN rarely carry a trusted one.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .danger_accept_invalid_certs(true)
            .redirect(Policy::limited(10))
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| RepetierError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout: config.request_timeout,
        })
    }

    async fn into_reply(response: reqwest::Response) -> Result<Reply> {
        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await.map_err(map_error)?;
        Ok(Reply {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            location,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(method = ?request.method, url = %request.url))]
    async fn request(&self, request: Request) -> Result<Reply> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(self.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Form(fields) => builder.form(&fields),
            Body::Json(value) => builder.json(&value),
        };

        let response = builder.send().await.map_err(map_error)?;
        let reply = Self::into_reply(response).await?;
        debug!(status = reply.status, "request finished");
        Ok(reply)
    }

    #[instrument(skip_all, fields(url = %upload.url))]
    async fn upload(
        &self,
        upload: Upload,
        progress: mpsc::UnboundedSender<UploadProgress>,
        cancel: CancellationToken,
    ) -> Result<Reply> {
        let total: u64 = upload
            .parts
            .iter()
            .filter(|p| p.file_name.is_some())
            .map(|p| p.data.len() as u64)
            .sum();

        let mut form = multipart::Form::new();
        for part in upload.parts {
            form = match part.file_name {
                None => form.text(part.name, String::from_utf8_lossy(&part.data).into_owned()),
                Some(file_name) => {
                    let len = part.data.len() as u64;
                    let mut file_part = multipart::Part::stream_with_length(
                        progress_body(part.data, total, progress.clone()),
                        len,
                    )
                    .file_name(file_name);
                    if let Some(mime) = &part.content_type {
                        file_part = file_part.mime_str(mime).map_err(|e| {
                            RepetierError::Transport(format!("invalid content type {mime}: {e}"))
                        })?;
                    }
                    form.part(part.name, file_part)
                }
            };
        }

        let mut builder = self.client.post(&upload.url);
        for (name, value) in &upload.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let send = builder.multipart(form).send();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("upload aborted");
                Err(RepetierError::Cancelled)
            }
            response = send => {
                let reply = Self::into_reply(response.map_err(map_error)?).await?;
                debug!(status = reply.status, bytes = total, "upload finished");
                Ok(reply)
            }
        }
    }
}

/// Stream `data` in chunks, reporting cumulative progress as each chunk is
/// pulled by the HTTP stack.
fn progress_body(
    data: Vec<u8>,
    total: u64,
    progress: mpsc::UnboundedSender<UploadProgress>,
) -> reqwest::Body {
    reqwest::Body::wrap_stream(progress_stream(data, total, progress))
}

fn progress_stream(
    data: Vec<u8>,
    total: u64,
    progress: mpsc::UnboundedSender<UploadProgress>,
) -> impl futures::Stream<Item = std::io::Result<Vec<u8>>> + Send + Sync + 'static {
    let chunks: Vec<Vec<u8>> = data.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        // Receiver gone means nobody is watching; keep uploading.
        let _ = progress.send(UploadProgress { sent, total });
        Ok(chunk)
    })
}

fn map_error(e: reqwest::Error) -> RepetierError {
    if e.is_timeout() {
        RepetierError::Timeout
    } else if e.is_connect() || e.is_request() {
        RepetierError::Unreachable(e.to_string())
    } else if e.is_body() || e.is_decode() {
        RepetierError::MalformedBody(e.to_string())
    } else {
        warn!(error = %e, "unclassified HTTP failure");
        RepetierError::Transport(e.to_string())
    }
}

/// Factory producing `HttpTransport`s from a shared config.
pub struct HttpTransportFactory {
    config: PluginConfig,
}

impl HttpTransportFactory {
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(HttpTransport::new(&self.config)?))
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    type Responder = Box<dyn Fn(&Request) -> Result<Reply> + Send + Sync>;

    /// Answers requests from a closure and records everything it was asked.
    pub struct ScriptedTransport {
        responder: Mutex<Responder>,
        pub requests: Mutex<Vec<Request>>,
        pub uploads: Mutex<Vec<Upload>>,
        /// Progress steps emitted for each upload, as `(sent, total)`.
        pub upload_steps: Mutex<Vec<(u64, u64)>>,
        /// Reply to uploads; `None` waits until cancelled.
        pub upload_reply: Mutex<Option<Reply>>,
    }

    impl ScriptedTransport {
        pub fn new(responder: impl Fn(&Request) -> Result<Reply> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                responder: Mutex::new(Box::new(responder)),
                requests: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
                upload_steps: Mutex::new(Vec::new()),
                upload_reply: Mutex::new(Some(Reply::new(201))),
            })
        }

        pub fn respond_with(&self, responder: impl Fn(&Request) -> Result<Reply> + Send + Sync + 'static) {
            *self.responder.lock().unwrap() = Box::new(responder);
        }

        pub fn urls(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }

        pub fn count(&self, needle: &str) -> usize {
            self.urls().iter().filter(|u| u.contains(needle)).count()
        }

        pub fn clear(&self) {
            self.requests.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(&self, request: Request) -> Result<Reply> {
            let reply = {
                let responder = self.responder.lock().unwrap();
                (**responder)(&request)
            };
            self.requests.lock().unwrap().push(request);
            reply
        }

        async fn upload(
            &self,
            upload: Upload,
            progress: mpsc::UnboundedSender<UploadProgress>,
            cancel: CancellationToken,
        ) -> Result<Reply> {
            self.uploads.lock().unwrap().push(upload);
            let steps = self.upload_steps.lock().unwrap().clone();
            for (sent, total) in steps {
                let _ = progress.send(UploadProgress { sent, total });
                tokio::task::yield_now().await;
            }
            let reply = self.upload_reply.lock().unwrap().clone();
            match reply {
                Some(reply) => Ok(reply),
                None => {
                    cancel.cancelled().await;
                    Err(RepetierError::Cancelled)
                }
            }
        }
    }

    /// Hands out the same scripted transport and counts how often it did.
    pub struct ScriptedFactory {
        pub transport: Arc<ScriptedTransport>,
        pub created: AtomicUsize,
    }

    impl ScriptedFactory {
        pub fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
            Arc::new(Self {
                transport,
                created: AtomicUsize::new(0),
            })
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn create(&self) -> Result<Arc<dyn Transport>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.transport.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_reason_comes_from_status() {
        assert_eq!(Reply::new(409).reason, "Conflict");
        assert_eq!(Reply::new(599).reason, "");
    }

    #[test]
    fn non_success_reply_becomes_http_status_error() {
        let err = Reply::new(503).error_for_status().unwrap_err();
        assert!(matches!(err, RepetierError::HttpStatus { status: 503, .. }));
        assert!(Reply::new(204).error_for_status().is_ok());
    }

    #[test]
    fn basic_auth_header_is_base64_of_user_and_password() {
        let auth = BasicAuth::from_parts("user", "pass").unwrap();
        assert_eq!(basic_auth_header(&auth), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn query_parameters_are_encoded() {
        let url = with_query(
            "http://10.0.0.5:3344/printer/model/mk3",
            &[("a", "upload"), ("name", "my part.gcode"), ("group", "#")],
        )
        .unwrap();
        assert_eq!(
            url,
            "http://10.0.0.5:3344/printer/model/mk3?a=upload&name=my+part.gcode&group=%23"
        );
        assert!(with_query("not a url", &[]).is_err());
    }

    #[test]
    fn instance_headers_carry_key_and_basic_auth() {
        let plain = InstanceDescriptor::new("a", "h", 1);
        assert!(instance_headers(&plain, None).is_empty());

        let guarded = plain.with_basic_auth(BasicAuth::from_parts("user", "pass"));
        let headers = instance_headers(&guarded, Some("k"));
        assert_eq!(
            headers,
            vec![
                (API_KEY_HEADER.to_owned(), "k".to_owned()),
                ("Authorization".to_owned(), "Basic dXNlcjpwYXNz".to_owned()),
            ]
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = Request::get("http://h/").header("X-Api-Key", "k");
        assert_eq!(req.header_value("x-api-key"), Some("k"));
        assert_eq!(req.header_value("authorization"), None);
    }

    #[test]
    fn http_transport_builds_from_default_config() {
        assert!(HttpTransport::new(&PluginConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn progress_stream_reports_cumulative_bytes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data = vec![0u8; UPLOAD_CHUNK * 2 + 10];
        let total = data.len() as u64;

        let mut stream = Box::pin(progress_stream(data, total, tx));
        let mut seen = 0;
        while let Some(chunk) = stream.next().await {
            seen += chunk.unwrap().len() as u64;
        }
        assert_eq!(seen, total);

        let mut last = 0;
        while let Ok(p) = rx.try_recv() {
            assert!(p.sent > last);
            last = p.sent;
        }
        assert_eq!(last, total);
    }
}
