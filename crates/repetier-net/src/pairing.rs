// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// API-key pairing: ask the server for a key and wait until someone approves
// the request in the server's web UI.
//
//   POST plugin/appkeys/request {"app": <name>}
//     202 → pending, re-polled (GET, same URL) every poll interval
//     200 → granted, body carries "api_key"
//     404 → denied
//
// A granted key is written to the credential cache for the instance.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use repetier_core::config::PluginConfig;
use repetier_core::error::{RepetierError, Result};
use repetier_core::types::InstanceDescriptor;
use repetier_store::CredentialCache;

use crate::payload::parse_json;
use crate::transport::{Body, Reply, Request, Transport, instance_headers};

const REQUEST_PATH: &str = "plugin/appkeys/request";
const PROBE_PATH: &str = "plugin/appkeys/probe";

/// Where a pairing request stands after one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    Pending,
    Granted(String),
    Denied,
}

/// Interpret a pairing reply.
pub fn pairing_status(reply: &Reply) -> Result<PairingStatus> {
    match reply.status {
        201 | 202 => Ok(PairingStatus::Pending),
        200 => parse_json(&reply.body)
            .get("api_key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(|k| PairingStatus::Granted(k.to_owned()))
            .ok_or_else(|| RepetierError::MalformedBody("pairing reply without api_key".into())),
        404 => Ok(PairingStatus::Denied),
        status => Err(RepetierError::Pairing(format!(
            "unexpected reply {status} {}",
            reply.reason
        ))),
    }
}

/// Whether the instance offers key pairing at all.
#[instrument(skip_all, fields(instance = %instance.id))]
pub async fn supports_pairing(transport: &dyn Transport, instance: &InstanceDescriptor) -> Result<bool> {
    let url = format!("{}{PROBE_PATH}", instance.base_url());
    let reply = transport
        .request(Request::get(url).headers(&instance_headers(instance, None)))
        .await?;
    debug!(status = reply.status, "pairing probe answered");
    Ok(reply.status == 204)
}

/// A running pairing request.
pub struct PairingHandle {
    instance_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<String>>,
}

impl PairingHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Stop waiting for approval. `wait` then returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the outcome: the granted key, `Pairing` when denied, or
    /// `Cancelled`.
    pub async fn wait(mut self) -> Result<String> {
        (&mut self.task)
            .await
            .map_err(|e| RepetierError::Pairing(format!("pairing task failed: {e}")))?
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start pairing with `instance`. Must be called from within a tokio runtime.
pub fn request_api_key(
    transport: Arc<dyn Transport>,
    config: &PluginConfig,
    instance: &InstanceDescriptor,
    credentials: Arc<Mutex<CredentialCache>>,
) -> PairingHandle {
    let cancel = CancellationToken::new();
    let flow = PairingFlow {
        transport,
        url: format!("{}{REQUEST_PATH}", instance.base_url()),
        headers: instance_headers(instance, None),
        app: config.app_name.clone(),
        interval: config.pairing_poll_interval,
        instance_id: instance.id.clone(),
        credentials,
    };
    let task = tokio::spawn(flow.run(cancel.clone()));
    PairingHandle {
        instance_id: instance.id.clone(),
        cancel,
        task,
    }
}

struct PairingFlow {
    transport: Arc<dyn Transport>,
    url: String,
    headers: Vec<(String, String)>,
    app: String,
    interval: Duration,
    instance_id: String,
    credentials: Arc<Mutex<CredentialCache>>,
}

impl PairingFlow {
    #[instrument(skip_all, fields(instance = %self.instance_id))]
    async fn run(self, cancel: CancellationToken) -> Result<String> {
        info!("requesting API key");
        let request = Request::post(self.url.clone(), Body::Json(json!({ "app": self.app })))
            .headers(&self.headers);
        let mut reply = self.send(request, &cancel).await?;

        loop {
            match pairing_status(&reply)? {
                PairingStatus::Granted(key) => {
                    info!("API key granted");
                    self.credentials
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .set(&self.instance_id, &key)?;
                    return Ok(key);
                }
                PairingStatus::Denied => {
                    warn!("API key request denied");
                    return Err(RepetierError::Pairing("request denied".into()));
                }
                PairingStatus::Pending => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RepetierError::Cancelled),
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                    let poll = Request::get(self.url.clone()).headers(&self.headers);
                    reply = self.send(poll, &cancel).await?;
                }
            }
        }
    }

    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Reply> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pairing cancelled");
                Err(RepetierError::Cancelled)
            }
            reply = self.transport.request(request) => reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::Method;
    use crate::transport::mock::ScriptedTransport;
    use repetier_store::{MemoryPreferences, shared};

    fn cache() -> Arc<Mutex<CredentialCache>> {
        Arc::new(Mutex::new(CredentialCache::load(shared(MemoryPreferences::new()))))
    }

    fn instance() -> InstanceDescriptor {
        InstanceDescriptor::new("office", "10.0.0.5", 3344)
    }

    #[test]
    fn reply_statuses_map_to_pairing_states() {
        assert_eq!(pairing_status(&Reply::new(202)).unwrap(), PairingStatus::Pending);
        assert_eq!(pairing_status(&Reply::new(404)).unwrap(), PairingStatus::Denied);
        let granted = Reply::new(200).with_body(r#"{"api_key":"abc"}"#);
        assert_eq!(
            pairing_status(&granted).unwrap(),
            PairingStatus::Granted("abc".into())
        );
        assert!(pairing_status(&Reply::new(200)).is_err());
        assert!(pairing_status(&Reply::new(500)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_request_is_polled_until_granted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_: &Request| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(Reply::new(202))
            } else {
                Ok(Reply::new(200).with_body(r#"{"api_key":"granted-key"}"#))
            }
        });
        let credentials = cache();
        let handle = request_api_key(
            transport.clone(),
            &PluginConfig::default(),
            &instance(),
            credentials.clone(),
        );

        assert_eq!(handle.wait().await.unwrap(), "granted-key");
        assert_eq!(credentials.lock().unwrap().get("office"), Some("granted-key"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].body, Body::Json(json!({"app": "cura"})));
        assert!(requests[1..].iter().all(|r| r.method == Method::Get));
        assert!(requests.iter().all(|r| r.url == "http://10.0.0.5:3344/plugin/appkeys/request"));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_request_fails() {
        let transport = ScriptedTransport::new(|_: &Request| Ok(Reply::new(404)));
        let handle = request_api_key(transport, &PluginConfig::default(), &instance(), cache());
        assert!(matches!(handle.wait().await, Err(RepetierError::Pairing(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_request_can_be_cancelled() {
        let transport = ScriptedTransport::new(|_: &Request| Ok(Reply::new(202)));
        let credentials = cache();
        let handle = request_api_key(
            transport.clone(),
            &PluginConfig::default(),
            &instance(),
            credentials.clone(),
        );
        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.cancel();

        assert!(matches!(handle.wait().await, Err(RepetierError::Cancelled)));
        assert!(credentials.lock().unwrap().is_empty());
        // Initial request plus the polls at 500 ms and 1000 ms.
        assert_eq!(transport.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pairing_support_reported_on_no_content() {
        let transport = ScriptedTransport::new(|req: &Request| {
            assert!(req.url.ends_with("plugin/appkeys/probe"));
            Ok(Reply::new(204))
        });
        assert!(supports_pairing(transport.as_ref(), &instance()).await.unwrap());

        transport.respond_with(|_: &Request| Ok(Reply::new(404)));
        assert!(!supports_pairing(transport.as_ref(), &instance()).await.unwrap());
    }
}
