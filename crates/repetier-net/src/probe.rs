// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One-shot checks run while the user sets an instance up: which printers the
// server hosts, whether an API key works, and which model groups exist.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use repetier_core::error::{RepetierError, Result};
use repetier_core::types::InstanceDescriptor;
use repetier_store::CredentialCache;

use crate::camera::normalize_camera_url;
use crate::payload::{ServerInfo, parse_json, parse_model_groups, parse_printer_config, parse_server_info};
use crate::transport::{Reply, Request, Transport, instance_headers, with_query};

/// Outcome of an API key check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApiKeyCheck {
    pub accepted: bool,
    pub sd_supported: bool,
    pub has_camera: bool,
}

/// Runs setup checks against instances.
pub struct InstanceProbe {
    transport: Arc<dyn Transport>,
    credentials: Arc<Mutex<CredentialCache>>,
}

impl InstanceProbe {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<Mutex<CredentialCache>>) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Enumerate the printers of an instance via `printer/info`. A key the
    /// server hands out here is remembered for the instance.
    #[instrument(skip_all, fields(instance = %instance.id))]
    pub async fn server_info(&self, instance: &InstanceDescriptor) -> Result<ServerInfo> {
        let url = format!("{}printer/info", instance.base_url());
        let request = Request::get(url).headers(&instance_headers(instance, None));
        let reply = self.transport.request(request).await?.error_for_status()?;
        let info = parse_server_info(&parse_json(&reply.body));
        debug!(printers = info.printers.len(), version = ?info.version, "server info received");

        if let Some(key) = &info.api_key {
            info!("server provided an API key");
            self.credentials
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set(&instance.id, key)?;
        }
        Ok(info)
    }

    /// Check `api_key` against printer `slug` by fetching its configuration.
    #[instrument(skip(self, instance, api_key), fields(instance = %instance.id))]
    pub async fn test_api_key(
        &self,
        instance: &InstanceDescriptor,
        slug: &str,
        api_key: &str,
    ) -> Result<ApiKeyCheck> {
        if api_key.is_empty() || slug.is_empty() {
            return Err(RepetierError::InvalidDescriptor(
                "API key and printer are required".into(),
            ));
        }
        let reply = self.api_get(instance, slug, api_key, "getPrinterConfig").await?;
        match reply.status {
            200 => {
                let config = parse_printer_config(&parse_json(&reply.body));
                let has_camera = config
                    .camera_url
                    .as_deref()
                    .is_some_and(|raw| normalize_camera_url(raw, instance).0.is_some());
                Ok(ApiKeyCheck {
                    accepted: true,
                    sd_supported: config.sd_supported.unwrap_or(false),
                    has_camera,
                })
            }
            401 => {
                warn!("API key rejected");
                Ok(ApiKeyCheck::default())
            }
            _ => reply.error_for_status().map(|_| ApiKeyCheck::default()),
        }
    }

    /// Model group names available for stored uploads.
    #[instrument(skip(self, instance, api_key), fields(instance = %instance.id))]
    pub async fn model_groups(
        &self,
        instance: &InstanceDescriptor,
        slug: &str,
        api_key: &str,
    ) -> Result<Vec<String>> {
        let reply = self
            .api_get(instance, slug, api_key, "listModelGroups")
            .await?
            .error_for_status()?;
        Ok(parse_model_groups(&parse_json(&reply.body)))
    }

    async fn api_get(
        &self,
        instance: &InstanceDescriptor,
        slug: &str,
        api_key: &str,
        action: &str,
    ) -> Result<Reply> {
        let base = format!("{}printer/api/{slug}", instance.base_url());
        let url = with_query(&base, &[("a", action), ("apikey", api_key)])?;
        let request = Request::get(url).headers(&instance_headers(instance, Some(api_key)));
        self.transport.request(request).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use repetier_store::{MemoryPreferences, shared};

    fn probe(transport: Arc<ScriptedTransport>) -> (InstanceProbe, Arc<Mutex<CredentialCache>>) {
        let cache = Arc::new(Mutex::new(CredentialCache::load(shared(MemoryPreferences::new()))));
        (InstanceProbe::new(transport, cache.clone()), cache)
    }

    fn instance() -> InstanceDescriptor {
        InstanceDescriptor::new("office", "10.0.0.5", 3344)
    }

    #[tokio::test]
    async fn server_info_lists_printers_and_caches_key() {
        let transport = ScriptedTransport::new(|_: &Request| {
            let body = json!({
                "printers": [{"slug": "mk3", "name": "Prusa"}, {"slug": "ender", "name": "Ender"}],
                "apikey": "from-server"
            });
            Ok(Reply::new(200).with_body(body.to_string()))
        });
        let (probe, cache) = probe(transport.clone());

        let info = probe.server_info(&instance()).await.unwrap();
        let slugs: Vec<&str> = info.printers.iter().map(|p| p.slug.as_str()).collect();
        assert_eq!(slugs, ["mk3", "ender"]);
        assert_eq!(cache.lock().unwrap().get("office"), Some("from-server"));
        assert_eq!(transport.urls(), ["http://10.0.0.5:3344/printer/info"]);
    }

    #[tokio::test]
    async fn accepted_key_reports_capabilities() {
        let transport = ScriptedTransport::new(|_: &Request| {
            let body = json!({"general": {"sdcard": true}, "webcams": [{"dynamicUrl": "/cam"}]});
            Ok(Reply::new(200).with_body(body.to_string()))
        });
        let (probe, _) = probe(transport.clone());

        let check = probe.test_api_key(&instance(), "mk3", "k").await.unwrap();
        assert_eq!(
            check,
            ApiKeyCheck {
                accepted: true,
                sd_supported: true,
                has_camera: true
            }
        );
        assert_eq!(
            transport.urls(),
            ["http://10.0.0.5:3344/printer/api/mk3?a=getPrinterConfig&apikey=k"]
        );
    }

    #[tokio::test]
    async fn rejected_key_is_not_an_error() {
        let transport = ScriptedTransport::new(|_: &Request| Ok(Reply::new(401)));
        let (probe, _) = probe(transport);
        let check = probe.test_api_key(&instance(), "mk3", "bad").await.unwrap();
        assert!(!check.accepted);
        assert!(probe.test_api_key(&instance(), "mk3", "").await.is_err());
    }

    #[tokio::test]
    async fn model_groups_are_listed() {
        let transport = ScriptedTransport::new(|_: &Request| {
            Ok(Reply::new(200).with_body(json!({"groupNames": ["#", "Benchies"]}).to_string()))
        });
        let (probe, _) = probe(transport);
        let groups = probe.model_groups(&instance(), "mk3", "k").await.unwrap();
        assert_eq!(groups, ["#", "Benchies"]);
    }
}
