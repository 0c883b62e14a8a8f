// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Host-facing service layer. Owns the preference stores, the discovery feed
// and the session registry, and exposes the operations a host UI (or the
// headless monitor) calls.
//
// The feed and caches are not `Sync`, so they sit behind `Arc<Mutex<>>`.
// Locks are only held for in-memory work; nothing awaits while holding one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use repetier_core::config::{ActiveMachine, PluginConfig, PrinterPreferences};
use repetier_core::error::{RepetierError, Result};
use repetier_core::types::InstanceDescriptor;
use repetier_net::payload::ServerInfo;
use repetier_net::{
    ApiKeyCheck, DiscoveryEvent, DiscoveryFeed, HttpTransportFactory, InstanceProbe, PairingHandle,
    SessionRegistry, SessionStatus, TransportFactory, UploadOutcome,
};
use repetier_store::{
    CredentialCache, JsonFilePreferences, ManualInstance, ManualInstanceStore, MemoryPreferences,
    SharedPreferences, shared,
};

const PREFERENCES_FILE: &str = "preferences.json";

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared services for the host. Every field is Arc-wrapped, so clones are
/// cheap and can move into spawned tasks.
#[derive(Clone)]
pub struct HostServices {
    config: PluginConfig,
    data_dir: Option<PathBuf>,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<Mutex<CredentialCache>>,
    discovery: Arc<Mutex<DiscoveryFeed>>,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    registry: Arc<SessionRegistry>,
    machine: Arc<Mutex<Option<ActiveMachine>>>,
    pairing: Arc<Mutex<Option<PairingHandle>>>,
}

impl HostServices {
    /// Initialise against a data directory: `config.json` for the link
    /// settings, `preferences.json` for credentials and manual instances.
    pub fn init(data_dir: &Path) -> Result<Self> {
        info!(path = %data_dir.display(), "initialising host services");
        let config = load_config(data_dir).unwrap_or_default();
        let prefs = shared(JsonFilePreferences::open(data_dir.join(PREFERENCES_FILE))?);
        let factory = Arc::new(HttpTransportFactory::new(config.clone()));
        let mut services = Self::with_parts(config, prefs, factory)?;
        services.data_dir = Some(data_dir.to_path_buf());
        Ok(services)
    }

    /// In-memory services for when the data directory is unusable. Nothing
    /// is persisted.
    pub fn fallback() -> Result<Self> {
        warn!("using in-memory preferences, nothing will be persisted");
        let config = PluginConfig::default();
        let factory = Arc::new(HttpTransportFactory::new(config.clone()));
        Self::with_parts(config, shared(MemoryPreferences::new()), factory)
    }

    /// Assemble from explicit parts.
    pub fn with_parts(
        config: PluginConfig,
        prefs: SharedPreferences,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let credentials = CredentialCache::load(prefs.clone());
        let manual = ManualInstanceStore::load(prefs);
        let (feed, events) = DiscoveryFeed::new(config.clone(), manual)?;
        let registry = SessionRegistry::new(config.clone(), factory.clone());

        Ok(Self {
            config,
            data_dir: None,
            factory,
            credentials: Arc::new(Mutex::new(credentials)),
            discovery: Arc::new(Mutex::new(feed)),
            events: Arc::new(Mutex::new(Some(events))),
            pump: Arc::new(Mutex::new(None)),
            registry: Arc::new(registry),
            machine: Arc::new(Mutex::new(None)),
            pairing: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // -- Discovery -----------------------------------------------------------

    /// Route discovery events into the registry. Idempotent. Must be called
    /// from within a tokio runtime.
    pub fn spawn_event_pump(&self) {
        let Some(events) = lock(&self.events).take() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move { registry.follow(events).await });
        *lock(&self.pump) = Some(handle);
        debug!("discovery event pump started");
    }

    /// Start mDNS browsing and replay the manual instances.
    pub fn start_discovery(&self) {
        self.spawn_event_pump();
        lock(&self.discovery).start();
    }

    pub fn stop_discovery(&self) {
        lock(&self.discovery).stop();
    }

    pub fn is_discovering(&self) -> bool {
        lock(&self.discovery).is_running()
    }

    /// Every known instance, manual entries included.
    pub fn discovered_instances(&self) -> Vec<InstanceDescriptor> {
        lock(&self.discovery).instances()
    }

    pub fn manual_instance(&self, name: &str) -> Option<ManualInstance> {
        lock(&self.discovery).manual_instance(name)
    }

    pub fn add_manual_instance(&self, name: &str, entry: ManualInstance) -> Result<InstanceDescriptor> {
        lock(&self.discovery).add_manual(name, entry)
    }

    pub fn remove_manual_instance(&self, name: &str) -> Result<bool> {
        lock(&self.discovery).remove_manual(name)
    }

    fn descriptor(&self, instance_id: &str) -> Result<InstanceDescriptor> {
        if let Some(session) = self.registry.get(instance_id) {
            return Ok(session.descriptor().clone());
        }
        self.discovered_instances()
            .into_iter()
            .find(|d| d.id == instance_id)
            .ok_or_else(|| RepetierError::UnknownInstance(instance_id.to_owned()))
    }

    // -- Machine selection and credentials ------------------------------------

    pub fn api_key(&self, instance_id: &str) -> Option<String> {
        lock(&self.credentials).get(instance_id).map(str::to_owned)
    }

    /// Store a key for the instance and re-evaluate the live session.
    pub fn set_api_key(&self, instance_id: &str, api_key: &str) -> Result<()> {
        lock(&self.credentials).set(instance_id, api_key)?;
        let active = {
            let mut machine = lock(&self.machine);
            if let Some(m) = machine.as_mut().filter(|m| m.instance_id == instance_id) {
                m.api_key = api_key.to_owned();
            }
            machine.clone()
        };
        self.registry.recheck(active.as_ref())
    }

    /// Make `instance_id` the selected machine. The stored key is used when
    /// one exists. `None` deselects every machine.
    pub fn select_machine(&self, instance_id: Option<&str>, preferences: PrinterPreferences) -> Result<()> {
        let active = instance_id.map(|id| ActiveMachine {
            instance_id: id.to_owned(),
            api_key: self.api_key(id).unwrap_or_default(),
            preferences,
        });
        info!(machine = ?instance_id, "machine selected");
        *lock(&self.machine) = active.clone();
        self.registry.recheck(active.as_ref())
    }

    pub fn set_preferences(&self, preferences: PrinterPreferences) -> Result<()> {
        let active = {
            let mut machine = lock(&self.machine);
            match machine.as_mut() {
                Some(m) => m.preferences = preferences,
                None => return Err(RepetierError::NoActiveSession),
            }
            machine.clone()
        };
        self.registry.recheck(active.as_ref())
    }

    pub fn active_machine(&self) -> Option<ActiveMachine> {
        lock(&self.machine).clone()
    }

    // -- Status views ----------------------------------------------------------

    pub fn status(&self, instance_id: &str) -> Option<SessionStatus> {
        self.registry.get(instance_id).map(|s| s.status())
    }

    /// One status per registered session, ordered by name.
    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.registry.list().iter().map(|s| s.status()).collect()
    }

    pub fn devices(&self) -> Vec<String> {
        self.registry.devices()
    }

    // -- Pairing ---------------------------------------------------------------

    pub async fn supports_pairing(&self, instance_id: &str) -> Result<bool> {
        let descriptor = self.descriptor(instance_id)?;
        let transport = self.factory.create()?;
        repetier_net::supports_pairing(transport.as_ref(), &descriptor).await
    }

    /// Ask the instance for an API key. A pairing already running is
    /// cancelled first.
    pub fn start_pairing(&self, instance_id: &str) -> Result<()> {
        let descriptor = self.descriptor(instance_id)?;
        let transport = self.factory.create()?;
        let handle = repetier_net::request_api_key(
            transport,
            &self.config,
            &descriptor,
            Arc::clone(&self.credentials),
        );
        if let Some(previous) = lock(&self.pairing).replace(handle) {
            debug!(instance = %previous.instance_id(), "replacing running pairing request");
            previous.cancel();
        }
        Ok(())
    }

    /// Wait for the running pairing request. A granted key becomes the
    /// instance's key, exactly as if it had been entered by hand.
    pub async fn wait_for_pairing(&self) -> Result<String> {
        let handle = lock(&self.pairing).take().ok_or(RepetierError::Cancelled)?;
        let instance_id = handle.instance_id().to_owned();
        let key = handle.wait().await?;
        self.set_api_key(&instance_id, &key)?;
        Ok(key)
    }

    pub fn cancel_pairing(&self) -> bool {
        match lock(&self.pairing).take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    // -- Probing ---------------------------------------------------------------

    fn probe(&self) -> Result<InstanceProbe> {
        Ok(InstanceProbe::new(self.factory.create()?, Arc::clone(&self.credentials)))
    }

    pub async fn server_info(&self, instance_id: &str) -> Result<ServerInfo> {
        let descriptor = self.descriptor(instance_id)?;
        self.probe()?.server_info(&descriptor).await
    }

    pub async fn test_api_key(&self, instance_id: &str, slug: &str, api_key: &str) -> Result<ApiKeyCheck> {
        let descriptor = self.descriptor(instance_id)?;
        self.probe()?.test_api_key(&descriptor, slug, api_key).await
    }

    pub async fn model_groups(&self, instance_id: &str, slug: &str, api_key: &str) -> Result<Vec<String>> {
        let descriptor = self.descriptor(instance_id)?;
        self.probe()?.model_groups(&descriptor, slug, api_key).await
    }

    // -- Printing --------------------------------------------------------------

    pub async fn print(&self, job_name: &str, gcode: Vec<u8>) -> Result<UploadOutcome> {
        let session = self.registry.active_session().ok_or(RepetierError::NoActiveSession)?;
        session.print(job_name, gcode).await
    }

    pub async fn queue_print(&self) -> Result<Option<UploadOutcome>> {
        let session = self.registry.active_session().ok_or(RepetierError::NoActiveSession)?;
        session.queue_print().await
    }

    /// Fetch the active machine's SD support and webcam settings again.
    pub async fn refresh_config(&self) -> Result<()> {
        let session = self.registry.active_session().ok_or(RepetierError::NoActiveSession)?;
        session.refresh_config().await;
        Ok(())
    }

    pub fn cancel_upload(&self) -> bool {
        self.registry
            .active_session()
            .is_some_and(|session| session.cancel_upload())
    }

    // -- Config persistence ----------------------------------------------------

    /// Write the link settings to `config.json`. A no-op for in-memory
    /// services.
    pub fn save_config(&self) -> Result<()> {
        match &self.data_dir {
            Some(dir) => persist_config(dir, &self.config),
            None => Ok(()),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Stop everything: pairing, discovery, the event pump and all sessions.
    pub fn shutdown(&self) {
        self.cancel_pairing();
        self.stop_discovery();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.registry.close_all();
        info!("host services shut down");
    }
}

// -- Config file persistence -------------------------------------------------

const CONFIG_FILE: &str = "config.json";

fn load_config(data_dir: &Path) -> Option<PluginConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&data) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config");
            None
        }
    }
}

fn persist_config(data_dir: &Path, config: &PluginConfig) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(data_dir.join(CONFIG_FILE), json)?;
    Ok(())
}
