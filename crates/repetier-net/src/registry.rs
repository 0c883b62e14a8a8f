// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session registry: one `Session` per known instance, keyed by instance id.
//
// The registry decides which session is live. `recheck()` receives the host's
// current selection explicitly and connects that session while closing the
// rest. A watcher task per session mirrors its connection state into the
// device list: a session is a device exactly while it is connected.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use repetier_core::config::{ActiveMachine, PluginConfig};
use repetier_core::error::Result;
use repetier_core::types::{ConnectionState, InstanceDescriptor};

use crate::discovery::DiscoveryEvent;
use crate::session::{Session, SessionEvent};
use crate::transport::TransportFactory;

const DEVICE_EVENT_CAPACITY: usize = 32;

/// Changes of the host's device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Registered(String),
    Unregistered(String),
}

/// Ids of the sessions currently connected.
struct DeviceList {
    ids: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceList {
    fn set(&self, id: &str, connected: bool) {
        let changed = {
            let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
            if connected {
                ids.insert(id.to_owned())
            } else {
                ids.remove(id)
            }
        };
        if changed {
            let event = if connected {
                info!(instance = %id, "device registered");
                DeviceEvent::Registered(id.to_owned())
            } else {
                info!(instance = %id, "device unregistered");
                DeviceEvent::Unregistered(id.to_owned())
            };
            let _ = self.events.send(event);
        }
    }
}

struct Entry {
    session: Session,
    watcher: JoinHandle<()>,
}

impl Entry {
    fn shut_down(self, devices: &DeviceList) {
        self.watcher.abort();
        self.session.disconnect();
        devices.set(self.session.id(), false);
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Entry>,
    active: Option<ActiveMachine>,
}

/// All sessions known to the host.
pub struct SessionRegistry {
    config: PluginConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<RegistryState>,
    devices: Arc<DeviceList>,
}

impl SessionRegistry {
    pub fn new(config: PluginConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(DEVICE_EVENT_CAPACITY);
        Self {
            config,
            factory,
            state: Mutex::new(RegistryState::default()),
            devices: Arc::new(DeviceList {
                ids: Mutex::new(BTreeSet::new()),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session for `descriptor`, replacing (and closing) any
    /// session with the same id. The new session connects right away when it
    /// is the host's active machine. Must be called from within a tokio
    /// runtime.
    #[instrument(skip_all, fields(instance = %descriptor.id))]
    pub fn add(&self, descriptor: InstanceDescriptor) -> Result<Session> {
        let session = Session::new(descriptor, self.config.clone(), Arc::clone(&self.factory));
        let watcher = spawn_watcher(session.clone(), Arc::clone(&self.devices));

        let (previous, active) = {
            let mut st = self.lock();
            let previous = st.sessions.insert(
                session.id().to_owned(),
                Entry {
                    session: session.clone(),
                    watcher,
                },
            );
            let active = st
                .active
                .clone()
                .filter(|a| a.instance_id == session.id());
            (previous, active)
        };
        if let Some(previous) = previous {
            debug!("replacing existing session");
            previous.shut_down(&self.devices);
        }

        match active {
            Some(active) => activate(&session, &active)?,
            None => debug!("session added"),
        }
        Ok(session)
    }

    /// Close and drop the session for `id`. Returns whether it existed.
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> bool {
        let entry = self.lock().sessions.remove(id);
        match entry {
            Some(entry) => {
                entry.shut_down(&self.devices);
                info!("session removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().sessions.get(id).map(|e| e.session.clone())
    }

    /// All sessions, sorted by display name.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().sessions.values().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// The machine passed to the last `recheck()`.
    pub fn active(&self) -> Option<ActiveMachine> {
        self.lock().active.clone()
    }

    /// The active session, if the selected machine is known.
    pub fn active_session(&self) -> Option<Session> {
        let st = self.lock();
        let id = &st.active.as_ref()?.instance_id;
        st.sessions.get(id).map(|e| e.session.clone())
    }

    /// Re-evaluate which session should be live after the host's selection or
    /// stored API key changed.
    ///
    /// The selected session gets the API key and preferences and connects if
    /// it is closed. Every other open session is closed.
    #[instrument(skip_all, fields(active = active.map(|a| a.instance_id.as_str()).unwrap_or("")))]
    pub fn recheck(&self, active: Option<&ActiveMachine>) -> Result<()> {
        let sessions = {
            let mut st = self.lock();
            st.active = active.cloned();
            st.sessions.values().map(|e| e.session.clone()).collect::<Vec<_>>()
        };

        for session in sessions {
            match active {
                Some(active) if active.instance_id == session.id() => activate(&session, active)?,
                _ => {
                    if session.connection_state() != ConnectionState::Closed {
                        session.close();
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one discovery event.
    pub fn apply(&self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Added(desc) => self.add(desc).map(|_| ()),
            DiscoveryEvent::Removed(id) => {
                self.remove(&id);
                Ok(())
            }
        }
    }

    /// Feed discovery events into the registry until the feed is dropped.
    pub async fn follow(&self, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply(event) {
                warn!(error = %e, "failed to apply discovery event");
            }
        }
        debug!("discovery feed closed");
    }

    /// Ids of the connected sessions.
    pub fn devices(&self) -> Vec<String> {
        self.devices
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceEvent> {
        self.devices.events.subscribe()
    }

    /// Close every session.
    pub fn close_all(&self) {
        let entries: Vec<Entry> = self.lock().sessions.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.shut_down(&self.devices);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for entry in self.lock().sessions.values() {
            entry.watcher.abort();
        }
    }
}

fn activate(session: &Session, active: &ActiveMachine) -> Result<()> {
    session.set_api_key(&active.api_key);
    session.set_preferences(active.preferences.clone());
    if session.connection_state() == ConnectionState::Closed {
        session.connect()?;
    }
    Ok(())
}

fn spawn_watcher(session: Session, devices: Arc<DeviceList>) -> JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ConnectionState(state)) => {
                    devices.set(session.id(), state == ConnectionState::Connected);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(instance = %session.id(), skipped, "session events lagged, resyncing");
                    devices.set(session.id(), session.connection_state() == ConnectionState::Connected);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transport::mock::{ScriptedFactory, ScriptedTransport};
    use crate::transport::{Reply, Request};

    fn registry() -> (SessionRegistry, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new(|req: &Request| {
            let body = if req.url.contains("a=listPrinter") {
                json!([{"slug": "mk3", "job": "none", "online": 1}])
            } else {
                json!({})
            };
            Ok(Reply::new(200).with_body(body.to_string()))
        });
        let factory = ScriptedFactory::new(transport.clone());
        (SessionRegistry::new(PluginConfig::default(), factory), transport)
    }

    fn desc(id: &str, name: &str) -> InstanceDescriptor {
        InstanceDescriptor::new(id, "10.0.0.5", 3344)
            .with_name(name)
            .with_repetier_id(Some("mk3".into()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_connects_only_the_active_session() {
        let (registry, transport) = registry();
        let office = registry.add(desc("office", "Office")).unwrap();
        let lab = registry.add(desc("lab", "Lab")).unwrap();

        registry.recheck(Some(&ActiveMachine::new("office", "key-1"))).unwrap();
        settle().await;
        assert_eq!(office.connection_state(), ConnectionState::Connected);
        assert_eq!(lab.connection_state(), ConnectionState::Closed);
        assert_eq!(registry.devices(), ["office"]);
        assert!(transport.urls().iter().all(|u| u.contains("apikey=key-1")));

        registry.recheck(Some(&ActiveMachine::new("lab", "key-2"))).unwrap();
        settle().await;
        assert_eq!(office.connection_state(), ConnectionState::Closed);
        assert_eq!(lab.connection_state(), ConnectionState::Connected);
        assert_eq!(registry.devices(), ["lab"]);
        assert_eq!(registry.active_session().unwrap().id(), "lab");

        registry.recheck(None).unwrap();
        settle().await;
        assert!(registry.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn added_active_session_connects_immediately() {
        let (registry, _) = registry();
        registry.recheck(Some(&ActiveMachine::new("office", "k"))).unwrap();
        let office = registry.add(desc("office", "Office")).unwrap();
        settle().await;
        assert_eq!(office.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_add_replaces_and_closes_old_session() {
        let (registry, _) = registry();
        registry.recheck(Some(&ActiveMachine::new("office", "k"))).unwrap();
        let old = registry.add(desc("office", "Office")).unwrap();
        settle().await;

        let new = registry.add(desc("office", "Office (moved)")).unwrap();
        settle().await;
        assert_eq!(old.connection_state(), ConnectionState::Closed);
        assert_eq!(new.connection_state(), ConnectionState::Connected);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("office").unwrap().name(), "Office (moved)");
        assert_eq!(registry.devices(), ["office"]);
    }

    #[tokio::test(start_paused = true)]
    async fn list_is_sorted_by_name() {
        let (registry, _) = registry();
        registry.add(desc("c", "Zeta")).unwrap();
        registry.add(desc("a", "Alpha")).unwrap();
        registry.add(desc("b", "Mid")).unwrap();
        let names: Vec<String> = registry.list().iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, ["Alpha", "Mid", "Zeta"]);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_unregisters_device() {
        let (registry, _) = registry();
        let mut device_events = registry.subscribe_devices();
        registry.recheck(Some(&ActiveMachine::new("office", "k"))).unwrap();
        let office = registry.add(desc("office", "Office")).unwrap();
        settle().await;

        assert!(registry.remove("office"));
        assert!(!registry.remove("office"));
        assert_eq!(office.connection_state(), ConnectionState::Closed);
        assert!(registry.get("office").is_none());
        assert!(registry.devices().is_empty());

        assert_eq!(device_events.try_recv().unwrap(), DeviceEvent::Registered("office".into()));
        assert_eq!(device_events.try_recv().unwrap(), DeviceEvent::Unregistered("office".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_discovery_events() {
        let (registry, _) = registry();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DiscoveryEvent::Added(desc("office", "Office"))).unwrap();
        tx.send(DiscoveryEvent::Added(desc("lab", "Lab"))).unwrap();
        tx.send(DiscoveryEvent::Removed("office".into())).unwrap();
        drop(tx);

        registry.follow(rx).await;
        let ids: Vec<String> = registry.list().iter().map(|s| s.id().to_owned()).collect();
        assert_eq!(ids, ["lab"]);
    }
}
