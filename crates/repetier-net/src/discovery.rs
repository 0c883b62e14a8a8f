// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Discovery feed: Repetier-Server instances advertised over mDNS merged with
// the instances the user entered by hand.
//
// Browsing runs on the `mdns-sd` daemon. A background thread drains the
// browse receiver and turns resolved services into `InstanceDescriptor`s.
// A keepalive task restarts browsing whenever the listener has died or a
// resolved record was incomplete. Manual instances are replayed on every
// `start()`, after browsing is up, and shadow live instances with the same id.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repetier_core::config::{PluginConfig, parse_bool};
use repetier_core::error::{RepetierError, Result};
use repetier_core::types::{BasicAuth, InstanceDescriptor};
use repetier_store::{ManualInstance, ManualInstanceStore};

/// Instances appearing and disappearing.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added(InstanceDescriptor),
    /// Carries the instance id.
    Removed(String),
}

/// The parts of a resolved mDNS service the feed looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRecord {
    pub fullname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub properties: HashMap<String, String>,
}

impl ServiceRecord {
    pub fn from_info(info: &ServiceInfo) -> Self {
        Self {
            fullname: info.get_fullname().to_owned(),
            addresses: info.get_addresses().iter().copied().collect(),
            port: info.get_port(),
            properties: info
                .get_properties()
                .iter()
                .map(|p| (p.key().to_owned(), p.val_str().to_owned()))
                .collect(),
        }
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Recovers display names from advertised service names.
#[derive(Debug, Clone)]
pub struct NameParser {
    service_suffix: String,
    pattern: Regex,
}

impl NameParser {
    pub fn new(service_type: &str) -> Result<Self> {
        let pattern = Regex::new(r#"^Repetier instance (?:"(.*)"\.?|on (.*?)\.?)$"#)
            .map_err(|e| RepetierError::Discovery(format!("instance name pattern: {e}")))?;
        Ok(Self {
            service_suffix: format!(".{}", service_type.trim_start_matches('.')),
            pattern,
        })
    }

    /// Display name for `fullname`. Names that do not follow the Repetier
    /// pattern are shown as advertised.
    pub fn display_name(&self, fullname: &str) -> String {
        let instance = fullname
            .strip_suffix(&self.service_suffix)
            .unwrap_or(fullname);
        self.pattern
            .captures(instance)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| instance.to_owned())
    }
}

/// First usable address, formatted for a URL. Link-local addresses are
/// skipped; IPv4 is preferred; IPv6 is bracketed.
pub fn pick_address(addresses: &[IpAddr]) -> Option<String> {
    let mut usable: Vec<IpAddr> = addresses
        .iter()
        .copied()
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(v6) => !v6.is_unicast_link_local() && !v6.is_unspecified(),
        })
        .collect();
    usable.sort_by_key(|ip| (ip.is_ipv6(), *ip));
    usable.first().map(|ip| match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    })
}

/// Descriptor for a resolved record, `None` while address or port is missing.
pub fn descriptor_from_record(record: &ServiceRecord, names: &NameParser) -> Option<InstanceDescriptor> {
    if record.port == 0 {
        return None;
    }
    let host = pick_address(&record.addresses)?;
    let auth = BasicAuth::from_parts(
        record.property("userName").unwrap_or_default(),
        record.property("password").unwrap_or_default(),
    );
    Some(
        InstanceDescriptor::new(record.fullname.clone(), host, record.port)
            .with_name(names.display_name(&record.fullname))
            .with_path(record.property("path").unwrap_or("/"))
            .with_https(record.property("useHttps").is_some_and(parse_bool))
            .with_basic_auth(auth)
            .with_repetier_id(record.property("repetier_id").map(String::from)),
    )
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the feed, its listener threads and the keepalive.
struct FeedShared {
    service_type: String,
    names: NameParser,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    manual: Mutex<ManualInstanceStore>,
    live: Mutex<BTreeMap<String, InstanceDescriptor>>,
    daemon: Mutex<Option<ServiceDaemon>>,
    /// Bumped on every browse (re)start; stale listeners compare against it.
    browse_generation: AtomicU64,
    healthy: AtomicBool,
    requery: AtomicBool,
}

impl FeedShared {
    fn emit(&self, event: DiscoveryEvent) {
        if self.events.send(event).is_err() {
            debug!("discovery event dropped, no receiver");
        }
    }

    fn start_browse(self: &Arc<Self>) -> Result<()> {
        let mut slot = lock(&self.daemon);
        if slot.is_none() {
            let daemon = ServiceDaemon::new()
                .map_err(|e| RepetierError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
            *slot = Some(daemon);
        }
        let Some(daemon) = slot.as_ref() else {
            return Err(RepetierError::Discovery("mDNS daemon unavailable".into()));
        };

        // A previous browse may still be registered; restarting it re-sends
        // the queries.
        let _ = daemon.stop_browse(&self.service_type);
        let receiver = match daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                // Daemon is likely dead; build a fresh one next time.
                *slot = None;
                return Err(RepetierError::Discovery(format!("browse {}: {e}", self.service_type)));
            }
        };
        drop(slot);

        let generation = self.browse_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.healthy.store(true, Ordering::SeqCst);
        spawn_listener(Arc::clone(self), receiver, generation)?;
        info!(service_type = %self.service_type, "mDNS discovery started");
        Ok(())
    }

    fn stop_browse(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.browse_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(daemon) = lock(&self.daemon).take() {
            let _ = daemon.stop_browse(&self.service_type);
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "mDNS daemon shutdown failed");
            }
        }
    }

    fn resolved(&self, mut desc: InstanceDescriptor) {
        let mut live = lock(&self.live);
        if let Some(previous) = live.get(&desc.id) {
            desc.discovered_at = previous.discovered_at;
            if *previous == desc {
                return;
            }
        }
        live.insert(desc.id.clone(), desc.clone());
        drop(live);

        if lock(&self.manual).contains(&desc.id) {
            debug!(id = %desc.id, "discovered instance shadowed by manual entry");
            return;
        }
        info!(id = %desc.id, url = %desc.base_url(), "instance discovered");
        self.emit(DiscoveryEvent::Added(desc));
    }

    fn removed(&self, id: &str) {
        if lock(&self.live).remove(id).is_none() {
            return;
        }
        if lock(&self.manual).contains(id) {
            return;
        }
        info!(id = %id, "instance went away");
        self.emit(DiscoveryEvent::Removed(id.to_owned()));
    }

    fn handle(&self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::SearchStarted(stype) => {
                debug!(service_type = %stype, "mDNS search started");
            }
            ServiceEvent::ServiceFound(stype, fullname) => {
                debug!(service_type = %stype, name = %fullname, "service found");
            }
            ServiceEvent::ServiceResolved(info) => {
                let record = ServiceRecord::from_info(&info);
                match descriptor_from_record(&record, &self.names) {
                    Some(desc) => self.resolved(desc),
                    None => {
                        debug!(name = %record.fullname, "incomplete service record");
                        self.requery.store(true, Ordering::SeqCst);
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => self.removed(&fullname),
            ServiceEvent::SearchStopped(stype) => {
                debug!(service_type = %stype, "mDNS search stopped");
                return false;
            }
        }
        true
    }
}

/// Drain one browse receiver on its own thread. When the channel closes
/// without a deliberate stop, the feed is marked unhealthy.
fn spawn_listener(
    shared: Arc<FeedShared>,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    generation: u64,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("mdns-{}", shared.service_type))
        .spawn(move || {
            while let Ok(event) = receiver.recv() {
                if shared.browse_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if !shared.handle(event) {
                    return;
                }
            }
            if shared.browse_generation.load(Ordering::SeqCst) == generation {
                warn!("mDNS listener lost its daemon");
                shared.healthy.store(false, Ordering::SeqCst);
            }
        })
        .map(|_| ())
        .map_err(|e| RepetierError::Discovery(format!("failed to spawn mDNS listener: {e}")))
}

/// Live plus manual instance discovery.
pub struct DiscoveryFeed {
    config: PluginConfig,
    shared: Arc<FeedShared>,
    keepalive: Option<CancellationToken>,
}

impl DiscoveryFeed {
    /// Build a feed over the persisted manual instances. Events arrive on the
    /// returned receiver.
    pub fn new(
        config: PluginConfig,
        manual: ManualInstanceStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FeedShared {
            service_type: config.service_type.clone(),
            names: NameParser::new(&config.service_type)?,
            events,
            manual: Mutex::new(manual),
            live: Mutex::new(BTreeMap::new()),
            daemon: Mutex::new(None),
            browse_generation: AtomicU64::new(0),
            healthy: AtomicBool::new(false),
            requery: AtomicBool::new(false),
        });
        Ok((
            Self {
                config,
                shared,
                keepalive: None,
            },
            rx,
        ))
    }

    /// Start browsing and replay the manual instances. A browse failure is
    /// logged and retried by the keepalive. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self) {
        if let Err(e) = self.shared.start_browse() {
            warn!(error = %e, "mDNS discovery unavailable, will retry");
        }
        self.replay_manual();
        if self.keepalive.is_none() {
            self.keepalive = Some(self.spawn_keepalive());
        }
    }

    /// Stop browsing and the keepalive.
    pub fn stop(&mut self) {
        if let Some(token) = self.keepalive.take() {
            token.cancel();
        }
        self.shared.stop_browse();
        info!("mDNS discovery stopped");
    }

    /// Whether mDNS browsing is currently alive.
    pub fn is_running(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }

    fn replay_manual(&self) {
        let descriptors = lock(&self.shared.manual).descriptors();
        debug!(count = descriptors.len(), "replaying manual instances");
        for desc in descriptors {
            self.shared.emit(DiscoveryEvent::Added(desc));
        }
    }

    fn spawn_keepalive(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let shared = Arc::clone(&self.shared);
        let period = self.config.discovery_keepalive;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let requery = shared.requery.swap(false, Ordering::SeqCst);
                        let healthy = shared.healthy.load(Ordering::SeqCst);
                        if healthy && !requery {
                            continue;
                        }
                        if healthy {
                            debug!("re-querying incomplete service records");
                        } else {
                            warn!("mDNS discovery not running, restarting");
                        }
                        if let Err(e) = shared.start_browse() {
                            warn!(error = %e, "mDNS restart failed");
                        }
                    }
                }
            }
        });
        token
    }

    /// Persist a manual instance and announce it.
    pub fn add_manual(&self, name: &str, entry: ManualInstance) -> Result<InstanceDescriptor> {
        let desc = lock(&self.shared.manual).add(name, entry)?;
        info!(id = %desc.id, url = %desc.base_url(), "manual instance added");
        self.shared.emit(DiscoveryEvent::Added(desc.clone()));
        Ok(desc)
    }

    /// Forget a manual instance. A live instance it was shadowing is
    /// announced again.
    pub fn remove_manual(&self, name: &str) -> Result<bool> {
        if !lock(&self.shared.manual).remove(name)? {
            return Ok(false);
        }
        info!(id = %name, "manual instance removed");
        self.shared.emit(DiscoveryEvent::Removed(name.to_owned()));
        let shadowed = lock(&self.shared.live).get(name).cloned();
        if let Some(desc) = shadowed {
            self.shared.emit(DiscoveryEvent::Added(desc));
        }
        Ok(true)
    }

    pub fn manual_instance(&self, name: &str) -> Option<ManualInstance> {
        lock(&self.shared.manual).get(name).cloned()
    }

    pub fn manual_instances(&self) -> Vec<InstanceDescriptor> {
        lock(&self.shared.manual).descriptors()
    }

    /// Everything currently known, manual entries winning on id clashes.
    pub fn instances(&self) -> Vec<InstanceDescriptor> {
        let mut all: BTreeMap<String, InstanceDescriptor> = lock(&self.shared.live).clone();
        for desc in self.manual_instances() {
            all.insert(desc.id.clone(), desc);
        }
        all.into_values().collect()
    }

    #[cfg(test)]
    fn inject(&self, record: &ServiceRecord) {
        match descriptor_from_record(record, &self.shared.names) {
            Some(desc) => self.shared.resolved(desc),
            None => self.shared.requery.store(true, Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    fn inject_removed(&self, fullname: &str) {
        self.shared.removed(fullname);
    }
}

impl Drop for DiscoveryFeed {
    fn drop(&mut self) {
        if let Some(token) = self.keepalive.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;
    use repetier_store::{MemoryPreferences, shared};

    const SERVICE: &str = "_repetier._tcp.local.";

    fn parser() -> NameParser {
        NameParser::new(SERVICE).unwrap()
    }

    #[test]
    fn quoted_name_is_extracted() {
        let names = parser();
        assert_eq!(
            names.display_name(r#"Repetier instance "Office"._repetier._tcp.local."#),
            "Office"
        );
        assert_eq!(names.display_name(r#"Repetier instance "Office"."#), "Office");
    }

    #[test]
    fn host_name_is_extracted() {
        let names = parser();
        assert_eq!(
            names.display_name("Repetier instance on 10.0.0.5._repetier._tcp.local."),
            "10.0.0.5"
        );
        assert_eq!(names.display_name("Repetier instance on 10.0.0.5."), "10.0.0.5");
    }

    #[test]
    fn foreign_names_are_kept() {
        assert_eq!(parser().display_name("Garage._repetier._tcp.local."), "Garage");
    }

    #[test]
    fn link_local_addresses_are_skipped() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::new(169, 254, 3, 4)),
            IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()),
            IpAddr::V6("2001:db8::5".parse::<Ipv6Addr>().unwrap()),
        ];
        assert_eq!(pick_address(&addrs).as_deref(), Some("[2001:db8::5]"));

        let with_v4 = [addrs[2], IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))];
        assert_eq!(pick_address(&with_v4).as_deref(), Some("192.168.1.20"));
        assert_eq!(pick_address(&addrs[..2]), None);
    }

    fn record(name: &str) -> ServiceRecord {
        ServiceRecord {
            fullname: format!(r#"Repetier instance "{name}"._repetier._tcp.local."#),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))],
            port: 3344,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn record_properties_fill_descriptor() {
        let mut rec = record("Office");
        rec.properties.insert("path".into(), "repetier".into());
        rec.properties.insert("useHttps".into(), "true".into());
        rec.properties.insert("userName".into(), "admin".into());
        rec.properties.insert("password".into(), "pw".into());
        rec.properties.insert("repetier_id".into(), "mk3".into());

        let desc = descriptor_from_record(&rec, &parser()).unwrap();
        assert_eq!(desc.name, "Office");
        assert_eq!(desc.base_url(), "https://192.168.1.20:3344/repetier/");
        assert_eq!(desc.repetier_id.as_deref(), Some("mk3"));
        assert_eq!(desc.basic_auth.unwrap().username, "admin");
        assert!(!desc.manual);
    }

    #[test]
    fn incomplete_records_are_not_usable() {
        let mut no_port = record("Office");
        no_port.port = 0;
        assert!(descriptor_from_record(&no_port, &parser()).is_none());

        let mut no_addr = record("Office");
        no_addr.addresses.clear();
        assert!(descriptor_from_record(&no_addr, &parser()).is_none());
    }

    fn feed() -> (DiscoveryFeed, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let store = ManualInstanceStore::load(shared(MemoryPreferences::new()));
        DiscoveryFeed::new(PluginConfig::default(), store).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn repeated_announcements_are_deduplicated() {
        let (feed, mut rx) = feed();
        feed.inject(&record("Office"));
        feed.inject(&record("Office"));
        assert_eq!(drain(&mut rx).len(), 1);

        feed.inject_removed(&record("Office").fullname);
        feed.inject_removed(&record("Office").fullname);
        let events = drain(&mut rx);
        assert_eq!(events, vec![DiscoveryEvent::Removed(record("Office").fullname)]);
    }

    #[test]
    fn incomplete_record_requests_requery() {
        let (feed, mut rx) = feed();
        let mut rec = record("Office");
        rec.addresses.clear();
        feed.inject(&rec);
        assert!(drain(&mut rx).is_empty());
        assert!(feed.shared.requery.load(Ordering::SeqCst));
    }

    #[test]
    fn manual_entries_shadow_live_ones() {
        let (feed, mut rx) = feed();
        let live = record("Office");
        let id = live.fullname.clone();

        feed.add_manual(&id, ManualInstance::new("10.0.0.9", 80)).unwrap();
        feed.inject(&live);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DiscoveryEvent::Added(d) if d.manual));

        let all = feed.instances();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].host, "10.0.0.9");

        // Removing the manual entry brings the live one back.
        assert!(feed.remove_manual(&id).unwrap());
        let events = drain(&mut rx);
        assert_eq!(events[0], DiscoveryEvent::Removed(id.clone()));
        assert!(matches!(&events[1], DiscoveryEvent::Added(d) if !d.manual && d.host == "192.168.1.20"));
    }

    #[test]
    fn manual_instance_can_be_readded_after_removal() {
        let (feed, mut rx) = feed();
        feed.add_manual("Lab", ManualInstance::new("10.0.0.7", 3344)).unwrap();
        assert!(feed.remove_manual("Lab").unwrap());
        assert!(!feed.remove_manual("Lab").unwrap());
        feed.add_manual("Lab", ManualInstance::new("10.0.0.8", 3344)).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], DiscoveryEvent::Added(d) if d.host == "10.0.0.8"));
        assert_eq!(feed.manual_instance("Lab").unwrap().address, "10.0.0.8");
    }

    #[test]
    fn replay_announces_every_manual_instance() {
        let (feed, mut rx) = feed();
        feed.add_manual("A", ManualInstance::new("10.0.0.1", 3344)).unwrap();
        feed.add_manual("B", ManualInstance::new("10.0.0.2", 3344)).unwrap();
        drain(&mut rx);

        feed.replay_manual();
        let ids: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                DiscoveryEvent::Added(d) => Some(d.id),
                DiscoveryEvent::Removed(_) => None,
            })
            .collect();
        assert_eq!(ids, ["A", "B"]);
    }
}
