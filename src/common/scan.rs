// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::registry::DeviceRegistry;
use crate::api::{AdvertisementData, DeviceId, Radio};
use crate::config::AdapterConfig;
use crate::device::Device;
use dashmap::DashMap;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type DiscoveredCallback = Box<dyn FnMut(&Device) + Send>;
pub type ScanCompleteCallback = Box<dyn FnOnce(Vec<Device>) + Send>;

/// Read-only view of the scan state, safe to use from any thread.
#[derive(Clone, Debug, Default)]
pub(crate) struct ScanView {
    discovered: Arc<DashMap<DeviceId, Device>>,
    scanning: Arc<AtomicBool>,
}

impl ScanView {
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.discovered.iter().map(|d| d.value().clone()).collect()
    }
}

/// One discovery session at a time. Owned by the event loop; only the loop mutates it.
pub(crate) struct ScanSession {
    view: ScanView,
    generation: u64,
    on_discovered: Option<DiscoveredCallback>,
    on_complete: Option<ScanCompleteCallback>,
    radio: Arc<dyn Radio>,
    config: AdapterConfig,
}

impl ScanSession {
    pub fn new(radio: Arc<dyn Radio>, config: AdapterConfig) -> Self {
        ScanSession {
            view: ScanView::default(),
            generation: 0,
            on_discovered: None,
            on_complete: None,
            radio,
            config,
        }
    }

    pub fn view(&self) -> ScanView {
        self.view.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.view.is_scanning()
    }

    /// Begin a new session and return its generation. A session already running is completed
    /// first, so its completion handler sees its own results.
    pub fn start(
        &mut self,
        timeout: Option<Duration>,
        on_discovered: Option<DiscoveredCallback>,
        on_complete: Option<ScanCompleteCallback>,
    ) -> u64 {
        if self.is_scanning() {
            debug!("Scan {} still running, completing it first", self.generation);
            self.stop(None);
        }
        self.view.discovered.clear();
        self.generation += 1;
        self.on_discovered = on_discovered;
        self.on_complete = on_complete;
        self.view.scanning.store(true, Ordering::SeqCst);
        info!("Starting scan {} (timeout {:?})", self.generation, timeout);
        self.radio.start_scan(self.config.allow_duplicates);
        self.generation
    }

    /// Handle an advertisement report.
    pub fn discovered(
        &mut self,
        registry: &DeviceRegistry,
        id: DeviceId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        if !self.is_scanning() {
            trace!("Discovery of {} outside a scan, ignoring", id);
            return;
        }
        let name = name.or_else(|| advertisement.local_name.clone());
        if name.is_none() && self.config.require_name {
            trace!("Dropping anonymous peripheral {}", id);
            return;
        }

        let device = match self.view.discovered.get(&id) {
            Some(device) => device.value().clone(),
            None => {
                let radio = self.radio.clone();
                let config = &self.config;
                registry.obtain(&id, || Device::new(id.clone(), radio, config))
            }
        };
        device.did_discover(name, advertisement, rssi);
        if self
            .view
            .discovered
            .insert(id.clone(), device.clone())
            .is_none()
        {
            debug!("Discovered {} ({:?})", id, device.name());
        }
        if let Some(on_discovered) = self.on_discovered.as_mut() {
            on_discovered(&device);
        }
    }

    /// End the session. Without a generation this always stops; with one, only if it is still
    /// the current session. A session that is not running is left alone apart from clearing
    /// its handlers.
    pub fn stop(&mut self, generation: Option<u64>) {
        if let Some(generation) = generation {
            if generation != self.generation {
                trace!(
                    "Ignoring stop for scan {}, scan {} is current",
                    generation,
                    self.generation
                );
                return;
            }
        }
        let was_scanning = self.view.scanning.swap(false, Ordering::SeqCst);
        self.on_discovered = None;
        let on_complete = self.on_complete.take();
        if !was_scanning {
            return;
        }
        info!(
            "Stopping scan {}, {} devices discovered",
            self.generation,
            self.view.discovered.len()
        );
        self.radio.stop_scan();
        if let Some(on_complete) = on_complete {
            on_complete(self.view.devices());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockRadio, RadioCommand};
    use std::sync::Mutex;

    fn session() -> (Arc<MockRadio>, ScanSession, DeviceRegistry) {
        let radio = Arc::new(MockRadio::default());
        let session = ScanSession::new(radio.clone(), AdapterConfig::default());
        (radio, session, DeviceRegistry::default())
    }

    fn advertise(session: &mut ScanSession, registry: &DeviceRegistry, id: &str, name: Option<&str>) {
        session.discovered(
            registry,
            id.into(),
            name.map(String::from),
            AdvertisementData::default(),
            -60,
        );
    }

    #[test]
    fn duplicates_are_reported_but_stored_once() {
        let (_radio, mut session, registry) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.start(
            None,
            Some(Box::new(move |device: &Device| {
                sink.lock().unwrap().push(device.id().clone())
            })),
            None,
        );
        advertise(&mut session, &registry, "A", Some("a"));
        advertise(&mut session, &registry, "A", Some("a"));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(session.view().devices().len(), 1);
    }

    #[test]
    fn anonymous_dropped_unless_allowed() {
        let (radio, mut session, registry) = session();
        let reports = Arc::new(Mutex::new(0));
        let counter = reports.clone();
        session.start(
            None,
            Some(Box::new(move |_: &Device| *counter.lock().unwrap() += 1)),
            None,
        );
        advertise(&mut session, &registry, "A", None);
        assert!(session.view().devices().is_empty());
        assert_eq!(*reports.lock().unwrap(), 0);

        let mut lenient =
            ScanSession::new(radio, AdapterConfig::default().with_require_name(false));
        let counter = reports.clone();
        lenient.start(
            None,
            Some(Box::new(move |_: &Device| *counter.lock().unwrap() += 1)),
            None,
        );
        advertise(&mut lenient, &registry, "A", None);
        assert_eq!(lenient.view().devices().len(), 1);
        assert_eq!(*reports.lock().unwrap(), 1);
    }

    #[test]
    fn advertised_local_name_counts_as_name() {
        let (_radio, mut session, registry) = session();
        session.start(None, None, None);
        session.discovered(
            &registry,
            "A".into(),
            None,
            AdvertisementData {
                local_name: Some("Polar H10".into()),
                ..Default::default()
            },
            -70,
        );
        let devices = session.view().devices();
        assert_eq!(devices[0].name(), Some("Polar H10".into()));
    }

    #[test]
    fn stop_completes_once() {
        let (radio, mut session, registry) = session();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = completions.clone();
        session.start(
            None,
            None,
            Some(Box::new(move |devices: Vec<Device>| {
                sink.lock().unwrap().push(devices.len())
            })),
        );
        advertise(&mut session, &registry, "A", Some("a"));
        session.stop(None);
        session.stop(None);
        assert_eq!(*completions.lock().unwrap(), vec![1]);
        assert!(!session.is_scanning());
        assert_eq!(
            radio.commands(),
            vec![RadioCommand::StartScan(true), RadioCommand::StopScan]
        );
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (_radio, mut session, _registry) = session();
        let first = session.start(Some(Duration::from_secs(1)), None, None);
        let second = session.start(Some(Duration::from_secs(1)), None, None);
        session.stop(Some(first));
        assert!(session.is_scanning());
        session.stop(Some(second));
        assert!(!session.is_scanning());
    }

    #[test]
    fn restart_completes_previous_and_clears() {
        let (_radio, mut session, registry) = session();
        let completed = Arc::new(Mutex::new(None));
        let sink = completed.clone();
        session.start(
            None,
            None,
            Some(Box::new(move |devices: Vec<Device>| {
                *sink.lock().unwrap() = Some(devices.len())
            })),
        );
        advertise(&mut session, &registry, "A", Some("a"));
        session.start(None, None, None);
        assert_eq!(*completed.lock().unwrap(), Some(1));
        assert!(session.view().devices().is_empty());
    }

    #[test]
    fn discovery_after_stop_is_ignored() {
        let (_radio, mut session, registry) = session();
        session.start(None, None, None);
        session.stop(None);
        advertise(&mut session, &registry, "A", Some("a"));
        assert!(session.view().devices().is_empty());
    }

    #[test]
    fn rediscovery_reuses_registered_device() {
        let (_radio, mut session, registry) = session();
        session.start(None, None, None);
        advertise(&mut session, &registry, "A", Some("a"));
        let first = session.view().devices().pop().unwrap();
        registry.register(&first);
        first.did_connect();

        session.start(None, None, None);
        advertise(&mut session, &registry, "A", Some("a"));
        let again = session.view().devices().pop().unwrap();
        assert!(again.is_connected());
    }
}
