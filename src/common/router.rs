// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::registry::DeviceRegistry;
use super::scan::{DiscoveredCallback, ScanCompleteCallback, ScanSession};
use crate::api::{AdapterState, DeviceId, Radio, RadioEvent};
use crate::device::Device;
use log::{info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Routes radio events to the device they concern. Lives on the event loop thread.
pub(crate) struct EventRouter {
    registry: Arc<DeviceRegistry>,
    scan: ScanSession,
    radio: Arc<dyn Radio>,
    state: watch::Sender<AdapterState>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        scan: ScanSession,
        radio: Arc<dyn Radio>,
        state: watch::Sender<AdapterState>,
    ) -> Self {
        EventRouter {
            registry,
            scan,
            radio,
            state,
        }
    }

    pub fn scan(&mut self) -> &mut ScanSession {
        &mut self.scan
    }

    /// Start a discovery session and sweep identities of devices nobody holds anymore.
    pub fn start_scan(
        &mut self,
        timeout: Option<Duration>,
        on_discovered: Option<DiscoveredCallback>,
        on_complete: Option<ScanCompleteCallback>,
    ) -> u64 {
        let generation = self.scan.start(timeout, on_discovered, on_complete);
        self.registry.prune();
        generation
    }

    pub fn connect(&self, device: &Device) {
        let state = *self.state.borrow();
        if !state.is_available() {
            warn!("Connecting {} while adapter is {:?}", device.id(), state);
        }
        self.registry.register(device);
        self.radio.connect(device.id());
    }

    pub fn disconnect(&self, device: &Device) {
        self.registry.register(device);
        self.radio.disconnect(device.id());
    }

    pub fn forget(&self, id: &DeviceId) {
        if self.registry.remove(id).is_some() {
            info!("Forgot {}", id);
        }
    }

    fn resolve(&self, id: &DeviceId, what: &str) -> Option<Device> {
        let device = self.registry.resolve(id);
        if device.is_none() {
            trace!("{} for unregistered device {}, ignoring", what, id);
        }
        device
    }

    pub fn dispatch(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChanged(state) => {
                info!("Adapter state changed to {:?}", state);
                self.state.send_replace(state);
            }
            RadioEvent::Discovered {
                id,
                name,
                advertisement,
                rssi,
            } => {
                self.scan
                    .discovered(&self.registry, id, name, advertisement, rssi);
            }
            RadioEvent::Connected(id) => {
                if let Some(device) = self.resolve(&id, "Connected") {
                    device.did_connect();
                }
            }
            RadioEvent::ConnectFailed(id, error) => {
                if let Some(device) = self.resolve(&id, "ConnectFailed") {
                    device.did_fail_to_connect(error);
                }
            }
            RadioEvent::Disconnected(id, error) => {
                if let Some(device) = self.resolve(&id, "Disconnected") {
                    device.did_disconnect(error);
                }
            }
            RadioEvent::NameUpdated(id, name) => {
                if let Some(device) = self.resolve(&id, "NameUpdated") {
                    device.did_update_name(name);
                }
            }
            RadioEvent::ServicesModified { id, invalidated } => {
                if let Some(device) = self.resolve(&id, "ServicesModified") {
                    device.did_modify_services(invalidated);
                }
            }
            RadioEvent::ServicesDiscovered {
                id,
                services,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "ServicesDiscovered") {
                    device.did_discover_services(services, error);
                }
            }
            RadioEvent::IncludedServicesDiscovered {
                id,
                service,
                included,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "IncludedServicesDiscovered") {
                    device.did_discover_included_services(service, included, error);
                }
            }
            RadioEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "CharacteristicsDiscovered") {
                    device.did_discover_characteristics(service, characteristics, error);
                }
            }
            RadioEvent::DescriptorsDiscovered {
                id,
                characteristic,
                descriptors,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "DescriptorsDiscovered") {
                    device.did_discover_descriptors(characteristic, descriptors, error);
                }
            }
            RadioEvent::ValueUpdated {
                id,
                attribute,
                value,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "ValueUpdated") {
                    device.did_update_value(attribute, value, error);
                }
            }
            RadioEvent::ValueWritten {
                id,
                attribute,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "ValueWritten") {
                    device.did_write_value(attribute, error);
                }
            }
            RadioEvent::NotifyStateChanged {
                id,
                characteristic,
                enabled,
                error,
            } => {
                if let Some(device) = self.resolve(&id, "NotifyStateChanged") {
                    device.did_update_notification_state(characteristic, enabled, error);
                }
            }
            RadioEvent::RssiUpdated { id, rssi, error } => {
                if let Some(device) = self.resolve(&id, "RssiUpdated") {
                    device.did_update_rssi(rssi, error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AdvertisementData, Attribute, RadioError};
    use crate::config::AdapterConfig;
    use crate::device::DeviceEvent;
    use crate::test_utils::{MockRadio, RadioCommand};
    use uuid::Uuid;

    fn router() -> (Arc<MockRadio>, EventRouter, watch::Receiver<AdapterState>) {
        let radio = Arc::new(MockRadio::default());
        let (state, states) = watch::channel(AdapterState::PoweredOn);
        let router = EventRouter::new(
            Arc::new(DeviceRegistry::default()),
            ScanSession::new(radio.clone(), AdapterConfig::default()),
            radio.clone(),
            state,
        );
        (radio, router, states)
    }

    fn device(radio: &Arc<MockRadio>, id: &str) -> Device {
        Device::new(id.into(), radio.clone(), &AdapterConfig::default())
    }

    #[test]
    fn connect_registers_once_and_always_calls_radio() {
        let (radio, router, _) = router();
        let x = device(&radio, "X");
        router.connect(&x);
        router.connect(&x);
        assert_eq!(router.registry.len(), 1);
        assert_eq!(
            radio.commands(),
            vec![
                RadioCommand::Connect("X".into()),
                RadioCommand::Connect("X".into())
            ]
        );
    }

    #[test]
    fn connection_events_reach_registered_device_once() {
        let (radio, mut router, _) = router();
        let x = device(&radio, "X");
        let mut events = x.subscribe();
        router.connect(&x);
        router.dispatch(RadioEvent::Connected("X".into()));
        assert!(x.is_connected());
        router.dispatch(RadioEvent::Disconnected("X".into(), None));
        assert!(!x.is_connected());

        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Connected);
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Disconnected(None));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn events_for_unknown_ids_are_ignored() {
        let (radio, mut router, _) = router();
        let x = device(&radio, "X");
        let mut events = x.subscribe();
        router.connect(&x);

        router.dispatch(RadioEvent::Connected("Y".into()));
        router.dispatch(RadioEvent::ConnectFailed("Y".into(), RadioError::new("nope")));
        router.dispatch(RadioEvent::ValueUpdated {
            id: "Y".into(),
            attribute: Attribute::Characteristic(Uuid::nil()),
            value: vec![1],
            error: None,
        });
        router.dispatch(RadioEvent::RssiUpdated {
            id: "Y".into(),
            rssi: -40,
            error: None,
        });
        assert!(events.try_recv().is_err());
        assert_eq!(router.registry.len(), 1);
    }

    #[test]
    fn discovered_device_is_not_routed_until_connected() {
        let (radio, mut router, _) = router();
        router.scan().start(None, None, None);
        router.dispatch(RadioEvent::Discovered {
            id: "X".into(),
            name: Some("x".into()),
            advertisement: AdvertisementData::default(),
            rssi: -50,
        });
        router.dispatch(RadioEvent::Connected("X".into()));
        let x = router.scan().view().devices().pop().unwrap();
        assert!(!x.is_connected());

        router.connect(&x);
        router.dispatch(RadioEvent::Connected("X".into()));
        assert!(x.is_connected());
        assert!(radio.commands().contains(&RadioCommand::Connect("X".into())));
    }

    #[test]
    fn state_changes_are_published() {
        let (_radio, mut router, mut states) = router();
        router.dispatch(RadioEvent::StateChanged(AdapterState::PoweredOff));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), AdapterState::PoweredOff);
        assert_eq!(router.registry.len(), 0);
    }

    #[test]
    fn forget_stops_routing() {
        let (radio, mut router, _) = router();
        let x = device(&radio, "X");
        router.connect(&x);
        router.forget(x.id());
        router.dispatch(RadioEvent::Connected("X".into()));
        assert!(!x.is_connected());
    }

    #[test]
    fn scan_start_sweeps_dropped_identities() {
        let (_radio, mut router, _states) = router();
        router.start_scan(None, None, None);
        for n in 0..10 {
            router.dispatch(RadioEvent::Discovered {
                id: format!("{}", n).into(),
                name: Some("peripheral".into()),
                advertisement: AdvertisementData::default(),
                rssi: -50,
            });
        }
        assert_eq!(router.registry.known_len(), 10);

        // The new session lets go of the old results and nothing else holds them.
        router.start_scan(None, None, None);
        assert_eq!(router.registry.known_len(), 0);
    }
}
