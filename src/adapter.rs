// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The [`Adapter`] facade and the event loop thread behind it.
//!
//! Every `Adapter` owns one thread, `ble-central-events`, that receives both the commands issued
//! through the facade and the events pushed by the [`Radio`]. Scan bookkeeping and event routing
//! only ever happen on that thread, one message at a time, so they need no locking of their own.
//! Facade calls just queue a message and return.

use crate::api::{AdapterState, DeviceId, EventSink, Radio, RadioEvent};
use crate::common::registry::DeviceRegistry;
use crate::common::router::EventRouter;
use crate::common::scan::{ScanSession, ScanView};
use crate::config::AdapterConfig;
use crate::device::Device;
use crate::{Error, Result};
use log::{debug, error, trace, warn};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};

pub use crate::common::scan::{DiscoveredCallback, ScanCompleteCallback};

pub(crate) enum LoopMessage {
    Radio(RadioEvent),
    Command(Command),
}

pub(crate) enum Command {
    StartScan {
        timeout: Option<Duration>,
        on_discovered: Option<DiscoveredCallback>,
        on_complete: Option<ScanCompleteCallback>,
    },
    /// `generation` is set by scan timers; a stop for an older scan is ignored.
    StopScan {
        generation: Option<u64>,
    },
    Connect(Device),
    Disconnect(Device),
    Forget(DeviceId),
    Synchronize(oneshot::Sender<()>),
    Shutdown,
}

struct Shared {
    sender: UnboundedSender<LoopMessage>,
    registry: Arc<DeviceRegistry>,
    scan: ScanView,
    state: watch::Receiver<AdapterState>,
    radio: Arc<dyn Radio>,
    config: AdapterConfig,
}

impl Drop for Shared {
    fn drop(&mut self) {
        trace!("Adapter::drop");
        let _ = self.sender.send(LoopMessage::Command(Command::Shutdown));
    }
}

/// Entry point of the crate: scans for peripherals and connects to them through a [`Radio`].
///
/// Cheap to clone. The event loop shuts down, stopping any running scan, when the last clone is
/// dropped.
#[derive(Clone)]
pub struct Adapter {
    shared: Arc<Shared>,
}

impl Adapter {
    /// Attach to `radio` with the default [`AdapterConfig`].
    pub fn new(radio: Arc<dyn Radio>) -> Result<Self> {
        Self::with_config(radio, AdapterConfig::default())
    }

    pub fn with_config(radio: Arc<dyn Radio>, config: AdapterConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AdapterState::Unknown);
        let registry = Arc::new(DeviceRegistry::default());
        let scan = ScanSession::new(radio.clone(), config.clone());
        let view = scan.view();
        let router = EventRouter::new(registry.clone(), scan, radio.clone(), state_tx);
        let timers = sender.downgrade();

        thread::Builder::new()
            .name("ble-central-events".into())
            .spawn(move || run_event_loop(receiver, timers, router))
            .map_err(|e| Error::Other(format!("Could not start event loop: {}", e)))?;

        radio.attach(EventSink::new(sender.clone()));

        Ok(Adapter {
            shared: Arc::new(Shared {
                sender,
                registry,
                scan: view,
                state: state_rx,
                radio,
                config,
            }),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    /// Scan until [`stop_scan`](Self::stop_scan) is called.
    pub fn scan(&self) -> Result<()> {
        self.start_scan(None, None, None)
    }

    /// Scan until stopped, calling `on_discovered` for every advertisement report. A peripheral
    /// that keeps advertising is reported more than once.
    pub fn scan_with(&self, on_discovered: DiscoveredCallback) -> Result<()> {
        self.start_scan(None, Some(on_discovered), None)
    }

    /// Scan for `timeout`, then stop and hand the deduplicated set of discovered devices to
    /// `on_complete`. Starting another scan or calling [`stop_scan`](Self::stop_scan) ends this
    /// one early; `on_complete` still runs exactly once.
    pub fn scan_for(
        &self,
        timeout: Duration,
        on_discovered: Option<DiscoveredCallback>,
        on_complete: ScanCompleteCallback,
    ) -> Result<()> {
        self.start_scan(Some(timeout), on_discovered, Some(on_complete))
    }

    /// Scan for the configured default duration and resolve to the discovered devices.
    pub async fn scan_and_collect(&self) -> Result<Vec<Device>> {
        let state = self.state();
        if state.is_unusable() {
            return Err(Error::AdapterUnavailable(state));
        }
        let (tx, rx) = oneshot::channel();
        self.scan_for(
            self.shared.config.default_scan_timeout,
            None,
            Box::new(move |devices| {
                let _ = tx.send(devices);
            }),
        )?;
        rx.await.map_err(|_| Error::EventLoopClosed)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan { generation: None })
    }

    fn start_scan(
        &self,
        timeout: Option<Duration>,
        on_discovered: Option<DiscoveredCallback>,
        on_complete: Option<ScanCompleteCallback>,
    ) -> Result<()> {
        let state = self.state();
        if state.is_unusable() {
            warn!("Starting a scan while adapter is {:?}", state);
        }
        self.send(Command::StartScan {
            timeout,
            on_discovered,
            on_complete,
        })
    }

    /// Register `device` so connection and GATT events reach it, then ask the radio to connect.
    /// The radio is asked on every call, even if a connection is already up or pending.
    pub fn connect(&self, device: &Device) -> Result<()> {
        self.send(Command::Connect(device.clone()))
    }

    pub fn disconnect(&self, device: &Device) -> Result<()> {
        self.send(Command::Disconnect(device.clone()))
    }

    /// Stop routing events to `device`. Its next connect registers it again.
    pub fn forget(&self, device: &Device) -> Result<()> {
        if self.shared.registry.resolve(device.id()).is_none() {
            return Err(Error::UnknownDevice(device.id().clone()));
        }
        self.send(Command::Forget(device.id().clone()))
    }

    /// The device object for `id`. Returns the registered or last discovered object if there
    /// is one, so the same peripheral is never represented twice.
    pub fn device(&self, id: impl Into<DeviceId>) -> Device {
        let id = id.into();
        let radio = self.shared.radio.clone();
        let config = &self.shared.config;
        self.shared
            .registry
            .obtain(&id, || Device::new(id.clone(), radio, config))
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scan.is_scanning()
    }

    /// Devices discovered by the current scan, or by the last one once it stopped.
    pub fn scanned_devices(&self) -> Vec<Device> {
        self.shared.scan.devices()
    }

    /// Devices registered through [`connect`](Self::connect) or [`disconnect`](Self::disconnect).
    pub fn devices(&self) -> Vec<Device> {
        self.shared.registry.devices()
    }

    pub fn state(&self) -> AdapterState {
        *self.shared.state.borrow()
    }

    /// Receiver that is notified whenever the radio reports a new adapter state.
    pub fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.shared.state.clone()
    }

    /// Resolves once every command and radio event queued before this call was handled.
    pub async fn synchronize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Synchronize(tx))?;
        rx.await.map_err(|_| Error::EventLoopClosed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared
            .sender
            .send(LoopMessage::Command(command))
            .map_err(|_| Error::EventLoopClosed)
    }
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("state", &self.state())
            .field("scanning", &self.is_scanning())
            .field("registered", &self.shared.registry.len())
            .finish()
    }
}

fn run_event_loop(
    mut receiver: UnboundedReceiver<LoopMessage>,
    timers: WeakUnboundedSender<LoopMessage>,
    mut router: EventRouter,
) {
    debug!("Event loop started");
    while let Some(message) = receiver.blocking_recv() {
        match message {
            LoopMessage::Radio(event) => router.dispatch(event),
            LoopMessage::Command(Command::StartScan {
                timeout,
                on_discovered,
                on_complete,
            }) => {
                let generation = router.start_scan(timeout, on_discovered, on_complete);
                if let Some(timeout) = timeout {
                    spawn_scan_timer(timers.clone(), generation, timeout);
                }
            }
            LoopMessage::Command(Command::StopScan { generation }) => {
                router.scan().stop(generation)
            }
            LoopMessage::Command(Command::Connect(device)) => router.connect(&device),
            LoopMessage::Command(Command::Disconnect(device)) => router.disconnect(&device),
            LoopMessage::Command(Command::Forget(id)) => router.forget(&id),
            LoopMessage::Command(Command::Synchronize(done)) => {
                let _ = done.send(());
            }
            LoopMessage::Command(Command::Shutdown) => break,
        }
    }
    router.scan().stop(None);
    debug!("Event loop stopped");
}

fn spawn_scan_timer(timers: WeakUnboundedSender<LoopMessage>, generation: u64, timeout: Duration) {
    let spawned = thread::Builder::new()
        .name("ble-central-scan-timer".into())
        .spawn(move || {
            thread::sleep(timeout);
            if let Some(sender) = timers.upgrade() {
                let _ = sender.send(LoopMessage::Command(Command::StopScan {
                    generation: Some(generation),
                }));
            }
        });
    if let Err(e) = spawned {
        error!("No timer for scan {}, it will not time out: {}", generation, e);
    }
}
