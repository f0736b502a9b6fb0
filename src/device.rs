// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Per-peripheral state and the notification entry points the event router calls into.

use crate::api::{
    AdvertisementData, Attribute, Characteristic, DeviceId, Radio, RadioError, WriteType,
};
use crate::common::lock;
use crate::config::AdapterConfig;
use crate::task::{CancellableTask, Operation, TaskOutcome, TaskQueue};
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::result::Result as StdResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Something that happened to a [`Device`], as published on [`Device::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    ConnectFailed(RadioError),
    Disconnected(Option<RadioError>),
    NameUpdated(Option<String>),
    ServicesModified(Vec<Uuid>),
    RssiUpdated(StdResult<i16, RadioError>),
    ServicesDiscovered(StdResult<Vec<Uuid>, RadioError>),
    IncludedServicesDiscovered {
        service: Uuid,
        included: StdResult<Vec<Uuid>, RadioError>,
    },
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: StdResult<Vec<Characteristic>, RadioError>,
    },
    DescriptorsDiscovered {
        characteristic: Uuid,
        descriptors: StdResult<Vec<Uuid>, RadioError>,
    },
    ValueUpdated {
        attribute: Attribute,
        value: StdResult<Vec<u8>, RadioError>,
    },
    ValueWritten {
        attribute: Attribute,
        result: StdResult<(), RadioError>,
    },
    NotifyStateChanged {
        characteristic: Uuid,
        enabled: StdResult<bool, RadioError>,
    },
}

/// What is currently known about a peripheral. Updated from advertisements and GATT events.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceProperties {
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: AdvertisementData,
    pub services: BTreeSet<Uuid>,
    pub characteristics: BTreeSet<Characteristic>,
    pub descriptors: BTreeMap<Uuid, BTreeSet<Uuid>>,
    pub notifying: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
enum GattCommand {
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    DiscoverDescriptors(Uuid),
    Read(Attribute),
    Write(Attribute, Vec<u8>, WriteType),
    SetNotify(Uuid, bool),
    ReadRssi,
}

#[derive(Debug)]
enum Response {
    Services(Vec<Uuid>),
    Characteristics(Vec<Characteristic>),
    Descriptors(Vec<Uuid>),
    Value(Vec<u8>),
    Done,
    Rssi(i16),
}

type Reply = Box<dyn FnOnce(Result<Response>) + Send>;

// Shared between the queued operation and its completion callback. Whoever ends the task
// leaves the response here; the completion hands it to the caller.
#[derive(Default)]
struct Exchange {
    reply: Option<Reply>,
    response: Option<Response>,
}

type ExchangeSlot = Arc<Mutex<Exchange>>;

struct Pending {
    command: GattCommand,
    task: CancellableTask,
    exchange: ExchangeSlot,
}

struct GattOperation {
    device: WeakDevice,
    command: GattCommand,
    exchange: ExchangeSlot,
}

impl Operation for GattOperation {
    fn execute(&mut self, task: &CancellableTask) {
        match self.device.upgrade() {
            Some(device) => device.issue(task, self.command.clone(), self.exchange.clone()),
            None => {
                let _ = task.finish_with(TaskOutcome::Cancelled);
            }
        }
    }
}

struct Shared {
    id: DeviceId,
    radio: Arc<dyn Radio>,
    properties: Mutex<DeviceProperties>,
    connected: AtomicBool,
    queue: TaskQueue,
    pending: Mutex<Option<Pending>>,
    operation_timeout: Option<Duration>,
    events: broadcast::Sender<DeviceEvent>,
}

/// A remote peripheral. Cheap to clone; clones share state. Two `Device`s compare equal when
/// they have the same identifier, and an [`Adapter`](crate::Adapter) never hands out two
/// distinct objects for one identifier at the same time.
///
/// GATT operations issued through a `Device` are serialized on its own [`TaskQueue`]: the next
/// one is sent to the radio only after the previous one completed, failed, timed out or was
/// cancelled.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub(crate) struct WeakDevice(Weak<Shared>);

impl WeakDevice {
    pub(crate) fn upgrade(&self) -> Option<Device> {
        self.0.upgrade().map(|shared| Device { shared })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Debug for WeakDevice {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.upgrade() {
            Some(device) => write!(f, "WeakDevice({})", device.id()),
            None => f.write_str("WeakDevice(<dropped>)"),
        }
    }
}

impl Device {
    pub(crate) fn new(id: DeviceId, radio: Arc<dyn Radio>, config: &AdapterConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let queue = TaskQueue::new(format!("ble-central-{}", id));
        Device {
            shared: Arc::new(Shared {
                id,
                radio,
                properties: Mutex::new(DeviceProperties::default()),
                connected: AtomicBool::new(false),
                queue,
                pending: Mutex::new(None),
                operation_timeout: config.operation_timeout,
                events,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakDevice {
        WeakDevice(Arc::downgrade(&self.shared))
    }

    pub fn id(&self) -> &DeviceId {
        &self.shared.id
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.shared.properties).name.clone()
    }

    pub fn rssi(&self) -> Option<i16> {
        lock(&self.shared.properties).rssi
    }

    pub fn properties(&self) -> DeviceProperties {
        lock(&self.shared.properties).clone()
    }

    pub fn services(&self) -> BTreeSet<Uuid> {
        lock(&self.shared.properties).services.clone()
    }

    pub fn characteristics(&self) -> BTreeSet<Characteristic> {
        lock(&self.shared.properties).characteristics.clone()
    }

    /// Connection status as derived from the connect/disconnect events seen so far.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The serial queue GATT operations for this device run on. Custom tasks pushed here are
    /// serialized with the built-in operations.
    pub fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }

    /// A receiver for every [`DeviceEvent`] published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Stream of [`DeviceEvent`]s. Events are dropped for a subscriber that falls behind by more
    /// than the configured event capacity.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = DeviceEvent> + Send>> {
        let receiver = self.shared.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }

    pub fn discover_services(
        &self,
        reply: impl FnOnce(Result<Vec<Uuid>>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(GattCommand::DiscoverServices, move |response| {
            reply(response.and_then(|r| match r {
                Response::Services(services) => Ok(services),
                other => Err(unexpected(other)),
            }))
        })
    }

    pub fn discover_characteristics(
        &self,
        service: Uuid,
        reply: impl FnOnce(Result<Vec<Characteristic>>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(GattCommand::DiscoverCharacteristics(service), move |response| {
            reply(response.and_then(|r| match r {
                Response::Characteristics(characteristics) => Ok(characteristics),
                other => Err(unexpected(other)),
            }))
        })
    }

    pub fn discover_descriptors(
        &self,
        characteristic: Uuid,
        reply: impl FnOnce(Result<Vec<Uuid>>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(
            GattCommand::DiscoverDescriptors(characteristic),
            move |response| {
                reply(response.and_then(|r| match r {
                    Response::Descriptors(descriptors) => Ok(descriptors),
                    other => Err(unexpected(other)),
                }))
            },
        )
    }

    pub fn read(
        &self,
        attribute: Attribute,
        reply: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(GattCommand::Read(attribute), move |response| {
            reply(response.and_then(|r| match r {
                Response::Value(value) => Ok(value),
                other => Err(unexpected(other)),
            }))
        })
    }

    /// Write `value`. A write without response completes as soon as it was handed to the radio.
    pub fn write(
        &self,
        attribute: Attribute,
        value: &[u8],
        write_type: WriteType,
        reply: impl FnOnce(Result<()>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(
            GattCommand::Write(attribute, value.to_vec(), write_type),
            move |response| reply(response.map(|_| ())),
        )
    }

    pub fn set_notify(
        &self,
        characteristic: Uuid,
        enabled: bool,
        reply: impl FnOnce(Result<()>) + Send + 'static,
    ) -> CancellableTask {
        self.enqueue(
            GattCommand::SetNotify(characteristic, enabled),
            move |response| reply(response.map(|_| ())),
        )
    }

    pub fn read_rssi(&self, reply: impl FnOnce(Result<i16>) + Send + 'static) -> CancellableTask {
        self.enqueue(GattCommand::ReadRssi, move |response| {
            reply(response.and_then(|r| match r {
                Response::Rssi(rssi) => Ok(rssi),
                other => Err(unexpected(other)),
            }))
        })
    }

    fn enqueue(
        &self,
        command: GattCommand,
        reply: impl FnOnce(Result<Response>) + Send + 'static,
    ) -> CancellableTask {
        let exchange: ExchangeSlot = Arc::new(Mutex::new(Exchange {
            reply: Some(Box::new(reply)),
            response: None,
        }));
        let weak = self.downgrade();
        let mut builder = CancellableTask::builder(GattOperation {
            device: weak.clone(),
            command,
            exchange: exchange.clone(),
        });
        if let Some(timeout) = self.shared.operation_timeout {
            builder = builder.timeout(timeout);
        }
        let slot = exchange.clone();
        let task = builder
            .completion(move |outcome| {
                if let Some(device) = weak.upgrade() {
                    device.release_finished();
                }
                let (reply, response) = {
                    let mut exchange = lock(&slot);
                    (exchange.reply.take(), exchange.response.take())
                };
                if let Some(reply) = reply {
                    reply(match outcome {
                        TaskOutcome::Completed => response.ok_or_else(|| {
                            Error::Other("operation finished without a response".into())
                        }),
                        TaskOutcome::Cancelled => Err(Error::Cancelled),
                        TaskOutcome::Failed(e) => Err(e.clone()),
                        TaskOutcome::TimedOut(after) => Err(Error::TimedOut(*after)),
                    });
                }
            })
            .build();
        self.shared.queue.push(task.clone());
        task
    }

    // Runs on the queue, exactly one command at a time. The connection check and the
    // registration happen under the `pending` lock, which a disconnect also takes before it
    // aborts, so a command is either refused here or failed by the disconnect.
    fn issue(&self, task: &CancellableTask, command: GattCommand, exchange: ExchangeSlot) {
        let id = &self.shared.id;
        let radio = &self.shared.radio;
        let without_response = matches!(
            command,
            GattCommand::Write(_, _, WriteType::WithoutResponse)
        );
        let refused = {
            let mut pending = lock(&self.shared.pending);
            if !self.is_connected() {
                Some(Error::NotConnected)
            } else if task.is_cancelled() {
                Some(Error::Cancelled)
            } else {
                if !without_response {
                    if let Some(stale) = pending.take() {
                        warn!("{}: replacing unfinished {:?}", id, stale.command);
                    }
                    *pending = Some(Pending {
                        command: command.clone(),
                        task: task.clone(),
                        exchange: exchange.clone(),
                    });
                }
                None
            }
        };
        match refused {
            Some(Error::Cancelled) => {
                debug!("{}: {:?} cancelled before it was sent", id, command);
                let _ = task.finish_with(TaskOutcome::Cancelled);
                return;
            }
            Some(error) => {
                debug!("{}: not connected, failing {:?}", id, command);
                let _ = task.fail(error);
                return;
            }
            None => {}
        }

        if let GattCommand::Write(attribute, value, WriteType::WithoutResponse) = &command {
            // No write confirmation will ever arrive for a command.
            radio.write_value(id, *attribute, value, WriteType::WithoutResponse);
            lock(&exchange).response = Some(Response::Done);
            let _ = task.finish();
            return;
        }

        trace!("{}: issuing {:?}", id, command);
        match command {
            GattCommand::DiscoverServices => radio.discover_services(id),
            GattCommand::DiscoverCharacteristics(service) => {
                radio.discover_characteristics(id, service)
            }
            GattCommand::DiscoverDescriptors(characteristic) => {
                radio.discover_descriptors(id, characteristic)
            }
            GattCommand::Read(attribute) => radio.read_value(id, attribute),
            GattCommand::Write(attribute, value, write_type) => {
                radio.write_value(id, attribute, &value, write_type)
            }
            GattCommand::SetNotify(characteristic, enabled) => {
                radio.set_notify(id, characteristic, enabled)
            }
            GattCommand::ReadRssi => radio.read_rssi(id),
        }
    }

    // Hand a radio result to the in-flight operation, if it is the one waiting for it.
    fn complete(
        &self,
        matches: impl Fn(&GattCommand) -> bool,
        result: StdResult<Response, RadioError>,
    ) {
        let pending = {
            let mut guard = lock(&self.shared.pending);
            let matched = guard.as_ref().map_or(false, |p| matches(&p.command));
            if matched {
                guard.take()
            } else {
                None
            }
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return,
        };
        if pending.task.is_cancelled() {
            debug!("{}: dropping result of cancelled {:?}", self.id(), pending.command);
            let _ = pending.task.finish_with(TaskOutcome::Cancelled);
            return;
        }
        let _ = pending.task.finishing();
        match result {
            Ok(response) => {
                lock(&pending.exchange).response = Some(response);
                let _ = pending.task.finish();
            }
            Err(e) => {
                let _ = pending.task.fail(Error::Radio(e));
            }
        }
    }

    // Called from a task completion: forget the in-flight op once its task is over.
    fn release_finished(&self) {
        let mut pending = lock(&self.shared.pending);
        if pending.as_ref().map_or(false, |p| p.task.is_finished()) {
            pending.take();
        }
    }

    // Taken under the `pending` lock so `issue` never registers against a stale status.
    fn set_connected(&self, connected: bool) {
        let _pending = lock(&self.shared.pending);
        self.shared.connected.store(connected, Ordering::SeqCst);
    }

    fn abort_operations(&self, error: Error) {
        self.shared.queue.cancel_all();
        let pending = lock(&self.shared.pending).take();
        if let Some(pending) = pending {
            debug!("{}: aborting {:?}: {}", self.id(), pending.command, error);
            let _ = pending.task.fail(error);
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Err(lost) = self.shared.events.send(event) {
            trace!("{}: lost device event, nothing subscribed: {:?}", self.id(), lost.0);
        }
    }

    fn update(&self, f: impl FnOnce(&mut DeviceProperties)) {
        f(&mut lock(&self.shared.properties));
    }

    pub(crate) fn did_discover(
        &self,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        self.update(|properties| {
            if name.is_some() {
                properties.name = name;
            }
            properties.rssi = Some(rssi);
            properties.advertisement = advertisement;
        });
    }

    pub(crate) fn did_connect(&self) {
        info!("{}: connected", self.id());
        self.set_connected(true);
        self.emit(DeviceEvent::Connected);
    }

    pub(crate) fn did_fail_to_connect(&self, error: RadioError) {
        warn!("{}: failed to connect: {}", self.id(), error);
        self.set_connected(false);
        self.abort_operations(Error::NotConnected);
        self.emit(DeviceEvent::ConnectFailed(error));
    }

    pub(crate) fn did_disconnect(&self, error: Option<RadioError>) {
        match error {
            Some(ref e) => info!("{}: disconnected: {}", self.id(), e),
            None => info!("{}: disconnected", self.id()),
        }
        self.set_connected(false);
        self.abort_operations(Error::NotConnected);
        self.emit(DeviceEvent::Disconnected(error));
    }

    pub(crate) fn did_update_name(&self, name: Option<String>) {
        self.update(|properties| properties.name = name.clone());
        self.emit(DeviceEvent::NameUpdated(name));
    }

    pub(crate) fn did_modify_services(&self, invalidated: Vec<Uuid>) {
        self.update(|properties| {
            for service in &invalidated {
                properties.services.remove(service);
            }
            properties
                .characteristics
                .retain(|c| !invalidated.contains(&c.service_uuid));
        });
        self.emit(DeviceEvent::ServicesModified(invalidated));
    }

    pub(crate) fn did_update_rssi(&self, rssi: i16, error: Option<RadioError>) {
        let result = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| properties.rssi = Some(rssi));
                Ok(rssi)
            }
        };
        self.emit(DeviceEvent::RssiUpdated(result.clone()));
        self.complete(
            |command| *command == GattCommand::ReadRssi,
            result.map(Response::Rssi),
        );
    }

    pub(crate) fn did_discover_services(&self, services: Vec<Uuid>, error: Option<RadioError>) {
        let result = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| properties.services.extend(services.iter().copied()));
                Ok(services)
            }
        };
        self.emit(DeviceEvent::ServicesDiscovered(result.clone()));
        self.complete(
            |command| *command == GattCommand::DiscoverServices,
            result.map(Response::Services),
        );
    }

    pub(crate) fn did_discover_included_services(
        &self,
        service: Uuid,
        included: Vec<Uuid>,
        error: Option<RadioError>,
    ) {
        let included = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| properties.services.extend(included.iter().copied()));
                Ok(included)
            }
        };
        self.emit(DeviceEvent::IncludedServicesDiscovered { service, included });
    }

    pub(crate) fn did_discover_characteristics(
        &self,
        service: Uuid,
        characteristics: Vec<Characteristic>,
        error: Option<RadioError>,
    ) {
        let result = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| {
                    properties
                        .characteristics
                        .retain(|c| c.service_uuid != service);
                    properties
                        .characteristics
                        .extend(characteristics.iter().cloned());
                });
                Ok(characteristics)
            }
        };
        self.emit(DeviceEvent::CharacteristicsDiscovered {
            service,
            characteristics: result.clone(),
        });
        self.complete(
            |command| *command == GattCommand::DiscoverCharacteristics(service),
            result.map(Response::Characteristics),
        );
    }

    pub(crate) fn did_discover_descriptors(
        &self,
        characteristic: Uuid,
        descriptors: Vec<Uuid>,
        error: Option<RadioError>,
    ) {
        let result = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| {
                    properties
                        .descriptors
                        .insert(characteristic, descriptors.iter().copied().collect());
                });
                Ok(descriptors)
            }
        };
        self.emit(DeviceEvent::DescriptorsDiscovered {
            characteristic,
            descriptors: result.clone(),
        });
        self.complete(
            |command| *command == GattCommand::DiscoverDescriptors(characteristic),
            result.map(Response::Descriptors),
        );
    }

    /// Either the answer to a read, or a notification/indication.
    pub(crate) fn did_update_value(
        &self,
        attribute: Attribute,
        value: Vec<u8>,
        error: Option<RadioError>,
    ) {
        let result = match error {
            Some(e) => Err(e),
            None => Ok(value),
        };
        self.emit(DeviceEvent::ValueUpdated {
            attribute,
            value: result.clone(),
        });
        self.complete(
            |command| *command == GattCommand::Read(attribute),
            result.map(Response::Value),
        );
    }

    pub(crate) fn did_write_value(&self, attribute: Attribute, error: Option<RadioError>) {
        let result = match error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.emit(DeviceEvent::ValueWritten {
            attribute,
            result: result.clone(),
        });
        self.complete(
            |command| matches!(command, GattCommand::Write(a, _, _) if *a == attribute),
            result.map(|_| Response::Done),
        );
    }

    pub(crate) fn did_update_notification_state(
        &self,
        characteristic: Uuid,
        enabled: bool,
        error: Option<RadioError>,
    ) {
        let result = match error {
            Some(e) => Err(e),
            None => {
                self.update(|properties| {
                    if enabled {
                        properties.notifying.insert(characteristic);
                    } else {
                        properties.notifying.remove(&characteristic);
                    }
                });
                Ok(enabled)
            }
        };
        self.emit(DeviceEvent::NotifyStateChanged {
            characteristic,
            enabled: result.clone(),
        });
        self.complete(
            |command| matches!(command, GattCommand::SetNotify(c, _) if *c == characteristic),
            result.map(|_| Response::Done),
        );
    }
}

fn unexpected(response: Response) -> Error {
    Error::Other(format!("unexpected response {:?}", response))
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}
