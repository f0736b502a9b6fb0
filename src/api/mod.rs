// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `api` module contains the data types shared between the adapter facade and the radio it
//! drives, and the [`Radio`] trait a platform backend implements to plug into it.

use bitflags::bitflags;
use log::trace;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use tokio::sync::mpsc::{error::SendError, UnboundedSender};
use uuid::Uuid;

use crate::adapter::LoopMessage;

/// Power/authorization state of the local adapter, as reported by the radio.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Only a powered on adapter can scan or connect.
    pub fn is_available(&self) -> bool {
        matches!(self, AdapterState::PoweredOn)
    }

    /// True for states the radio will not leave on its own.
    pub fn is_unusable(&self) -> bool {
        matches!(
            self,
            AdapterState::Unsupported | AdapterState::Unauthorized | AdapterState::PoweredOff
        )
    }
}

/// Opaque identifier of a remote peripheral, stable for the lifetime of a discovery/connection
/// session. Platforms hand out UUIDs (CoreBluetooth) or addresses (BlueZ); both are kept as
/// their string form.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId(id.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        DeviceId(id)
    }
}

impl From<Uuid> for DeviceId {
    fn from(id: Uuid) -> Self {
        // CoreBluetooth reports identifiers as upper case UUID strings.
        DeviceId(id.as_hyphenated().to_string().to_uppercase())
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a Characteristic.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// A Bluetooth characteristic, as reported by characteristic discovery.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Characteristic {
    /// The UUID for this characteristic. This uniquely identifies its behavior.
    pub uuid: Uuid,
    /// The UUID of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// The set of properties for this characteristic, which indicate what functionality it
    /// supports.
    pub properties: CharPropFlags,
}

/// Address of something that can be read or written: a characteristic value or a descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    Characteristic(Uuid),
    Descriptor(Uuid),
}

impl Attribute {
    pub fn uuid(&self) -> Uuid {
        match self {
            Attribute::Characteristic(uuid) | Attribute::Descriptor(uuid) => *uuid,
        }
    }
}

/// The type of write operation to use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a confirmation or error.
    #[default]
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// Everything an advertisement report carried besides the peripheral identifier.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub services: Vec<Uuid>,
    pub tx_power_level: Option<i16>,
    pub connectable: Option<bool>,
}

/// An error reported by the radio for an operation it already accepted. Carried as event data,
/// never thrown across the async boundary.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RadioError {
    pub message: String,
}

impl RadioError {
    pub fn new(message: impl Into<String>) -> Self {
        RadioError {
            message: message.into(),
        }
    }
}

/// Asynchronous notifications a [`Radio`] delivers through its [`EventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    StateChanged(AdapterState),
    Discovered {
        id: DeviceId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    Connected(DeviceId),
    ConnectFailed(DeviceId, RadioError),
    Disconnected(DeviceId, Option<RadioError>),
    NameUpdated(DeviceId, Option<String>),
    ServicesModified {
        id: DeviceId,
        invalidated: Vec<Uuid>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<Uuid>,
        error: Option<RadioError>,
    },
    IncludedServicesDiscovered {
        id: DeviceId,
        service: Uuid,
        included: Vec<Uuid>,
        error: Option<RadioError>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<Characteristic>,
        error: Option<RadioError>,
    },
    DescriptorsDiscovered {
        id: DeviceId,
        characteristic: Uuid,
        descriptors: Vec<Uuid>,
        error: Option<RadioError>,
    },
    ValueUpdated {
        id: DeviceId,
        attribute: Attribute,
        value: Vec<u8>,
        error: Option<RadioError>,
    },
    ValueWritten {
        id: DeviceId,
        attribute: Attribute,
        error: Option<RadioError>,
    },
    NotifyStateChanged {
        id: DeviceId,
        characteristic: Uuid,
        enabled: bool,
        error: Option<RadioError>,
    },
    RssiUpdated {
        id: DeviceId,
        rssi: i16,
        error: Option<RadioError>,
    },
}

impl RadioEvent {
    /// The peripheral this event is about, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            RadioEvent::StateChanged(_) => None,
            RadioEvent::Discovered { id, .. }
            | RadioEvent::Connected(id)
            | RadioEvent::ConnectFailed(id, _)
            | RadioEvent::Disconnected(id, _)
            | RadioEvent::NameUpdated(id, _)
            | RadioEvent::ServicesModified { id, .. }
            | RadioEvent::ServicesDiscovered { id, .. }
            | RadioEvent::IncludedServicesDiscovered { id, .. }
            | RadioEvent::CharacteristicsDiscovered { id, .. }
            | RadioEvent::DescriptorsDiscovered { id, .. }
            | RadioEvent::ValueUpdated { id, .. }
            | RadioEvent::ValueWritten { id, .. }
            | RadioEvent::NotifyStateChanged { id, .. }
            | RadioEvent::RssiUpdated { id, .. } => Some(id),
        }
    }
}

/// Handle a radio uses to push [`RadioEvent`]s into the adapter's event loop. Cheap to clone,
/// usable from any thread.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: UnboundedSender<LoopMessage>,
}

impl EventSink {
    pub(crate) fn new(sender: UnboundedSender<LoopMessage>) -> Self {
        EventSink { sender }
    }

    /// Queue an event for the adapter. Returns false once the adapter has shut down.
    pub fn emit(&self, event: RadioEvent) -> bool {
        match self.sender.send(LoopMessage::Radio(event)) {
            Ok(()) => true,
            Err(SendError(LoopMessage::Radio(event))) => {
                trace!("Lost radio event, adapter is gone: {:?}", event);
                false
            }
            Err(_) => false,
        }
    }
}

/// The local BLE central radio. Every command returns immediately; its result shows up later as
/// a [`RadioEvent`] on the sink handed to [`Radio::attach`].
///
/// Implementations must be callable from any thread: the adapter issues scan/connect commands
/// from its event loop, while GATT commands are issued from whichever thread advances the
/// owning device's operation queue.
pub trait Radio: Send + Sync {
    /// Called exactly once by [`crate::Adapter::new`], before any other method.
    fn attach(&self, sink: EventSink);

    fn start_scan(&self, allow_duplicates: bool);

    fn stop_scan(&self);

    fn connect(&self, id: &DeviceId);

    fn disconnect(&self, id: &DeviceId);

    fn discover_services(&self, id: &DeviceId);

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid);

    fn discover_descriptors(&self, id: &DeviceId, characteristic: Uuid);

    fn read_value(&self, id: &DeviceId, attribute: Attribute);

    fn write_value(&self, id: &DeviceId, attribute: Attribute, value: &[u8], write_type: WriteType);

    fn set_notify(&self, id: &DeviceId, characteristic: Uuid, enabled: bool);

    fn read_rssi(&self, id: &DeviceId);
}
