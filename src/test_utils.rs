// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{Attribute, DeviceId, EventSink, Radio, RadioEvent, WriteType};
use std::sync::Mutex;
use uuid::Uuid;

/// A radio command as recorded by [`MockRadio`].
#[derive(Debug, Clone, PartialEq)]
pub enum RadioCommand {
    StartScan(bool),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    DiscoverDescriptors(DeviceId, Uuid),
    ReadValue(DeviceId, Attribute),
    WriteValue(DeviceId, Attribute, Vec<u8>, WriteType),
    SetNotify(DeviceId, Uuid, bool),
    ReadRssi(DeviceId),
}

/// Radio that records every command and lets the test push events.
#[derive(Default)]
pub struct MockRadio {
    commands: Mutex<Vec<RadioCommand>>,
    sink: Mutex<Option<EventSink>>,
}

impl MockRadio {
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn emit(&self, event: RadioEvent) {
        let sink = self.sink.lock().unwrap().clone();
        assert!(sink.expect("radio not attached").emit(event));
    }

    fn record(&self, command: RadioCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

impl Radio for MockRadio {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn start_scan(&self, allow_duplicates: bool) {
        self.record(RadioCommand::StartScan(allow_duplicates));
    }

    fn stop_scan(&self) {
        self.record(RadioCommand::StopScan);
    }

    fn connect(&self, id: &DeviceId) {
        self.record(RadioCommand::Connect(id.clone()));
    }

    fn disconnect(&self, id: &DeviceId) {
        self.record(RadioCommand::Disconnect(id.clone()));
    }

    fn discover_services(&self, id: &DeviceId) {
        self.record(RadioCommand::DiscoverServices(id.clone()));
    }

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid) {
        self.record(RadioCommand::DiscoverCharacteristics(id.clone(), service));
    }

    fn discover_descriptors(&self, id: &DeviceId, characteristic: Uuid) {
        self.record(RadioCommand::DiscoverDescriptors(id.clone(), characteristic));
    }

    fn read_value(&self, id: &DeviceId, attribute: Attribute) {
        self.record(RadioCommand::ReadValue(id.clone(), attribute));
    }

    fn write_value(&self, id: &DeviceId, attribute: Attribute, value: &[u8], write_type: WriteType) {
        self.record(RadioCommand::WriteValue(
            id.clone(),
            attribute,
            value.to_vec(),
            write_type,
        ));
    }

    fn set_notify(&self, id: &DeviceId, characteristic: Uuid, enabled: bool) {
        self.record(RadioCommand::SetNotify(id.clone(), characteristic, enabled));
    }

    fn read_rssi(&self, id: &DeviceId) {
        self.record(RadioCommand::ReadRssi(id.clone()));
    }
}
