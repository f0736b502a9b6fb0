// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::DeviceId;
use crate::device::{Device, WeakDevice};
use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};

// Size of `known` below which dead entries are left alone.
const PRUNE_FLOOR: usize = 64;

/// Identifier to device lookups for the event router.
///
/// Two tables are kept. `devices` is the routing table: devices the caller asked to connect to,
/// and the only ones connection and GATT events are delivered to. `known` remembers every device
/// object handed out so far, so a peripheral seen again in a later scan (or looked up by id) maps
/// to the same `Device` as long as anyone still holds it. Entries whose device was dropped are
/// pruned whenever `known` has doubled since the last sweep, and at the start of every scan.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
    known: DashMap<DeviceId, WeakDevice>,
    prune_at: AtomicUsize,
}

impl DeviceRegistry {
    /// The live device for `id`, creating it with `make` if there is none.
    pub fn obtain(&self, id: &DeviceId, make: impl FnOnce() -> Device) -> Device {
        if let Some(device) = self.devices.get(id) {
            return device.value().clone();
        }
        // The entry guard holds a shard lock; sweep only after it is released.
        let device = self.obtain_known(id, make);
        if self.known.len() >= self.prune_at.load(Ordering::Relaxed).max(PRUNE_FLOOR) {
            self.prune();
        }
        device
    }

    fn obtain_known(&self, id: &DeviceId, make: impl FnOnce() -> Device) -> Device {
        match self.known.entry(id.clone()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(device) => device,
                None => {
                    let device = make();
                    entry.insert(device.downgrade());
                    device
                }
            },
            Entry::Vacant(entry) => {
                let device = make();
                entry.insert(device.downgrade());
                device
            }
        }
    }

    /// Add `device` to the routing table. The first registration for an identifier wins;
    /// returns false if one was already present.
    pub fn register(&self, device: &Device) -> bool {
        match self.devices.entry(device.id().clone()) {
            Entry::Occupied(_) => {
                trace!("{} already registered", device.id());
                false
            }
            Entry::Vacant(entry) => {
                trace!("Registering {}", device.id());
                self.known
                    .insert(device.id().clone(), device.downgrade());
                entry.insert(device.clone());
                true
            }
        }
    }

    /// Drop identity entries whose device no longer exists.
    pub fn prune(&self) {
        let before = self.known.len();
        self.known.retain(|_, device| device.is_alive());
        let after = self.known.len();
        self.prune_at.store(after * 2, Ordering::Relaxed);
        if before != after {
            debug!("Pruned {} dropped devices, {} remain", before - after, after);
        }
    }

    pub fn resolve(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id).map(|(_, device)| device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }

    #[cfg(test)]
    pub fn known_len(&self) -> usize {
        self.known.len()
    }
}
