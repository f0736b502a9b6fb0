// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! ble-central is a thin coordination layer on top of a Bluetooth Low Energy central radio.
//!
//! The radio itself (CoreBluetooth, BlueZ, WinRT, a test double, ...) is consumed through the
//! [`api::Radio`] trait. On top of it this crate provides:
//!
//! - scan sessions that deduplicate discovered peripherals and report them both as they show up
//!   and as a final snapshot when the scan stops,
//! - a registry mapping peripheral identifiers to [`Device`] handles so that asynchronous radio
//!   callbacks end up at the right device,
//! - a [`task::CancellableTask`] primitive and a serial [`task::TaskQueue`] used to keep GATT
//!   operations on a single link strictly one at a time.
//!
//! # Usage
//!
//! ```no_run
//! use ble_central::{api::Radio, Adapter, Device};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn run(radio: Arc<dyn Radio>) -> ble_central::Result<()> {
//!     let adapter = Adapter::new(radio)?;
//!     adapter.scan_for(
//!         Duration::from_secs(5),
//!         Some(Box::new(|device: &Device| println!("saw {:?}", device))),
//!         Box::new(|devices: Vec<Device>| println!("found {} devices", devices.len())),
//!     )
//! }
//! ```

pub mod adapter;
pub mod api;
mod common;
pub mod config;
pub mod device;
pub mod task;

#[cfg(test)]
mod test_utils;

pub use adapter::Adapter;
pub use config::AdapterConfig;
pub use device::{Device, DeviceEvent};

use api::{AdapterState, DeviceId, RadioError};
use static_assertions::assert_impl_all;
use std::result;
use std::time::Duration;

/// The main error type returned by most methods in ble-central.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Error {
    #[error("Bluetooth adapter is not available: {0:?}")]
    AdapterUnavailable(AdapterState),

    #[error("Timed out after {:?}", _0)]
    TimedOut(Duration),

    #[error("No device registered for {0}")]
    UnknownDevice(DeviceId),

    #[error("Task already finished")]
    AlreadyFinished,

    #[error("Task already started")]
    TaskAlreadyStarted,

    #[error("Task has not been started")]
    TaskNotStarted,

    #[error("Not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Adapter event loop is no longer running")]
    EventLoopClosed,

    #[error("{}", _0)]
    Other(String),
}

/// Convenience type for a result using the ble-central [`Error`] type.
pub type Result<T> = result::Result<T, Error>;

// Handles are shared between the caller and the adapter event loop.
assert_impl_all!(Adapter: Clone, Send, Sync, std::fmt::Debug);
assert_impl_all!(Device: Clone, Send, Sync, std::fmt::Debug, std::hash::Hash, Eq);
assert_impl_all!(task::CancellableTask: Clone, Send, Sync);
assert_impl_all!(task::TaskQueue: Clone, Send, Sync);
assert_impl_all!(DeviceId: Clone, std::fmt::Display, std::hash::Hash, Ord, Send, Sync);
