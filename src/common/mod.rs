// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

pub(crate) mod registry;
pub(crate) mod router;
pub(crate) mod scan;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the inner value if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
