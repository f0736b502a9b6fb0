// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::CancellableTask;
use crate::common::lock;
use log::{error, trace};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

struct Armed {
    task: CancellableTask,
    timeout: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct TimerState {
    armed: Option<Armed>,
    running: bool,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Deadline for the task a [`TaskQueue`](super::TaskQueue) is running. A queue only ever runs
/// one task, so one thread per queue is enough; it is started the first time a timeout is armed
/// and parks on a condvar whenever nothing is armed.
pub(super) struct TaskTimer {
    name: String,
    shared: Arc<TimerShared>,
}

impl TaskTimer {
    pub fn new(name: String) -> Self {
        TaskTimer {
            name,
            shared: Arc::default(),
        }
    }

    /// Expire `task` after `timeout` unless [`disarm`](Self::disarm) is called first.
    pub fn arm(&self, task: &CancellableTask, timeout: Duration) {
        let spawn = {
            let mut state = lock(&self.shared.state);
            state.armed = Some(Armed {
                task: task.clone(),
                timeout,
                deadline: Instant::now() + timeout,
            });
            !std::mem::replace(&mut state.running, true)
        };
        self.shared.wake.notify_one();
        if spawn {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-timeout", self.name))
                .spawn(move || run_timer(shared));
            if let Err(e) = spawned {
                error!("{}: no timer thread, timeouts disabled: {}", self.name, e);
                lock(&self.shared.state).running = false;
            }
        }
    }

    /// Forget the deadline of task `id`, if it is the armed one.
    pub fn disarm(&self, id: u64) {
        let mut state = lock(&self.shared.state);
        if state.armed.as_ref().map(|a| a.task.id()) == Some(id) {
            state.armed = None;
            drop(state);
            self.shared.wake.notify_one();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        lock(&self.shared.state).armed.is_some()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }
}

impl Drop for TaskTimer {
    fn drop(&mut self) {
        lock(&self.shared.state).shutdown = true;
        self.shared.wake.notify_one();
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            trace!("Timer thread exiting");
            return;
        }
        let deadline = match state.armed.as_ref() {
            Some(armed) => armed.deadline,
            None => {
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
        };
        let now = Instant::now();
        if now < deadline {
            state = shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }
        if let Some(armed) = state.armed.take() {
            drop(state);
            // Expiring finishes the task, which may start and arm the next one.
            armed.task.expire(armed.timeout);
            state = lock(&shared.state);
        }
    }
}
