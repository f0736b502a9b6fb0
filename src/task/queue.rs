// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::timer::TaskTimer;
use super::{CancellableTask, FailurePolicy, Priority, TaskOutcome};
use crate::common::lock;
use log::{debug, trace, warn};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct Queued {
    priority: Priority,
    seq: u64,
    task: CancellableTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Queued>,
    current: Option<CancellableTask>,
    paused: bool,
    // Set while some thread is inside the dequeue loop.
    pumping: bool,
    next_seq: u64,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    timer: TaskTimer,
}

/// Runs [`CancellableTask`]s one at a time, highest priority first and in submission order
/// among equal priorities. The next task starts as soon as the running one reaches
/// `Finished`, on whichever thread finished it.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        TaskQueue {
            inner: Arc::new(QueueInner {
                timer: TaskTimer::new(name.clone()),
                name,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a task and start it right away if nothing else is running.
    pub fn push(&self, task: CancellableTask) {
        {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(
                "{}: queued task {} ({:?})",
                self.inner.name,
                task.id(),
                task.priority()
            );
            state.pending.push(Queued {
                priority: task.priority(),
                seq,
                task,
            });
        }
        self.pump();
    }

    /// Number of tasks waiting, not counting the running one.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if no task is running and none is waiting.
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.current.is_none() && state.pending.is_empty()
    }

    pub fn current(&self) -> Option<CancellableTask> {
        self.state().current.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Stop dequeuing. The running task is not affected.
    pub fn pause(&self) {
        debug!("{}: paused", self.inner.name);
        self.state().paused = true;
    }

    pub fn resume(&self) {
        debug!("{}: resumed", self.inner.name);
        self.state().paused = false;
        self.pump();
    }

    /// Cancel the running task and finish every waiting task as cancelled.
    pub fn cancel_all(&self) {
        let (current, pending) = {
            let mut state = self.state();
            (state.current.clone(), mem::take(&mut state.pending))
        };
        if let Some(current) = current {
            current.cancel();
        }
        if !pending.is_empty() {
            debug!(
                "{}: cancelling {} queued tasks",
                self.inner.name,
                pending.len()
            );
        }
        for queued in pending.into_sorted_vec().into_iter().rev() {
            queued.task.cancel();
            if let Err(e) = queued.task.start() {
                warn!("{}: could not drain task {}: {}", self.inner.name, queued.task.id(), e);
            }
        }
    }

    // Start tasks until one is left running. Tasks that finish while being started only mark
    // the queue free; the loop below picks up the next one, so the stack stays flat.
    fn pump(&self) {
        {
            let mut state = self.state();
            if state.pumping {
                return;
            }
            state.pumping = true;
        }
        loop {
            let task = {
                let mut state = self.state();
                let next = if state.paused || state.current.is_some() {
                    None
                } else {
                    state.pending.pop()
                };
                match next {
                    Some(queued) => {
                        state.current = Some(queued.task.clone());
                        queued.task
                    }
                    None => {
                        state.pumping = false;
                        return;
                    }
                }
            };
            self.launch(task);
        }
    }

    fn launch(&self, task: CancellableTask) {
        let queue = Arc::downgrade(&self.inner);
        let id = task.id();
        let policy = task.failure_policy();
        task.on_finished(move |outcome| {
            if let Some(inner) = Weak::upgrade(&queue) {
                TaskQueue { inner }.on_task_finished(id, policy, outcome);
            }
        });

        if let Some(timeout) = task.timeout() {
            self.inner.timer.arm(&task, timeout);
        }

        trace!("{}: starting task {}", self.inner.name, id);
        if let Err(e) = task.start() {
            warn!("{}: task {} could not start: {}", self.inner.name, id, e);
        }
    }

    fn on_task_finished(&self, id: u64, policy: FailurePolicy, outcome: &TaskOutcome) {
        self.inner.timer.disarm(id);
        let aborted = {
            let mut state = self.state();
            if state.current.as_ref().map(CancellableTask::id) == Some(id) {
                state.current = None;
            }
            if outcome.is_failure() {
                match policy {
                    FailurePolicy::Nothing => false,
                    FailurePolicy::Abort => true,
                    FailurePolicy::Pause => {
                        debug!("{}: task {} failed, pausing", self.inner.name, id);
                        state.paused = true;
                        false
                    }
                }
            } else {
                false
            }
        };
        if aborted {
            debug!("{}: task {} failed, aborting queue", self.inner.name, id);
            self.cancel_all();
        }
        self.pump();
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.inner.state)
    }
}

impl Debug for TaskQueue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.state();
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("pending", &state.pending.len())
            .field("current", &state.current.as_ref().map(CancellableTask::id))
            .field("paused", &state.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnOperation, TaskBuilder};
    use crate::Error;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording(log: &Log, name: &'static str) -> CancellableTask {
        let log = log.clone();
        CancellableTask::from_fn(move |task| {
            log.lock().unwrap().push(name);
            task.finish().unwrap();
        })
    }

    fn held(log: &Log, name: &'static str) -> TaskBuilder {
        let log = log.clone();
        CancellableTask::builder(FnOperation(Some(move |_: &CancellableTask| {
            log.lock().unwrap().push(name)
        })))
    }

    #[test]
    fn runs_tasks_in_order() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        queue.push(recording(&log, "a"));
        queue.push(recording(&log, "b"));
        queue.push(recording(&log, "c"));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn one_task_at_a_time_then_priority() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let first = held(&log, "first").build();
        queue.push(first.clone());
        queue.push(recording(&log, "normal"));
        queue.push(held(&log, "high").priority(Priority::High).build());
        let low_log = log.clone();
        queue.push(
            CancellableTask::builder(FnOperation(Some(move |task: &CancellableTask| {
                low_log.lock().unwrap().push("low");
                task.finish().unwrap();
            })))
            .priority(Priority::Low)
            .build(),
        );

        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.current(), Some(first.clone()));

        first.finish().unwrap();
        // "high" runs next and holds the queue.
        assert_eq!(*log.lock().unwrap(), vec!["first", "high"]);
        queue.current().unwrap().finish().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "high", "normal", "low"]);
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let blocker = held(&log, "blocker").build();
        queue.push(blocker.clone());
        let skipped = recording(&log, "skipped");
        queue.push(skipped.clone());
        queue.push(recording(&log, "after"));

        skipped.cancel();
        blocker.finish().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["blocker", "after"]);
        assert_eq!(skipped.outcome(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn timeout_force_finishes_and_advances() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let stuck = held(&log, "stuck")
            .timeout(Duration::from_millis(30))
            .build();
        queue.push(stuck.clone());
        queue.push(recording(&log, "next"));

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(
            stuck.outcome(),
            Some(TaskOutcome::TimedOut(Duration::from_millis(30)))
        );
        assert_eq!(*log.lock().unwrap(), vec!["stuck", "next"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn finishing_task_is_not_timed_out() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let task = held(&log, "slow")
            .timeout(Duration::from_millis(20))
            .build();
        queue.push(task.clone());
        task.finishing().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(!task.is_finished());
        task.finish().unwrap();
        assert_eq!(task.outcome(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn abort_policy_cancels_rest() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let failing = held(&log, "failing")
            .failure_policy(FailurePolicy::Abort)
            .build();
        queue.push(failing.clone());
        let rest = recording(&log, "rest");
        queue.push(rest.clone());

        failing.fail(Error::NotConnected).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["failing"]);
        assert_eq!(rest.outcome(), Some(TaskOutcome::Cancelled));
        assert!(queue.is_idle());
    }

    #[test]
    fn pause_policy_waits_for_resume() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let failing = held(&log, "failing")
            .failure_policy(FailurePolicy::Pause)
            .build();
        queue.push(failing.clone());
        queue.push(recording(&log, "later"));

        failing.fail(Error::NotConnected).unwrap();
        assert!(queue.is_paused());
        assert_eq!(queue.len(), 1);

        queue.resume();
        assert_eq!(*log.lock().unwrap(), vec!["failing", "later"]);
    }

    #[test]
    fn cancel_all_completes_everything_once() {
        let log = Log::default();
        let queue = TaskQueue::new("test");
        let running = held(&log, "running").build();
        queue.push(running.clone());
        let waiting: Vec<_> = (0..3).map(|_| recording(&log, "never")).collect();
        for task in &waiting {
            queue.push(task.clone());
        }

        queue.cancel_all();
        assert!(running.is_cancelled());
        assert!(running.is_executing());
        for task in &waiting {
            assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
        }

        running.finish_with(TaskOutcome::Cancelled).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["running"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn long_backlog_of_instant_tasks_drains_on_small_stack() {
        let queue = TaskQueue::new("test");
        let log = Log::default();
        let blocker = held(&log, "blocker").build();
        queue.push(blocker.clone());
        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..10_000 {
            let done = done.clone();
            queue.push(CancellableTask::from_fn(move |task| {
                done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                task.finish().unwrap();
            }));
        }
        assert_eq!(queue.len(), 10_000);

        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || blocker.finish().unwrap())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 10_000);
        assert!(queue.is_idle());
    }

    #[test]
    fn timeouts_share_one_timer_and_disarm_on_finish() {
        let queue = TaskQueue::new("test");
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                CancellableTask::builder(FnOperation(Some(|task: &CancellableTask| {
                    task.finish().unwrap();
                })))
                .timeout(Duration::from_secs(30))
                .build()
            })
            .collect();
        for task in &tasks {
            queue.push(task.clone());
        }
        assert!(tasks
            .iter()
            .all(|task| task.outcome() == Some(TaskOutcome::Completed)));
        assert!(queue.inner.timer.is_running());
        assert!(!queue.inner.timer.is_armed());
        assert!(queue.is_idle());
    }
}
