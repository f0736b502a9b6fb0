// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Cancellable units of asynchronous work.
//!
//! A [`CancellableTask`] wraps an [`Operation`] and walks it through an explicit state machine:
//!
//! ```text
//! Ready ──start()──▶ Executing ──finishing()──▶ Finishing
//!   │                    │                          │
//!   │ (cancelled)        └──────finish()────────────┴──▶ Finished
//!   └──start()──────────────────────────────────────────▶ Finished
//! ```
//!
//! Every transition is published on a [`tokio::sync::watch`] channel so a scheduler (see
//! [`TaskQueue`]) can react to a task becoming ready, executing or finished without polling.

mod queue;
mod timer;

pub use queue::TaskQueue;

use crate::common::lock;
use crate::{Error, Result};
use log::{debug, trace, warn};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`CancellableTask`]. States only ever move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskState {
    Ready,
    Executing,
    /// The result is in, the task is wrapping up but has not told anyone yet.
    Finishing,
    Finished,
}

/// Scheduling priority inside a [`TaskQueue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

/// What the queue does after a task ends with [`TaskOutcome::Failed`] or
/// [`TaskOutcome::TimedOut`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum FailurePolicy {
    /// Carry on with the next task.
    #[default]
    Nothing,
    /// Cancel everything still waiting in the queue.
    Abort,
    /// Stop dequeuing until [`TaskQueue::resume`] is called.
    Pause,
}

/// How a task ended. Handed to the completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(Error),
    TimedOut(Duration),
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_) | TaskOutcome::TimedOut(_))
    }

    /// Collapse the outcome into a `Result`, mapping cancellation and timeouts to errors.
    pub fn into_result(self) -> Result<()> {
        match self {
            TaskOutcome::Completed => Ok(()),
            TaskOutcome::Cancelled => Err(Error::Cancelled),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::TimedOut(after) => Err(Error::TimedOut(after)),
        }
    }
}

/// The work a [`CancellableTask`] performs.
///
/// `execute` is called at most once, on the thread that started the task. Implementations must
/// eventually call [`CancellableTask::finish`] (or [`CancellableTask::fail`]) on every path,
/// either before returning or later from whichever thread observes the result. A task that never
/// finishes blocks its queue until the queue's timeout for it expires.
pub trait Operation: Send + 'static {
    fn execute(&mut self, task: &CancellableTask);
}

struct FnOperation<F>(Option<F>);

impl<F> Operation for FnOperation<F>
where
    F: FnOnce(&CancellableTask) + Send + 'static,
{
    fn execute(&mut self, task: &CancellableTask) {
        if let Some(f) = self.0.take() {
            f(task);
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

struct Body {
    state: TaskState,
    operation: Option<Box<dyn Operation>>,
    completion: Option<CompletionCallback>,
    // Scheduler hooks, run after the user completion.
    finish_hooks: Vec<CompletionCallback>,
    outcome: Option<TaskOutcome>,
}

struct Inner {
    id: u64,
    priority: Priority,
    timeout: Option<Duration>,
    failure_policy: FailurePolicy,
    cancelled: AtomicBool,
    body: Mutex<Body>,
    state_tx: watch::Sender<TaskState>,
}

/// A unit of asynchronous work with an explicit, observable lifecycle. Cheap to clone; all
/// clones refer to the same task.
#[derive(Clone)]
pub struct CancellableTask {
    inner: Arc<Inner>,
}

/// Configures a [`CancellableTask`] before it is shared.
pub struct TaskBuilder {
    operation: Box<dyn Operation>,
    priority: Priority,
    timeout: Option<Duration>,
    failure_policy: FailurePolicy,
    completion: Option<CompletionCallback>,
}

impl TaskBuilder {
    pub fn new(operation: impl Operation) -> Self {
        TaskBuilder {
            operation: Box::new(operation),
            priority: Priority::default(),
            timeout: None,
            failure_policy: FailurePolicy::default(),
            completion: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Deadline for reaching `Finishing`, enforced by the [`TaskQueue`] running the task.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Called exactly once, after the task reached `Finished`.
    pub fn completion(mut self, completion: impl FnOnce(&TaskOutcome) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn build(self) -> CancellableTask {
        let (state_tx, _) = watch::channel(TaskState::Ready);
        CancellableTask {
            inner: Arc::new(Inner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                priority: self.priority,
                timeout: self.timeout,
                failure_policy: self.failure_policy,
                cancelled: AtomicBool::new(false),
                body: Mutex::new(Body {
                    state: TaskState::Ready,
                    operation: Some(self.operation),
                    completion: self.completion,
                    finish_hooks: Vec::new(),
                    outcome: None,
                }),
                state_tx,
            }),
        }
    }
}

impl CancellableTask {
    /// A task with default priority, no timeout and no completion callback.
    pub fn new(operation: impl Operation) -> Self {
        TaskBuilder::new(operation).build()
    }

    /// Shorthand for a task whose work is a closure.
    pub fn from_fn(f: impl FnOnce(&CancellableTask) + Send + 'static) -> Self {
        Self::new(FnOperation(Some(f)))
    }

    pub fn builder(operation: impl Operation) -> TaskBuilder {
        TaskBuilder::new(operation)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.inner.failure_policy
    }

    pub fn state(&self) -> TaskState {
        self.body().state
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The outcome, once the task is finished.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.body().outcome.clone()
    }

    /// Receiver for every state transition of this task.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the task is finished.
    pub async fn finished(&self) -> TaskOutcome {
        let mut receiver = self.subscribe();
        let _ = receiver
            .wait_for(|state| *state == TaskState::Finished)
            .await;
        self.outcome().unwrap_or(TaskOutcome::Cancelled)
    }

    /// Mark the task as cancelled. A task that has not started yet will finish without running
    /// its operation as soon as it is started. For an executing task this is advisory: the
    /// operation has to check [`is_cancelled`](Self::is_cancelled) itself.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Task {} cancelled in state {:?}", self.id(), self.state());
        }
    }

    /// Run the task. Only valid from `Ready`.
    pub fn start(&self) -> Result<()> {
        let mut operation = {
            let mut body = self.body();
            if body.state != TaskState::Ready {
                warn!("Task {} started twice", self.id());
                return Err(Error::TaskAlreadyStarted);
            }
            if self.is_cancelled() {
                drop(body);
                trace!("Task {} cancelled before start, skipping", self.id());
                return self.settle(TaskOutcome::Cancelled, |state| state == TaskState::Ready);
            }
            self.transition(&mut body, TaskState::Executing);
            body.operation.take()
        };
        if let Some(operation) = operation.as_mut() {
            operation.execute(self);
        }
        Ok(())
    }

    /// Signal that the result is in and the task is about to finish. Only valid from
    /// `Executing`; a task in `Finishing` is no longer subject to its timeout.
    pub fn finishing(&self) -> Result<()> {
        let mut body = self.body();
        match body.state {
            TaskState::Executing => {
                self.transition(&mut body, TaskState::Finishing);
                Ok(())
            }
            TaskState::Ready => Err(Error::TaskNotStarted),
            TaskState::Finishing | TaskState::Finished => Err(Error::AlreadyFinished),
        }
    }

    /// Complete the task successfully.
    pub fn finish(&self) -> Result<()> {
        self.finish_with(TaskOutcome::Completed)
    }

    /// Complete the task with an error.
    pub fn fail(&self, error: Error) -> Result<()> {
        self.finish_with(TaskOutcome::Failed(error))
    }

    /// Move to `Finished` from `Executing` or `Finishing` and fire the completion callback. A
    /// second call returns [`Error::AlreadyFinished`] and has no other effect.
    pub fn finish_with(&self, outcome: TaskOutcome) -> Result<()> {
        let result = self.settle(outcome, |state| {
            matches!(state, TaskState::Executing | TaskState::Finishing)
        });
        if let Err(ref e) = result {
            warn!("Task {}: finish rejected: {}", self.id(), e);
        }
        result
    }

    /// Force-finish a task still executing after its deadline. Returns true if it expired.
    pub(crate) fn expire(&self, after: Duration) -> bool {
        let expired = self
            .settle(TaskOutcome::TimedOut(after), |state| {
                state == TaskState::Executing
            })
            .is_ok();
        if expired {
            warn!("Task {} timed out after {:?}", self.id(), after);
        }
        expired
    }

    /// Run `hook` once the task finished, right away if it already has.
    pub(crate) fn on_finished(&self, hook: impl FnOnce(&TaskOutcome) + Send + 'static) {
        let outcome = {
            let mut body = self.body();
            if body.state != TaskState::Finished {
                body.finish_hooks.push(Box::new(hook));
                return;
            }
            body.outcome.clone()
        };
        if let Some(outcome) = outcome {
            hook(&outcome);
        }
    }

    fn settle(&self, outcome: TaskOutcome, allowed: impl Fn(TaskState) -> bool) -> Result<()> {
        let (completion, hooks) = {
            let mut body = self.body();
            match body.state {
                TaskState::Finished => return Err(Error::AlreadyFinished),
                state if !allowed(state) => {
                    return Err(if state == TaskState::Ready {
                        Error::TaskNotStarted
                    } else {
                        Error::AlreadyFinished
                    })
                }
                _ => {}
            }
            body.outcome = Some(outcome.clone());
            body.operation = None;
            self.transition(&mut body, TaskState::Finished);
            (body.completion.take(), mem::take(&mut body.finish_hooks))
        };
        trace!("Task {} finished: {:?}", self.id(), outcome);
        if let Some(completion) = completion {
            completion(&outcome);
        }
        for hook in hooks {
            hook(&outcome);
        }
        Ok(())
    }

    fn transition(&self, body: &mut Body, next: TaskState) {
        trace!("Task {}: {:?} -> {:?}", self.id(), body.state, next);
        body.state = next;
        self.inner.state_tx.send_replace(next);
    }

    fn body(&self) -> MutexGuard<'_, Body> {
        lock(&self.inner.body)
    }
}

impl Debug for CancellableTask {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for CancellableTask {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancellableTask {}
