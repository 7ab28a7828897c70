//! Hardware buffer lifecycle management.
//!
//! [`BufferLifecycleManager`] owns the buffer handle and sequences
//! create → refill(loop) → cancel/destroy, guaranteeing at most one buffer
//! exists at a time. The handle and an `invalid` flag are the only state
//! shared between the worker task and the controller thread; both live
//! behind one mutex.
//!
//! The `invalid` flag is set *synchronously*, at the moment a cancel or
//! destroy is requested, never inside a completion callback. Any refill
//! completion that arrives after that point is dropped without touching the
//! buffer, which closes the race between "stop requested" and "in-flight
//! refill still writes into a buffer that is about to be freed".

use crate::command::{Command, CommandOutcome, CommandQueue, CommandResult, CompletionReceiver};
use crate::error::{AcqError, AcqResult};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Lifecycle states of the hardware buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferState {
    #[default]
    Absent,
    Creating,
    Active,
    Invalidating,
    Destroying,
}

#[derive(Debug, Default)]
struct Shared {
    state: BufferState,
    handle: Option<crate::command::BufferHandle>,
    invalid: bool,
}

/// Cloneable entry point for invalidating the buffer from another thread.
///
/// Held by the reader handle so that a forced stop can mark the buffer
/// invalid before the stop request is even queued to the worker.
#[derive(Clone)]
pub struct BufferInvalidator {
    shared: Arc<Mutex<Shared>>,
}

impl BufferInvalidator {
    /// Marks the buffer invalid. In-flight refill completions become no-ops
    /// from this point on.
    pub fn invalidate(&self) {
        let mut shared = lock(&self.shared);
        shared.invalid = true;
        if shared.state == BufferState::Active {
            shared.state = BufferState::Invalidating;
        }
    }
}

pub struct BufferLifecycleManager {
    device: String,
    queue: CommandQueue,
    shared: Arc<Mutex<Shared>>,
}

impl BufferLifecycleManager {
    pub fn new(device: impl Into<String>, queue: CommandQueue) -> Self {
        Self {
            device: device.into(),
            queue,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn invalidator(&self) -> BufferInvalidator {
        BufferInvalidator {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> BufferState {
        lock(&self.shared).state
    }

    /// Allocates the hardware buffer. Valid only while no buffer exists.
    pub async fn create(&self, samples: usize) -> AcqResult<()> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != BufferState::Absent {
                return Err(AcqError::InvalidState {
                    operation: "buffer_create",
                    state: format!("{:?}", shared.state),
                });
            }
            shared.state = BufferState::Creating;
            shared.invalid = false;
        }

        let (cmd, rx) = Command::buffer_create(self.device.clone(), samples);
        if let Err(e) = self.queue.enqueue(cmd).await {
            lock(&self.shared).state = BufferState::Absent;
            return Err(e);
        }
        let outcome = match await_completion(rx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                lock(&self.shared).state = BufferState::Absent;
                return Err(e);
            }
        };

        let mut shared = lock(&self.shared);
        if outcome.is_failure() {
            shared.state = BufferState::Absent;
            return Err(AcqError::Hardware {
                op: "buffer_create",
                code: outcome.return_code,
            });
        }
        match outcome.result {
            CommandResult::Buffer(handle) => {
                debug!(device = %self.device, capacity = handle.capacity, "buffer created");
                shared.handle = Some(handle);
                // A stop may have been requested while the create was in
                // flight; keep the invalid mark so the pending stop tears
                // the new buffer down instead of leaking it.
                shared.state = if shared.invalid {
                    BufferState::Invalidating
                } else {
                    BufferState::Active
                };
                Ok(())
            }
            _ => {
                shared.state = BufferState::Absent;
                Err(AcqError::Hardware {
                    op: "buffer_create",
                    code: outcome.return_code,
                })
            }
        }
    }

    /// Issues a refill for the active buffer, returning the completion
    /// receiver so the caller can await it alongside its control channel.
    pub async fn issue_refill(&self) -> AcqResult<CompletionReceiver> {
        let handle = {
            let shared = lock(&self.shared);
            if shared.state != BufferState::Active {
                return Err(AcqError::InvalidState {
                    operation: "buffer_refill",
                    state: format!("{:?}", shared.state),
                });
            }
            match &shared.handle {
                Some(handle) => handle.clone(),
                None => {
                    return Err(AcqError::InvalidState {
                        operation: "buffer_refill",
                        state: "Active without handle".to_string(),
                    })
                }
            }
        };
        let (cmd, rx) = Command::buffer_refill(handle);
        self.queue.enqueue(cmd).await?;
        Ok(rx)
    }

    /// Resolves a refill completion.
    ///
    /// Returns `Ok(None)` when the buffer was invalidated between issue and
    /// completion; the stale data must not be decoded or emitted.
    pub fn complete_refill(&self, outcome: CommandOutcome) -> AcqResult<Option<Vec<u32>>> {
        let shared = lock(&self.shared);
        if shared.invalid {
            debug!("dropping refill completion for invalidated buffer");
            return Ok(None);
        }
        if outcome.return_code <= 0 {
            return Err(AcqError::Hardware {
                op: "buffer_refill",
                code: outcome.return_code,
            });
        }
        match outcome.result {
            CommandResult::Samples(samples) => Ok(Some(samples)),
            _ => Err(AcqError::Hardware {
                op: "buffer_refill",
                code: outcome.return_code,
            }),
        }
    }

    /// Forced teardown: invalidates immediately, cancels any pending
    /// transfer, then destroys the buffer.
    ///
    /// Proceeds to destroy whether or not the cancel itself succeeds.
    /// A cancel with no buffer present is an idempotent no-op.
    pub async fn cancel(&self) -> AcqResult<()> {
        let handle = {
            let mut shared = lock(&self.shared);
            shared.invalid = true;
            match shared.handle.clone() {
                Some(handle) => {
                    shared.state = BufferState::Invalidating;
                    handle
                }
                None => return Ok(()),
            }
        };

        let (cmd, rx) = Command::buffer_cancel(handle);
        // The destroy runs whatever the cancel's fate, so the handle is
        // always released.
        match self.queue.enqueue(cmd).await {
            Ok(()) => match await_completion(rx).await {
                Ok(outcome) if outcome.is_failure() => {
                    warn!(code = outcome.return_code, "buffer cancel failed");
                }
                Ok(_) => {}
                Err(e) => warn!("buffer cancel completion lost: {e}"),
            },
            Err(e) => warn!("buffer cancel not dispatched: {e}"),
        }
        self.destroy().await
    }

    /// Graceful teardown: invalidates, then destroys the buffer and clears
    /// the handle. A destroy with no buffer present is an idempotent no-op.
    pub async fn destroy(&self) -> AcqResult<()> {
        let handle = {
            let mut shared = lock(&self.shared);
            shared.invalid = true;
            match shared.handle.take() {
                Some(handle) => {
                    shared.state = BufferState::Destroying;
                    handle
                }
                None => {
                    shared.state = BufferState::Absent;
                    return Ok(());
                }
            }
        };

        let (cmd, rx) = Command::buffer_destroy(handle);
        let enqueue = self.queue.enqueue(cmd).await;
        if let Err(e) = enqueue {
            // Queue gone means the connection (and its buffers) are gone too.
            lock(&self.shared).state = BufferState::Absent;
            return Err(e);
        }
        let outcome = await_completion(rx).await;
        lock(&self.shared).state = BufferState::Absent;
        match outcome {
            Ok(outcome) if outcome.is_failure() => {
                warn!(code = outcome.return_code, "buffer destroy failed");
                Err(AcqError::Hardware {
                    op: "buffer_destroy",
                    code: outcome.return_code,
                })
            }
            Ok(_) => {
                debug!(device = %self.device, "buffer destroyed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn await_completion(rx: CompletionReceiver) -> AcqResult<CommandOutcome> {
    rx.await.map_err(|_| AcqError::QueueClosed)
}

fn lock<'a>(shared: &'a Arc<Mutex<Shared>>) -> MutexGuard<'a, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn manager() -> (BufferLifecycleManager, Arc<crate::mock::MockCounters>) {
        let device = MockDevice::new();
        let counters = device.counters();
        let (queue, _task) = CommandQueue::spawn(Box::new(device), 8);
        (BufferLifecycleManager::new("ad74413r", queue), counters)
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let (mgr, _) = manager();
        mgr.create(8).await.expect("first create");
        let err = mgr.create(8).await.expect_err("second create must fail");
        assert!(matches!(err, AcqError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn stale_refill_completion_is_dropped() {
        let (mgr, _) = manager();
        mgr.create(8).await.expect("create");
        let rx = mgr.issue_refill().await.expect("issue refill");
        // Stop requested between issue and completion.
        mgr.invalidator().invalidate();
        let outcome = rx.await.expect("completion");
        assert!(outcome.return_code > 0, "mock refill should succeed");
        let decoded = mgr.complete_refill(outcome).expect("complete");
        assert!(decoded.is_none(), "invalidated refill must be dropped");
    }

    #[tokio::test]
    async fn destroy_without_buffer_is_idempotent() {
        let (mgr, counters) = manager();
        mgr.destroy().await.expect("destroy while absent");
        mgr.destroy().await.expect("destroy again");
        assert_eq!(counters.destroyed(), 0);
        assert_eq!(mgr.state(), BufferState::Absent);
    }

    #[tokio::test]
    async fn cancel_destroys_and_leaves_absent() {
        let (mgr, counters) = manager();
        mgr.create(8).await.expect("create");
        mgr.cancel().await.expect("cancel");
        assert_eq!(mgr.state(), BufferState::Absent);
        assert_eq!(counters.created(), 1);
        assert_eq!(counters.cancelled(), 1);
        assert_eq!(counters.destroyed(), 1);
    }
}
