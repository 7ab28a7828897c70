//! Serialized asynchronous hardware command dispatch.
//!
//! All hardware-facing operations go through a [`CommandQueue`]: a
//! single-consumer tokio task that owns the [`DeviceBackend`] and services
//! commands strictly in FIFO order, so only one operation is ever in flight
//! against the device connection. Callers on any task enqueue a [`Command`]
//! and receive its completion on a oneshot channel.
//!
//! # Message Flow
//!
//! ```text
//! Caller Task                        Queue Task
//! -----------                        ----------
//! 1. Create command with oneshot
//! 2. enqueue() via mpsc        ------>
//!                                    3. Receive command (FIFO)
//!                                    4. Execute against backend
//!                                    5. Resolve oneshot with outcome
//! 6. Await oneshot receiver   <------
//! 7. Check return_code, use result
//! ```
//!
//! Each command completes exactly once, on the queue's own task. A negative
//! `return_code` signals a hardware/driver failure; the `result` payload is
//! undefined in that case and callers must check before using it. The queue
//! never retries a failed command; retry policy belongs to the caller.
//!
//! Each command variant has a helper constructor that creates the command
//! together with the receiver for its completion:
//!
//! ```rust
//! use iio_acq::command::Command;
//!
//! let (cmd, rx) = Command::attr_read("voltage0", "raw");
//! // queue.enqueue(cmd).await?;
//! // let outcome = rx.await?;
//! ```

use crate::error::{AcqError, AcqResult};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Opaque handle to a hardware ring buffer.
///
/// Created by a `BufferCreate` command, released by `BufferDestroy`. A handle
/// must never be refilled after a cancel/destroy has been issued for it; the
/// buffer lifecycle layer enforces this with its `invalid` flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    pub id: u64,
    pub device: String,
    /// Capacity in samples.
    pub capacity: usize,
}

/// Typed command result payload.
///
/// Replaces runtime downcasting of completion payloads with a tagged variant
/// matched exhaustively at the point of use.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    None,
    /// Attribute read result, as reported by the driver.
    Attr(String),
    /// Handle produced by a successful buffer creation.
    Buffer(BufferHandle),
    /// Raw sample words produced by a successful refill.
    Samples(Vec<u32>),
}

/// Completion of one hardware command.
#[derive(Clone, Debug)]
pub struct CommandOutcome {
    /// Signed driver return code. Negative means failure; for refills a
    /// positive value is the number of samples read.
    pub return_code: i32,
    pub result: CommandResult,
}

impl CommandOutcome {
    pub fn is_failure(&self) -> bool {
        self.return_code < 0
    }
}

type CompletionSender = oneshot::Sender<CommandOutcome>;
/// Receiver half of a command completion.
pub type CompletionReceiver = oneshot::Receiver<CommandOutcome>;

/// An asynchronous hardware operation, completed via oneshot exactly once.
#[derive(Debug)]
pub enum Command {
    AttrRead {
        target: String,
        attr: String,
        completion: CompletionSender,
    },
    AttrWrite {
        target: String,
        attr: String,
        value: String,
        completion: CompletionSender,
    },
    BufferCreate {
        device: String,
        /// Requested capacity in samples.
        samples: usize,
        completion: CompletionSender,
    },
    BufferRefill {
        buffer: BufferHandle,
        completion: CompletionSender,
    },
    BufferCancel {
        buffer: BufferHandle,
        completion: CompletionSender,
    },
    BufferDestroy {
        buffer: BufferHandle,
        completion: CompletionSender,
    },
}

impl Command {
    /// Helper to create an AttrRead command
    pub fn attr_read(target: impl Into<String>, attr: impl Into<String>) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::AttrRead {
                target: target.into(),
                attr: attr.into(),
                completion: tx,
            },
            rx,
        )
    }

    /// Helper to create an AttrWrite command
    pub fn attr_write(
        target: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<String>,
    ) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::AttrWrite {
                target: target.into(),
                attr: attr.into(),
                value: value.into(),
                completion: tx,
            },
            rx,
        )
    }

    /// Helper to create a BufferCreate command
    pub fn buffer_create(device: impl Into<String>, samples: usize) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::BufferCreate {
                device: device.into(),
                samples,
                completion: tx,
            },
            rx,
        )
    }

    /// Helper to create a BufferRefill command
    pub fn buffer_refill(buffer: BufferHandle) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::BufferRefill {
                buffer,
                completion: tx,
            },
            rx,
        )
    }

    /// Helper to create a BufferCancel command
    pub fn buffer_cancel(buffer: BufferHandle) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::BufferCancel {
                buffer,
                completion: tx,
            },
            rx,
        )
    }

    /// Helper to create a BufferDestroy command
    pub fn buffer_destroy(buffer: BufferHandle) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self::BufferDestroy {
                buffer,
                completion: tx,
            },
            rx,
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Command::AttrRead { .. } => "attr_read",
            Command::AttrWrite { .. } => "attr_write",
            Command::BufferCreate { .. } => "buffer_create",
            Command::BufferRefill { .. } => "buffer_refill",
            Command::BufferCancel { .. } => "buffer_cancel",
            Command::BufferDestroy { .. } => "buffer_destroy",
        }
    }
}

/// Hardware access seam executed by the queue task.
///
/// Each method maps to one command kind and returns either its typed result
/// or a negative driver error code.
#[async_trait]
pub trait DeviceBackend: Send {
    async fn attr_read(&mut self, target: &str, attr: &str) -> Result<String, i32>;

    async fn attr_write(&mut self, target: &str, attr: &str, value: &str) -> Result<(), i32>;

    /// Allocates a hardware ring buffer of `samples` capacity.
    async fn buffer_create(&mut self, device: &str, samples: usize) -> Result<BufferHandle, i32>;

    /// Blocks until the buffer has been refilled, returning the raw sample
    /// words read.
    async fn buffer_refill(&mut self, buffer: &BufferHandle) -> Result<Vec<u32>, i32>;

    /// Unblocks any pending transfer on the buffer without releasing it.
    async fn buffer_cancel(&mut self, buffer: &BufferHandle) -> Result<(), i32>;

    /// Releases the buffer. The handle must not be used afterwards.
    async fn buffer_destroy(&mut self, buffer: BufferHandle) -> Result<(), i32>;
}

/// Cloneable producer handle to the queue task.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
}

impl CommandQueue {
    /// Spawns the queue task around a device backend.
    ///
    /// The task exits once every `CommandQueue` clone has been dropped and
    /// the queued commands have drained.
    pub fn spawn(mut backend: Box<dyn DeviceBackend>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Command>(capacity);

        let task = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let kind = cmd.kind();
                trace!(command = kind, "executing hardware command");
                let (outcome, completion) = execute(&mut *backend, cmd).await;
                if outcome.is_failure() {
                    debug!(
                        command = kind,
                        code = outcome.return_code,
                        "hardware command failed"
                    );
                }
                if completion.send(outcome).is_err() {
                    // The caller gave up on this command; the work itself
                    // already happened, so this is only worth a trace.
                    trace!(command = kind, "completion receiver dropped");
                }
            }
            debug!("command queue drained, task exiting");
        });

        (Self { tx }, task)
    }

    /// Appends a command to the queue. Commands are serviced strictly in
    /// FIFO order and never reordered.
    pub async fn enqueue(&self, cmd: Command) -> AcqResult<()> {
        self.tx.send(cmd).await.map_err(|_| {
            warn!("enqueue on closed command queue");
            AcqError::QueueClosed
        })
    }
}

async fn execute(backend: &mut dyn DeviceBackend, cmd: Command) -> (CommandOutcome, CompletionSender) {
    match cmd {
        Command::AttrRead {
            target,
            attr,
            completion,
        } => {
            let outcome = match backend.attr_read(&target, &attr).await {
                Ok(value) => CommandOutcome {
                    return_code: value.len() as i32,
                    result: CommandResult::Attr(value),
                },
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
        Command::AttrWrite {
            target,
            attr,
            value,
            completion,
        } => {
            let outcome = match backend.attr_write(&target, &attr, &value).await {
                Ok(()) => success(),
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
        Command::BufferCreate {
            device,
            samples,
            completion,
        } => {
            let outcome = match backend.buffer_create(&device, samples).await {
                Ok(handle) => CommandOutcome {
                    return_code: 0,
                    result: CommandResult::Buffer(handle),
                },
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
        Command::BufferRefill { buffer, completion } => {
            let outcome = match backend.buffer_refill(&buffer).await {
                Ok(samples) => CommandOutcome {
                    return_code: samples.len() as i32,
                    result: CommandResult::Samples(samples),
                },
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
        Command::BufferCancel { buffer, completion } => {
            let outcome = match backend.buffer_cancel(&buffer).await {
                Ok(()) => success(),
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
        Command::BufferDestroy { buffer, completion } => {
            let outcome = match backend.buffer_destroy(buffer).await {
                Ok(()) => success(),
                Err(code) => failure(code),
            };
            (outcome, completion)
        }
    }
}

fn success() -> CommandOutcome {
    CommandOutcome {
        return_code: 0,
        result: CommandResult::None,
    }
}

fn failure(code: i32) -> CommandOutcome {
    CommandOutcome {
        return_code: code,
        result: CommandResult::None,
    }
}
