//! # Buffered IIO Acquisition Core
//!
//! This crate implements the acquisition pipeline for buffered industrial-I/O
//! style devices: a serialized hardware command queue, a managed ring-buffer
//! lifecycle, a background reader that chains refills and de-interleaves the
//! sample stream, and a controller that drives capture state and reacts to
//! reconfiguration. The hardware itself sits behind the
//! [`DeviceBackend`](command::DeviceBackend) trait, so the whole stack runs
//! identically against real drivers or the in-memory mock.
//!
//! ## Crate Structure
//!
//! - **`command`**: The [`CommandQueue`](command::CommandQueue) task and the
//!   [`Command`](command::Command)/completion types. Every hardware operation
//!   flows through here, strictly FIFO.
//! - **`buffer`**: [`BufferLifecycleManager`](buffer::BufferLifecycleManager),
//!   which owns the buffer handle and the invalidation flag that closes the
//!   stop-versus-inflight-refill race.
//! - **`reader`**: The [`ReaderWorker`](reader::ReaderWorker) task; buffered
//!   refill loop, polled attribute reads, and the event stream consumers
//!   subscribe to.
//! - **`controller`**: [`AcquisitionController`](controller::AcquisitionController),
//!   the Idle/Continuous/SingleShot state machine with restart-after-settle
//!   handling.
//! - **`channel`**: [`ChannelDescriptor`](channel::ChannelDescriptor) and the
//!   raw-word fix-up plus linear/resistance sample conversion.
//! - **`config`**: TOML/environment configuration via `config`.
//! - **`error`**: The [`AcqError`](error::AcqError) taxonomy.
//! - **`mock`**: [`MockDevice`](mock::MockDevice) backend for tests and the
//!   demo binary.

pub mod buffer;
pub mod channel;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod mock;
pub mod reader;

pub use crate::buffer::{BufferLifecycleManager, BufferState};
pub use crate::channel::{ChannelDescriptor, ChannelKind};
pub use crate::command::{Command, CommandOutcome, CommandQueue, DeviceBackend};
pub use crate::config::Settings;
pub use crate::controller::{AcquisitionController, AcquisitionState};
pub use crate::error::{AcqError, AcqResult};
pub use crate::reader::{ReaderEvent, ReaderHandle, ReaderMode, ReaderWorker};
