//! Background acquisition worker.
//!
//! The [`ReaderWorker`] runs as its own tokio task and drives the refill
//! loop: create the hardware buffer, chain refills through the command
//! queue, de-interleave each completed buffer into per-channel vectors, and
//! emit decoded blocks to the consumer. Control messages (start, stop,
//! channel-set changes) arrive on an mpsc channel and are always serviced
//! before pending refill completions.
//!
//! Two operating modes, selected at spawn time:
//!
//! - **Buffered**: continuous ring-buffer acquisition from a streaming
//!   device. `start_capture(n)` with `n == 0` runs until stopped; `n > 0`
//!   emits exactly `n` decoded blocks and then signals single-capture
//!   completion.
//! - **Polled**: one-shot direct attribute reads per registered channel,
//!   for low-rate digital-I/O style channels. No buffer lifecycle involved.
//!
//! Errors inside the worker never cross the task boundary as panics; they
//! surface as [`ReaderEvent::Fault`] followed by [`ReaderEvent::Finished`],
//! and the controller decides what to do about them.

use crate::buffer::{BufferInvalidator, BufferLifecycleManager, BufferState};
use crate::channel::ChannelDescriptor;
use crate::command::{Command, CommandOutcome, CommandQueue, CommandResult, CompletionReceiver};
use crate::config::AcquisitionSettings;
use crate::error::{AcqError, AcqResult};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Acquisition mode, fixed at spawn time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderMode {
    Buffered,
    Polled,
}

/// Progress of one capture run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureSession {
    /// Number of buffers to acquire; 0 means unbounded/continuous.
    pub required_buffers: usize,
    pub completed_buffers: usize,
    pub running: bool,
}

impl CaptureSession {
    fn start(required_buffers: usize) -> Self {
        Self {
            required_buffers,
            completed_buffers: 0,
            running: true,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Events emitted by the worker to the consumer side.
#[derive(Clone, Debug)]
pub enum ReaderEvent {
    /// A decoded sample block, keyed by channel index, with the 1-based
    /// buffer counter of this capture run.
    BufferRefilled {
        data: HashMap<usize, Vec<f64>>,
        counter: usize,
    },
    /// Polled-mode attribute read result.
    ChannelDataChanged { index: usize, value: f64 },
    /// A bounded capture acquired its last buffer.
    SingleCaptureFinished,
    /// The reader stopped and the buffer is released.
    Finished,
    /// Fatal condition for the current capture; a new `start_capture` is
    /// required to recover.
    Fault(String),
}

#[derive(Debug)]
enum ReaderCommand {
    StartCapture { required_buffers: usize },
    RequestStop,
    ForcedStop,
    ChannelsChanged(BTreeMap<usize, ChannelDescriptor>),
    SamplingFrequency(f64),
    Poll,
    Shutdown,
}

/// Handle to a spawned reader worker.
pub struct ReaderHandle {
    ctrl_tx: mpsc::Sender<ReaderCommand>,
    invalidator: BufferInvalidator,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    /// Starts a capture. `required_buffers == 0` runs continuously.
    pub async fn start_capture(&self, required_buffers: usize) -> AcqResult<()> {
        self.send(ReaderCommand::StartCapture { required_buffers })
            .await
    }

    /// Graceful stop: drains the buffer teardown before the worker reports
    /// [`ReaderEvent::Finished`]. A stop while idle is a no-op.
    pub async fn request_stop(&self) -> AcqResult<()> {
        self.send(ReaderCommand::RequestStop).await
    }

    /// Urgent stop: marks the buffer invalid *now*, so refill completions
    /// already in flight are dropped, then cancels the buffer.
    pub async fn forced_stop(&self) -> AcqResult<()> {
        self.invalidator.invalidate();
        self.send(ReaderCommand::ForcedStop).await
    }

    /// Replaces the channel table used for the next capture. Has no effect
    /// on a capture already in progress; stop and restart for that.
    pub async fn on_channels_changed(
        &self,
        channels: BTreeMap<usize, ChannelDescriptor>,
    ) -> AcqResult<()> {
        self.send(ReaderCommand::ChannelsChanged(channels)).await
    }

    pub async fn on_sampling_frequency_computed(&self, frequency: f64) -> AcqResult<()> {
        self.send(ReaderCommand::SamplingFrequency(frequency)).await
    }

    /// Triggers one round of attribute reads (polled mode).
    pub async fn poll(&self) -> AcqResult<()> {
        self.send(ReaderCommand::Poll).await
    }

    /// Stops the worker task, tearing down any active buffer first.
    pub async fn shutdown(self) {
        let _ = self.ctrl_tx.send(ReaderCommand::Shutdown).await;
        let _ = self.task.await;
    }

    async fn send(&self, cmd: ReaderCommand) -> AcqResult<()> {
        self.ctrl_tx
            .send(cmd)
            .await
            .map_err(|_| AcqError::QueueClosed)
    }
}

pub struct ReaderWorker {
    mode: ReaderMode,
    settings: AcquisitionSettings,
    buffer: BufferLifecycleManager,
    queue: CommandQueue,
    events: mpsc::Sender<ReaderEvent>,
    channels: BTreeMap<usize, ChannelDescriptor>,
    /// Snapshot of the capture channels, fixed for the duration of a run.
    capture_channels: Vec<ChannelDescriptor>,
    sampling_frequency: f64,
    session: CaptureSession,
}

impl ReaderWorker {
    /// Spawns the worker task and returns its control handle plus the event
    /// stream consumed by the plotting/controller layer.
    pub fn spawn(
        mode: ReaderMode,
        device: impl Into<String>,
        queue: CommandQueue,
        settings: AcquisitionSettings,
    ) -> (ReaderHandle, mpsc::Receiver<ReaderEvent>) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(settings.control_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(settings.event_channel_capacity);

        let buffer = BufferLifecycleManager::new(device, queue.clone());
        let invalidator = buffer.invalidator();
        let worker = ReaderWorker {
            mode,
            settings,
            buffer,
            queue,
            events: event_tx,
            channels: BTreeMap::new(),
            capture_channels: Vec::new(),
            sampling_frequency: 0.0,
            session: CaptureSession::default(),
        };
        let task = tokio::spawn(worker.run(ctrl_rx));

        (
            ReaderHandle {
                ctrl_tx,
                invalidator,
                task,
            },
            event_rx,
        )
    }

    async fn run(mut self, mut ctrl_rx: mpsc::Receiver<ReaderCommand>) {
        let mut pending: Option<CompletionReceiver> = None;
        loop {
            tokio::select! {
                biased;
                cmd = ctrl_rx.recv() => {
                    match cmd {
                        None | Some(ReaderCommand::Shutdown) => {
                            self.stop(&mut pending, StopKind::Graceful).await;
                            break;
                        }
                        Some(cmd) => self.handle_control(cmd, &mut pending).await,
                    }
                }
                outcome = next_refill(&mut pending), if pending.is_some() => {
                    pending = None;
                    self.on_refill_outcome(outcome, &mut pending).await;
                }
            }
        }
        debug!("reader worker exited");
    }

    async fn handle_control(&mut self, cmd: ReaderCommand, pending: &mut Option<CompletionReceiver>) {
        match cmd {
            ReaderCommand::StartCapture { required_buffers } => match self.mode {
                ReaderMode::Buffered => self.start_buffered(required_buffers, pending).await,
                ReaderMode::Polled => self.run_polled().await,
            },
            ReaderCommand::RequestStop => self.stop(pending, StopKind::Graceful).await,
            ReaderCommand::ForcedStop => self.stop(pending, StopKind::Forced).await,
            ReaderCommand::ChannelsChanged(channels) => {
                self.channels = channels;
            }
            ReaderCommand::SamplingFrequency(frequency) => {
                self.sampling_frequency = frequency;
            }
            ReaderCommand::Poll => {
                if self.mode == ReaderMode::Polled {
                    self.run_polled().await;
                } else {
                    warn!("poll requested on buffered reader");
                }
            }
            ReaderCommand::Shutdown => {}
        }
    }

    async fn start_buffered(
        &mut self,
        required_buffers: usize,
        pending: &mut Option<CompletionReceiver>,
    ) {
        if self.session.running {
            warn!("capture already running, start ignored");
            return;
        }

        self.capture_channels = self
            .channels
            .values()
            .filter(|ch| ch.is_buffer_capture())
            .cloned()
            .collect();
        if self.capture_channels.is_empty() {
            self.fail_start(AcqError::NoChannels).await;
            return;
        }
        info!(
            channels = self.capture_channels.len(),
            required_buffers, "starting buffered capture"
        );

        self.session = CaptureSession::start(required_buffers);
        self.apply_channel_enables().await;

        let samples = if self.sampling_frequency >= self.settings.max_buffer_samples as f64 {
            self.settings.max_buffer_samples
        } else {
            self.settings.min_buffer_samples
        };
        if let Err(e) = self.buffer.create(samples).await {
            self.session.reset();
            self.fail_start(e).await;
            return;
        }

        *pending = self.issue_refill().await;
    }

    /// Pushes the enabled/disabled state of every scan element down to the
    /// device, so the buffer layout matches the snapshot.
    async fn apply_channel_enables(&self) {
        for ch in self.channels.values() {
            if !ch.is_scan_element || ch.is_output {
                continue;
            }
            let value = if ch.enabled { "1" } else { "0" };
            let (cmd, rx) = Command::attr_write(ch.id.clone(), "en", value);
            if self.queue.enqueue(cmd).await.is_err() {
                warn!(channel = %ch.id, "channel enable dropped, queue closed");
                return;
            }
            match rx.await {
                Ok(outcome) if outcome.is_failure() => {
                    warn!(channel = %ch.id, code = outcome.return_code, "channel enable failed");
                }
                Ok(_) => debug!(channel = %ch.id, enabled = ch.enabled, "channel configured"),
                Err(_) => warn!(channel = %ch.id, "channel enable completion lost"),
            }
        }
    }

    async fn issue_refill(&mut self) -> Option<CompletionReceiver> {
        match self.buffer.issue_refill().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("failed to issue refill: {e}");
                self.session.reset();
                self.emit(ReaderEvent::Fault(e.to_string())).await;
                let _ = self.buffer.destroy().await;
                self.emit(ReaderEvent::Finished).await;
                None
            }
        }
    }

    async fn on_refill_outcome(
        &mut self,
        outcome: Result<CommandOutcome, oneshot::error::RecvError>,
        pending: &mut Option<CompletionReceiver>,
    ) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("refill completion lost, command queue gone");
                self.session.reset();
                self.emit(ReaderEvent::Fault(AcqError::QueueClosed.to_string()))
                    .await;
                self.emit(ReaderEvent::Finished).await;
                return;
            }
        };
        if !self.session.running {
            // Stop already requested; the teardown path owns the buffer now.
            debug!("refill completion after stop, dropped");
            return;
        }

        match self.buffer.complete_refill(outcome) {
            Ok(None) => {
                // Invalidated between issue and completion; the pending
                // cancel/destroy control message finishes the teardown.
            }
            Ok(Some(raw)) => {
                self.session.completed_buffers += 1;
                let data = deinterleave(&raw, &self.capture_channels);
                self.emit(ReaderEvent::BufferRefilled {
                    data,
                    counter: self.session.completed_buffers,
                })
                .await;

                let required = self.session.required_buffers;
                if required != 0 && self.session.completed_buffers >= required {
                    info!(buffers = required, "single capture complete");
                    self.session.running = false;
                    self.emit(ReaderEvent::SingleCaptureFinished).await;
                } else {
                    *pending = self.issue_refill().await;
                }
            }
            Err(e) => {
                // Stream fault: no requeue, capture is over.
                error!("refill failed: {e}");
                self.session.reset();
                self.emit(ReaderEvent::Fault(e.to_string())).await;
                if let Err(e) = self.buffer.destroy().await {
                    warn!("teardown after refill fault: {e}");
                }
                self.emit(ReaderEvent::Finished).await;
            }
        }
    }

    async fn stop(&mut self, pending: &mut Option<CompletionReceiver>, kind: StopKind) {
        let had_capture = self.session.running || self.buffer.state() != BufferState::Absent;
        self.session.reset();
        // Any in-flight refill is stale from here on; its completion is
        // dropped by the invalid flag.
        *pending = None;
        if !had_capture {
            debug!("stop requested while idle, nothing to do");
            return;
        }

        let result = match kind {
            StopKind::Graceful => self.buffer.destroy().await,
            StopKind::Forced => self.buffer.cancel().await,
        };
        if let Err(e) = result {
            warn!("buffer teardown failed: {e}");
        }
        self.emit(ReaderEvent::Finished).await;
    }

    async fn run_polled(&mut self) {
        debug!(channels = self.channels.len(), "polled read round");
        for (index, ch) in &self.channels {
            let (cmd, rx) = Command::attr_read(ch.id.clone(), "raw");
            if self.queue.enqueue(cmd).await.is_err() {
                error!("polled read dropped, queue closed");
                return;
            }
            match rx.await {
                Ok(outcome) if outcome.return_code >= 0 => {
                    let CommandResult::Attr(text) = outcome.result else {
                        warn!(channel = %ch.id, "unexpected payload for raw read");
                        continue;
                    };
                    match text.trim().parse::<f64>() {
                        Ok(value) => {
                            debug!(channel = %ch.id, value, "raw value read");
                            self.emit(ReaderEvent::ChannelDataChanged {
                                index: *index,
                                value,
                            })
                            .await;
                        }
                        Err(_) => {
                            // Treated as "no data" for this read only.
                            let err = AcqError::Parse(text);
                            warn!(channel = %ch.id, "{err}");
                        }
                    }
                }
                Ok(outcome) => {
                    error!(
                        channel = %ch.id,
                        code = outcome.return_code,
                        "failed to acquire polled data"
                    );
                }
                Err(_) => {
                    error!(channel = %ch.id, "polled read completion lost");
                    return;
                }
            }
        }
    }

    async fn fail_start(&mut self, err: AcqError) {
        error!("capture start failed: {err}");
        self.emit(ReaderEvent::Fault(err.to_string())).await;
        self.emit(ReaderEvent::Finished).await;
    }

    async fn emit(&self, event: ReaderEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

enum StopKind {
    Graceful,
    Forced,
}

async fn next_refill(
    pending: &mut Option<CompletionReceiver>,
) -> Result<CommandOutcome, oneshot::error::RecvError> {
    match pending.as_mut() {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

/// Splits a flat round-robin sample stream into one converted vector per
/// capture channel.
///
/// Sample `i` belongs to `channels[i % channels.len()]`, in the fixed order
/// established at buffer-create time. The result maps channel *index* (as
/// seen by consumers) to its samples.
pub fn deinterleave(raw: &[u32], channels: &[ChannelDescriptor]) -> HashMap<usize, Vec<f64>> {
    let count = channels.len();
    if count == 0 {
        return HashMap::new();
    }
    let per_channel = raw.len() / count + usize::from(raw.len() % count != 0);
    let mut data: HashMap<usize, Vec<f64>> = channels
        .iter()
        .map(|ch| (ch.index, Vec::with_capacity(per_channel)))
        .collect();
    for (i, word) in raw.iter().enumerate() {
        let ch = &channels[i % count];
        if let Some(samples) = data.get_mut(&ch.index) {
            samples.push(ch.convert_sample(*word));
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{encode_raw, ChannelKind};

    fn linear_channel(index: usize) -> ChannelDescriptor {
        let mut ch = ChannelDescriptor::new(
            format!("voltage{index}"),
            index,
            false,
            true,
            ChannelKind::Linear {
                offset: 0.0,
                scale: 1000.0,
            },
        );
        ch.enabled = true;
        ch
    }

    #[test]
    fn deinterleave_round_robin() {
        // Two channels, three samples each, interleaved a0 b0 a1 b1 a2 b2.
        let channels = vec![linear_channel(0), linear_channel(2)];
        let raw: Vec<u32> = [1u16, 10, 2, 20, 3, 30]
            .iter()
            .map(|v| encode_raw(*v))
            .collect();

        let data = deinterleave(&raw, &channels);
        assert_eq!(data.len(), 2);
        assert_eq!(data[&0], vec![1.0, 2.0, 3.0]);
        assert_eq!(data[&2], vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn deinterleave_empty_channel_set() {
        let data = deinterleave(&[1, 2, 3], &[]);
        assert!(data.is_empty());
    }

    #[test]
    fn deinterleave_applies_channel_conversion() {
        let mut resistance = ChannelDescriptor::new("resistance1", 1, false, true, ChannelKind::Resistance);
        resistance.enabled = true;
        let raw = vec![encode_raw(0xFFFF)];
        let data = deinterleave(&raw, &[resistance]);
        assert_eq!(data[&1], vec![crate::channel::MAX_RESISTANCE_OHMS]);
    }

    #[test]
    fn capture_session_lifecycle() {
        let mut session = CaptureSession::start(3);
        assert!(session.running);
        assert_eq!(session.required_buffers, 3);
        session.completed_buffers = 3;
        session.reset();
        assert!(!session.running);
        assert_eq!(session.completed_buffers, 0);
    }
}
