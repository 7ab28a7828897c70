//! Capture state machine driven by the UI/logic layer.
//!
//! [`AcquisitionController`] sits between the user-facing controls and the
//! [`ReaderWorker`](crate::reader::ReaderWorker): it enforces the
//! `Idle -> Running(Continuous | SingleShot) -> Idle` state machine, owns
//! the channel table, recomputes the effective sampling frequency of the
//! multiplexed converter, and reacts to reconfiguration while running by
//! force-stopping and scheduling a restart after a settle delay.

use crate::channel::ChannelDescriptor;
use crate::config::AcquisitionSettings;
use crate::error::{AcqError, AcqResult};
use crate::reader::{ReaderEvent, ReaderHandle};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Continuous,
    SingleShot,
}

pub struct AcquisitionController {
    reader: ReaderHandle,
    events: mpsc::Receiver<ReaderEvent>,
    channels: BTreeMap<usize, ChannelDescriptor>,
    /// Per-channel sampling frequencies, used for the effective rate of the
    /// multiplexed converter.
    frequencies: BTreeMap<usize, f64>,
    state: AcquisitionState,
    /// Required buffer count of the last single-shot request, kept for
    /// restarts.
    single_required: usize,
    /// Mode to restart in once the reader reports Finished, set when a
    /// reconfiguration interrupts a running capture.
    restart_after_finish: Option<AcquisitionState>,
    settle_delay: Duration,
    connection_alive: bool,
}

impl AcquisitionController {
    pub fn new(
        reader: ReaderHandle,
        events: mpsc::Receiver<ReaderEvent>,
        settings: &AcquisitionSettings,
    ) -> Self {
        Self {
            reader,
            events,
            channels: BTreeMap::new(),
            frequencies: BTreeMap::new(),
            state: AcquisitionState::Idle,
            single_required: 0,
            restart_after_finish: None,
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            connection_alive: true,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn channels(&self) -> &BTreeMap<usize, ChannelDescriptor> {
        &self.channels
    }

    /// Installs the channel table produced by device enumeration.
    pub async fn set_channels(
        &mut self,
        channels: BTreeMap<usize, ChannelDescriptor>,
    ) -> AcqResult<()> {
        self.channels = channels;
        self.sync_reader_config().await
    }

    /// Effective sampling frequency of the multiplexed converter: the
    /// channels share one ADC, so periods add up across the enabled set.
    /// Falls back to 1.0 when nothing is enabled.
    pub fn effective_sampling_frequency(&self) -> f64 {
        let mut period = 0.0;
        for (index, frequency) in &self.frequencies {
            let enabled = self
                .channels
                .get(index)
                .is_some_and(|ch| ch.enabled && *frequency > 0.0);
            if enabled {
                period += 1.0 / frequency;
            }
        }
        if period != 0.0 {
            1.0 / period
        } else {
            1.0
        }
    }

    /// Starts unbounded capture. Valid only from `Idle`.
    pub async fn start_continuous(&mut self) -> AcqResult<()> {
        self.ensure_idle("start_continuous")?;
        self.begin(0).await?;
        self.state = AcquisitionState::Continuous;
        Ok(())
    }

    /// Starts a capture bounded to `required_buffers` buffers. Valid only
    /// from `Idle`.
    pub async fn start_single_shot(&mut self, required_buffers: usize) -> AcqResult<()> {
        self.ensure_idle("start_single_shot")?;
        if required_buffers == 0 {
            return Err(AcqError::InvalidState {
                operation: "start_single_shot",
                state: "required_buffers must be non-zero".to_string(),
            });
        }
        self.single_required = required_buffers;
        self.begin(required_buffers).await?;
        self.state = AcquisitionState::SingleShot;
        Ok(())
    }

    /// Stops the running capture gracefully. A stop while idle is a no-op.
    pub async fn stop(&mut self) -> AcqResult<()> {
        match self.state {
            AcquisitionState::Idle => Ok(()),
            AcquisitionState::Continuous | AcquisitionState::SingleShot => {
                self.restart_after_finish = None;
                self.reader.request_stop().await
            }
        }
    }

    /// Toggles a channel. While running, the active buffer layout no longer
    /// matches, so the reader is force-stopped and the capture restarted in
    /// the same mode after the settle delay.
    pub async fn set_channel_enabled(&mut self, index: usize, enabled: bool) -> AcqResult<()> {
        let ch = self
            .channels
            .get_mut(&index)
            .ok_or(AcqError::UnknownChannel(index))?;
        if ch.enabled == enabled {
            return Ok(());
        }
        ch.enabled = enabled;
        info!(channel = index, enabled, "channel enablement changed");
        self.sync_reader_config().await?;
        self.interrupt_for_reconfigure().await
    }

    /// Updates one channel's sampling frequency and recomputes the
    /// effective rate. Same force-stop/restart pattern as channel changes.
    pub async fn set_sampling_frequency(&mut self, index: usize, frequency: f64) -> AcqResult<()> {
        if !self.channels.contains_key(&index) {
            return Err(AcqError::UnknownChannel(index));
        }
        self.frequencies.insert(index, frequency);
        self.sync_reader_config().await?;
        self.interrupt_for_reconfigure().await
    }

    /// Must be called when the device connection is torn down: the reader
    /// is force-stopped rather than left spinning on a dangling handle, and
    /// no restart is attempted.
    pub async fn on_connection_destroyed(&mut self) {
        warn!("device connection destroyed");
        self.connection_alive = false;
        self.restart_after_finish = None;
        if self.state != AcquisitionState::Idle {
            let _ = self.reader.forced_stop().await;
        }
    }

    /// Receives the next reader event, applies its state transitions, and
    /// hands it to the caller (the plotting/consumer layer).
    ///
    /// Returns `None` once the worker is gone and its event stream drained.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        let event = self.events.recv().await?;
        self.apply(&event).await;
        Some(event)
    }

    async fn apply(&mut self, event: &ReaderEvent) {
        match event {
            ReaderEvent::BufferRefilled { counter, .. } => {
                debug!(counter, "buffer block received");
            }
            ReaderEvent::ChannelDataChanged { index, value } => {
                debug!(channel = index, value, "polled value received");
            }
            ReaderEvent::SingleCaptureFinished => {
                // The bounded run acquired its last buffer; release the
                // hardware buffer and fall back to Idle via Finished.
                let _ = self.reader.request_stop().await;
            }
            ReaderEvent::Finished => {
                let previous = self.state;
                self.state = AcquisitionState::Idle;
                if let Some(mode) = self.restart_after_finish.take() {
                    if self.connection_alive {
                        self.restart(mode, previous).await;
                    }
                }
            }
            ReaderEvent::Fault(message) => {
                warn!("reader fault: {message}");
            }
        }
    }

    async fn restart(&mut self, mode: AcquisitionState, previous: AcquisitionState) {
        debug!(?previous, ?mode, "restarting capture after reconfiguration");
        tokio::time::sleep(self.settle_delay).await;
        let result = match mode {
            AcquisitionState::Continuous => self.start_continuous().await,
            AcquisitionState::SingleShot => self.start_single_shot(self.single_required).await,
            AcquisitionState::Idle => Ok(()),
        };
        if let Err(e) = result {
            warn!("capture restart failed: {e}");
        }
    }

    async fn begin(&mut self, required_buffers: usize) -> AcqResult<()> {
        self.sync_reader_config().await?;
        self.reader.start_capture(required_buffers).await
    }

    async fn sync_reader_config(&mut self) -> AcqResult<()> {
        self.reader.on_channels_changed(self.channels.clone()).await?;
        self.reader
            .on_sampling_frequency_computed(self.effective_sampling_frequency())
            .await
    }

    async fn interrupt_for_reconfigure(&mut self) -> AcqResult<()> {
        match self.state {
            AcquisitionState::Idle => Ok(()),
            mode @ (AcquisitionState::Continuous | AcquisitionState::SingleShot) => {
                // The in-flight buffer is invalid for the new configuration;
                // a graceful drain would hand out mislabeled samples.
                self.restart_after_finish = Some(mode);
                self.reader.forced_stop().await
            }
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> AcqResult<()> {
        if self.state == AcquisitionState::Idle {
            Ok(())
        } else {
            Err(AcqError::InvalidState {
                operation,
                state: format!("{:?}", self.state),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::command::CommandQueue;
    use crate::config::AcquisitionSettings;
    use crate::mock::MockDevice;
    use crate::reader::{ReaderMode, ReaderWorker};

    fn controller_with_channels(frequencies: &[(usize, f64)]) -> AcquisitionController {
        let (queue, _task) = CommandQueue::spawn(Box::new(MockDevice::new()), 8);
        let settings = AcquisitionSettings::default();
        let (reader, events) =
            ReaderWorker::spawn(ReaderMode::Buffered, "ad74413r", queue, settings.clone());
        let mut controller = AcquisitionController::new(reader, events, &settings);
        for (index, frequency) in frequencies {
            let mut ch = ChannelDescriptor::new(
                format!("voltage{index}"),
                *index,
                false,
                true,
                ChannelKind::Linear {
                    offset: 0.0,
                    scale: 1.0,
                },
            );
            ch.enabled = true;
            controller.channels.insert(*index, ch);
            controller.frequencies.insert(*index, *frequency);
        }
        controller
    }

    #[tokio::test]
    async fn effective_frequency_combines_periods() {
        let controller = controller_with_channels(&[(0, 4800.0), (1, 4800.0)]);
        // Two 4800 Hz channels sharing the ADC -> 2400 Hz effective.
        assert!((controller.effective_sampling_frequency() - 2400.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn effective_frequency_defaults_to_one() {
        let controller = controller_with_channels(&[]);
        assert_eq!(controller.effective_sampling_frequency(), 1.0);
    }

    #[tokio::test]
    async fn effective_frequency_skips_disabled_channels() {
        let mut controller = controller_with_channels(&[(0, 4800.0), (1, 1200.0)]);
        controller
            .channels
            .get_mut(&1)
            .map(|ch| ch.enabled = false);
        assert!((controller.effective_sampling_frequency() - 4800.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn start_requires_idle() {
        let mut controller = controller_with_channels(&[(0, 4800.0)]);
        controller.start_continuous().await.expect("start");
        let err = controller.start_continuous().await.expect_err("double start");
        assert!(matches!(err, AcqError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn single_shot_rejects_zero_buffers() {
        let mut controller = controller_with_channels(&[(0, 4800.0)]);
        let err = controller.start_single_shot(0).await.expect_err("zero buffers");
        assert!(matches!(err, AcqError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let mut controller = controller_with_channels(&[(0, 4800.0)]);
        let err = controller
            .set_channel_enabled(7, true)
            .await
            .expect_err("unknown channel");
        assert!(matches!(err, AcqError::UnknownChannel(7)));
    }
}
