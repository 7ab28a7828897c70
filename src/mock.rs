//! Mock device backend for testing the acquisition stack without hardware.
//!
//! [`MockDevice`] implements [`DeviceBackend`] end to end: attribute
//! reads/writes against an in-memory table, buffer create/refill/cancel/
//! destroy with incrementing handles, and synthetic sample generation.
//!
//! Test hooks:
//! - `script_refill` queues exact frames (16-bit samples, encoded the way
//!   the converter lays them out) returned in order before falling back to
//!   synthetic data.
//! - `refill_gate` makes every refill wait for a semaphore permit, so a test
//!   can hold a refill in flight while it races a stop against it.
//! - `fail_create` / `fail_refill_from` inject negative driver codes.
//!
//! Every operation bumps an atomic counter on the shared [`MockCounters`],
//! which tests use to assert leak-freedom (created == destroyed) and call
//! ordering.

use crate::channel::encode_raw;
use crate::command::{BufferHandle, DeviceBackend};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared operation counters, readable from the test while the device is
/// owned by the command queue task.
#[derive(Debug, Default)]
pub struct MockCounters {
    created: AtomicUsize,
    refilled: AtomicUsize,
    cancelled: AtomicUsize,
    destroyed: AtomicUsize,
    attr_reads: AtomicUsize,
    attr_writes: AtomicUsize,
}

impl MockCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn refilled(&self) -> usize {
        self.refilled.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn attr_reads(&self) -> usize {
        self.attr_reads.load(Ordering::SeqCst)
    }

    pub fn attr_writes(&self) -> usize {
        self.attr_writes.load(Ordering::SeqCst)
    }

    /// Buffers currently alive on the device side.
    pub fn active_buffers(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }
}

/// In-memory stand-in for a buffered IIO device.
pub struct MockDevice {
    counters: Arc<MockCounters>,
    attrs: HashMap<String, String>,
    scripted: VecDeque<Vec<u16>>,
    refill_gate: Option<Arc<Semaphore>>,
    fail_create: Option<i32>,
    /// Fail the Nth refill (1-based) and every one after it with this code.
    fail_refill_from: Option<(usize, i32)>,
    next_buffer_id: u64,
    active: Option<BufferHandle>,
    phase: u16,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            attrs: HashMap::new(),
            scripted: VecDeque::new(),
            refill_gate: None,
            fail_create: None,
            fail_refill_from: None,
            next_buffer_id: 0,
            active: None,
            phase: 0,
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Pre-seeds an attribute value, keyed `"target/attr"`.
    pub fn set_attr(&mut self, target: &str, attr: &str, value: impl Into<String>) -> &mut Self {
        self.attrs.insert(format!("{target}/{attr}"), value.into());
        self
    }

    /// Queues one exact refill frame. Scripted frames are served in order
    /// before the synthetic fallback kicks in.
    pub fn script_refill(&mut self, samples: Vec<u16>) -> &mut Self {
        self.scripted.push_back(samples);
        self
    }

    /// Makes every refill wait for one permit on `gate` before completing.
    pub fn refill_gate(&mut self, gate: Arc<Semaphore>) -> &mut Self {
        self.refill_gate = Some(gate);
        self
    }

    /// Makes the next buffer creation fail with `code`.
    pub fn fail_create(&mut self, code: i32) -> &mut Self {
        self.fail_create = Some(code);
        self
    }

    /// Fails refill number `nth` (1-based) and all later ones with `code`.
    pub fn fail_refill_from(&mut self, nth: usize, code: i32) -> &mut Self {
        self.fail_refill_from = Some((nth, code));
        self
    }

    /// Ramp with a little noise, so decoded blocks are distinguishable and
    /// never constant.
    fn synthetic_frame(&mut self, capacity: usize) -> Vec<u16> {
        let mut rng = rand::thread_rng();
        let base = self.phase;
        self.phase = self.phase.wrapping_add(capacity as u16);
        (0..capacity)
            .map(|i| {
                base.wrapping_add(i as u16)
                    .wrapping_add(rng.gen_range(0..4))
            })
            .collect()
    }
}

#[async_trait]
impl DeviceBackend for MockDevice {
    async fn attr_read(&mut self, target: &str, attr: &str) -> Result<String, i32> {
        self.counters.attr_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(value) = self.attrs.get(&format!("{target}/{attr}")) {
            return Ok(value.clone());
        }
        // Unseeded "raw" reads get a synthetic ADC code, anything else is
        // an unknown attribute.
        if attr == "raw" {
            let mut rng = rand::thread_rng();
            Ok(rng.gen_range(0u32..=0xFFFF).to_string())
        } else {
            Err(-5)
        }
    }

    async fn attr_write(&mut self, target: &str, attr: &str, value: &str) -> Result<(), i32> {
        self.counters.attr_writes.fetch_add(1, Ordering::SeqCst);
        self.attrs
            .insert(format!("{target}/{attr}"), value.to_string());
        Ok(())
    }

    async fn buffer_create(&mut self, device: &str, samples: usize) -> Result<BufferHandle, i32> {
        if let Some(code) = self.fail_create.take() {
            return Err(code);
        }
        if self.active.is_some() {
            // Only one buffer per device, like the real driver.
            return Err(-16);
        }
        self.next_buffer_id += 1;
        let handle = BufferHandle {
            id: self.next_buffer_id,
            device: device.to_string(),
            capacity: samples,
        };
        self.active = Some(handle.clone());
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn buffer_refill(&mut self, buffer: &BufferHandle) -> Result<Vec<u32>, i32> {
        if self.active.as_ref() != Some(buffer) {
            return Err(-22);
        }
        if let Some(gate) = &self.refill_gate {
            // Permit is consumed; each gated refill needs its own.
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(-22),
            }
        }
        let nth = self.counters.refilled.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((from, code)) = self.fail_refill_from {
            if nth >= from {
                return Err(code);
            }
        }
        let frame = match self.scripted.pop_front() {
            Some(frame) => frame,
            None => self.synthetic_frame(buffer.capacity),
        };
        Ok(frame.into_iter().map(encode_raw).collect())
    }

    async fn buffer_cancel(&mut self, buffer: &BufferHandle) -> Result<(), i32> {
        if self.active.as_ref() != Some(buffer) {
            return Err(-22);
        }
        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn buffer_destroy(&mut self, buffer: BufferHandle) -> Result<(), i32> {
        if self.active.as_ref() != Some(&buffer) {
            return Err(-22);
        }
        self.active = None;
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fixup_raw;

    #[tokio::test]
    async fn scripted_frames_come_back_in_order() {
        let mut device = MockDevice::new();
        device.script_refill(vec![1, 2, 3]);
        device.script_refill(vec![4, 5, 6]);
        let handle = device.buffer_create("dev", 3).await.expect("create");

        let first = device.buffer_refill(&handle).await.expect("refill");
        let decoded: Vec<u32> = first.iter().map(|w| fixup_raw(*w)).collect();
        assert_eq!(decoded, vec![1, 2, 3]);

        let second = device.buffer_refill(&handle).await.expect("refill");
        let decoded: Vec<u32> = second.iter().map(|w| fixup_raw(*w)).collect();
        assert_eq!(decoded, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn synthetic_frame_matches_capacity() {
        let mut device = MockDevice::new();
        let handle = device.buffer_create("dev", 16).await.expect("create");
        let frame = device.buffer_refill(&handle).await.expect("refill");
        assert_eq!(frame.len(), 16);
    }

    #[tokio::test]
    async fn second_create_is_busy() {
        let mut device = MockDevice::new();
        let handle = device.buffer_create("dev", 8).await.expect("create");
        assert_eq!(device.buffer_create("dev", 8).await, Err(-16));
        device.buffer_destroy(handle).await.expect("destroy");
        device.buffer_create("dev", 8).await.expect("create after destroy");
    }

    #[tokio::test]
    async fn refill_failure_injection() {
        let mut device = MockDevice::new();
        device.fail_refill_from(2, -110);
        let handle = device.buffer_create("dev", 4).await.expect("create");
        device.buffer_refill(&handle).await.expect("first refill");
        assert_eq!(device.buffer_refill(&handle).await, Err(-110));
        assert_eq!(device.buffer_refill(&handle).await, Err(-110));
    }

    #[tokio::test]
    async fn stale_handle_is_rejected() {
        let mut device = MockDevice::new();
        let handle = device.buffer_create("dev", 8).await.expect("create");
        device.buffer_destroy(handle.clone()).await.expect("destroy");
        assert_eq!(device.buffer_refill(&handle).await, Err(-22));
        assert_eq!(device.buffer_destroy(handle).await, Err(-22));
    }

    #[tokio::test]
    async fn unknown_attribute_read_fails() {
        let mut device = MockDevice::new();
        assert_eq!(device.attr_read("voltage0", "bogus").await, Err(-5));
        device
            .attr_write("voltage0", "sampling_frequency", "4800")
            .await
            .expect("write");
        assert_eq!(
            device.attr_read("voltage0", "sampling_frequency").await,
            Ok("4800".to_string())
        );
    }
}
