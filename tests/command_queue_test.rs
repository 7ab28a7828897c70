//! Command queue behavior against the mock backend: FIFO ordering, typed
//! results, and negative driver codes surfacing as failed outcomes.

use iio_acq::command::{Command, CommandQueue, CommandResult};
use iio_acq::mock::MockDevice;

#[tokio::test]
async fn commands_are_serviced_in_fifo_order() {
    let (queue, _task) = CommandQueue::spawn(Box::new(MockDevice::new()), 8);

    // Write then read the same attribute; FIFO guarantees the read sees the
    // written value.
    let (write, write_rx) = Command::attr_write("voltage0", "sampling_frequency", "4800");
    let (read, read_rx) = Command::attr_read("voltage0", "sampling_frequency");
    queue.enqueue(write).await.expect("enqueue write");
    queue.enqueue(read).await.expect("enqueue read");

    let write_outcome = write_rx.await.expect("write completion");
    assert!(!write_outcome.is_failure());

    let read_outcome = read_rx.await.expect("read completion");
    assert!(!read_outcome.is_failure());
    assert_eq!(read_outcome.result, CommandResult::Attr("4800".to_string()));
}

#[tokio::test]
async fn driver_error_codes_are_reported() {
    let (queue, _task) = CommandQueue::spawn(Box::new(MockDevice::new()), 8);

    let (read, rx) = Command::attr_read("voltage0", "no_such_attribute");
    queue.enqueue(read).await.expect("enqueue");
    let outcome = rx.await.expect("completion");
    assert!(outcome.is_failure());
    assert_eq!(outcome.return_code, -5);
    assert_eq!(outcome.result, CommandResult::None);
}

#[tokio::test]
async fn refill_return_code_is_sample_count() {
    let (queue, _task) = CommandQueue::spawn(Box::new(MockDevice::new()), 8);

    let (create, create_rx) = Command::buffer_create("ad74413r", 16);
    queue.enqueue(create).await.expect("enqueue create");
    let outcome = create_rx.await.expect("create completion");
    let CommandResult::Buffer(handle) = outcome.result else {
        panic!("expected a buffer handle, got {:?}", outcome.result);
    };

    let (refill, refill_rx) = Command::buffer_refill(handle);
    queue.enqueue(refill).await.expect("enqueue refill");
    let outcome = refill_rx.await.expect("refill completion");
    assert_eq!(outcome.return_code, 16);
    match outcome.result {
        CommandResult::Samples(samples) => assert_eq!(samples.len(), 16),
        other => panic!("expected samples, got {other:?}"),
    }
}

#[tokio::test]
async fn enqueue_after_queue_task_gone_fails() {
    let (queue, task) = CommandQueue::spawn(Box::new(MockDevice::new()), 8);
    task.abort();
    let _ = task.await;

    let (read, _rx) = Command::attr_read("voltage0", "raw");
    let err = queue.enqueue(read).await.expect_err("queue is gone");
    assert!(matches!(err, iio_acq::error::AcqError::QueueClosed));
}
