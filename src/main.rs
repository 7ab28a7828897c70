//! CLI entry point for the acquisition demo.
//!
//! Runs the full pipeline (command queue → buffer lifecycle → reader →
//! controller) against the in-memory mock backend, printing decoded sample
//! blocks. Useful for exercising the stack without hardware:
//!
//! ```bash
//! iio-acq stream --seconds 2
//! iio-acq single --buffers 4
//! iio-acq poll --rounds 3
//! ```

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use iio_acq::channel::{ChannelDescriptor, ChannelKind};
use iio_acq::command::CommandQueue;
use iio_acq::config::Settings;
use iio_acq::controller::AcquisitionController;
use iio_acq::mock::MockDevice;
use iio_acq::reader::{ReaderEvent, ReaderMode, ReaderWorker};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iio-acq")]
#[command(about = "Buffered IIO acquisition pipeline demo", long_about = None)]
struct Cli {
    /// Configuration name under config/ (without extension)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Continuous buffered capture
    Stream {
        /// How long to stream before stopping
        #[arg(long, default_value = "2")]
        seconds: u64,
    },

    /// Bounded capture of an exact number of buffers
    Single {
        #[arg(long, default_value = "4")]
        buffers: usize,
    },

    /// Polled attribute reads instead of buffered capture
    Poll {
        #[arg(long, default_value = "3")]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    let filter = if settings.log_level.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(&settings.log_level)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Stream { seconds } => stream(&settings, seconds).await,
        Commands::Single { buffers } => single(&settings, buffers).await,
        Commands::Poll { rounds } => poll(&settings, rounds).await,
    }
}

/// Demo channel table: two voltage inputs and one resistance input, the
/// layout of a mixed analog front end.
fn demo_channels() -> BTreeMap<usize, ChannelDescriptor> {
    let mut channels = BTreeMap::new();
    for (index, id, kind) in [
        (
            0,
            "voltage0",
            ChannelKind::Linear {
                offset: 0.0,
                scale: 0.152,
            },
        ),
        (
            1,
            "voltage1",
            ChannelKind::Linear {
                offset: -32768.0,
                scale: 0.76,
            },
        ),
        (2, "resistance2", ChannelKind::Resistance),
    ] {
        let mut ch = ChannelDescriptor::new(id, index, false, true, kind);
        ch.enabled = true;
        channels.insert(index, ch);
    }
    channels
}

fn spawn_pipeline(
    settings: &Settings,
    mode: ReaderMode,
) -> (AcquisitionController, tokio::task::JoinHandle<()>) {
    let device = MockDevice::new();
    let (queue, queue_task) = CommandQueue::spawn(
        Box::new(device),
        settings.acquisition.command_queue_capacity,
    );
    let (reader, events) =
        ReaderWorker::spawn(mode, "ad74413r", queue, settings.acquisition.clone());
    (
        AcquisitionController::new(reader, events, &settings.acquisition),
        queue_task,
    )
}

async fn stream(settings: &Settings, seconds: u64) -> Result<()> {
    let (mut controller, _queue_task) = spawn_pipeline(settings, ReaderMode::Buffered);
    controller.set_channels(demo_channels()).await?;
    for index in 0..3 {
        controller.set_sampling_frequency(index, 4800.0).await?;
    }
    info!(
        effective_hz = controller.effective_sampling_frequency(),
        "starting continuous capture"
    );

    controller.start_continuous().await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    let mut stopping = false;
    loop {
        let event = tokio::select! {
            event = controller.next_event() => event,
            () = tokio::time::sleep_until(deadline), if !stopping => {
                stopping = true;
                controller.stop().await?;
                continue;
            }
        };
        match event {
            Some(ReaderEvent::BufferRefilled { data, counter }) => {
                print_block(counter, &data);
            }
            Some(ReaderEvent::Finished) => break,
            Some(ReaderEvent::Fault(message)) => {
                anyhow::bail!("acquisition fault: {message}");
            }
            Some(_) => {}
            None => break,
        }
    }
    info!("capture finished");
    Ok(())
}

async fn single(settings: &Settings, buffers: usize) -> Result<()> {
    let (mut controller, _queue_task) = spawn_pipeline(settings, ReaderMode::Buffered);
    controller.set_channels(demo_channels()).await?;
    for index in 0..3 {
        controller.set_sampling_frequency(index, 4800.0).await?;
    }

    controller.start_single_shot(buffers).await?;
    while let Some(event) = controller.next_event().await {
        match event {
            ReaderEvent::BufferRefilled { data, counter } => print_block(counter, &data),
            ReaderEvent::Finished => break,
            ReaderEvent::Fault(message) => anyhow::bail!("acquisition fault: {message}"),
            _ => {}
        }
    }
    info!(buffers, "single capture finished");
    Ok(())
}

async fn poll(settings: &Settings, rounds: usize) -> Result<()> {
    let device = MockDevice::new();
    let (queue, _queue_task) = CommandQueue::spawn(
        Box::new(device),
        settings.acquisition.command_queue_capacity,
    );
    let (reader, mut events) = ReaderWorker::spawn(
        ReaderMode::Polled,
        "ad74413r",
        queue,
        settings.acquisition.clone(),
    );
    reader.on_channels_changed(demo_channels()).await?;

    let per_round = demo_channels().len();
    for _ in 0..rounds {
        reader.poll().await?;
        for _ in 0..per_round {
            if let Some(ReaderEvent::ChannelDataChanged { index, value }) = events.recv().await {
                println!("{} ch{index} raw={value}", Utc::now().format("%H:%M:%S%.3f"));
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    reader.shutdown().await;
    Ok(())
}

fn print_block(counter: usize, data: &std::collections::HashMap<usize, Vec<f64>>) {
    let mut indices: Vec<&usize> = data.keys().collect();
    indices.sort_unstable();
    for index in indices {
        let samples = &data[index];
        let head: Vec<String> = samples.iter().take(4).map(|v| format!("{v:.3}")).collect();
        println!(
            "{} buffer {counter} ch{index}: {} samples [{} ...]",
            Utc::now().format("%H:%M:%S%.3f"),
            samples.len(),
            head.join(", ")
        );
    }
}
