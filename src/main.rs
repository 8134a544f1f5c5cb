//! camstream: paced V4L2 capture with an optional YUYV to RGB24 stage

use std::path::PathBuf;
use std::time::Duration;

use camstream::capture::{DeviceBackend, DeviceHandle, OwnedFrame, SyntheticBackend};
use camstream::pipeline::{CancelToken, CaptureSession, StatsSnapshot};
use camstream::sink::ChannelSink;
use camstream::{utils, Config, Scheduling, SYNTHETIC_DEVICE};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camstream launching...");

    // Load configuration
    let config_path = std::env::var_os("CAMSTREAM_CONFIG").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    // Ctrl-C stops the capture loop at its next iteration
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping capture");
                on_interrupt.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let stats = if config.uses_synthetic_device() {
        info!("Using synthetic capture device");
        let backend = SyntheticBackend::new(config.synthetic.clone());
        let device = DeviceHandle::with_backend(SYNTHETIC_DEVICE, backend)?;
        run(device, config, cancel).await?
    } else {
        // Auto-detect capture device if needed
        if config.capture.device.is_empty() {
            let found = tokio::task::spawn_blocking(utils::auto_detect_device).await??;
            config.capture.device = found.path;
            config.capture.format = found.format;
        }
        info!("Using capture device: {}", config.capture.device);

        let path = PathBuf::from(&config.capture.device);
        if let Err(e) = utils::log_device_info(&path) {
            warn!("Could not list formats of {}: {}", path.display(), e);
        }
        let device = DeviceHandle::open(&path)?;
        run(device, config, cancel).await?
    };

    info!(
        "camstream shutting down: {} frames, {} dropped, {:.1} fps average",
        stats.total_frames, stats.dropped_frames, stats.avg_fps
    );
    Ok(())
}

async fn run<B: DeviceBackend + 'static>(
    device: DeviceHandle<B>,
    config: Config,
    cancel: CancelToken,
) -> Result<StatsSnapshot> {
    let Config {
        capture, pipeline, ..
    } = config;
    let scheduling = pipeline.scheduling;
    let capacity = pipeline.channel_capacity.max(1);

    let session = tokio::task::spawn_blocking(move || {
        CaptureSession::with_device(device, &capture, &pipeline)
    })
    .await??;

    match scheduling {
        Scheduling::Inline => {
            let (mut sink, rx) = ChannelSink::bounded(capacity);
            let consumer = tokio::spawn(consume(rx));

            // The sink is dropped when the loop ends, which ends the consumer
            let capture = tokio::task::spawn_blocking(move || {
                let mut session = session;
                session.run(&mut sink, &cancel)
            });
            let stats = capture.await??;
            let received = consumer.await?;
            debug!("Consumer received {} frames", received);
            Ok(stats)
        }
        Scheduling::Shared => {
            let (slot, handle) = session.spawn(cancel)?;

            let reader = tokio::task::spawn_blocking(move || {
                let mut received = 0u64;
                loop {
                    match slot.wait_latest(Duration::from_millis(500)) {
                        Some(frame) => {
                            received += 1;
                            log_frame(&frame);
                        }
                        None if slot.is_closed() => break,
                        None => {}
                    }
                }
                info!(
                    "Reader took {} frames, {} replaced unread",
                    received,
                    slot.overwritten()
                );
            });
            reader.await?;

            let joined = tokio::task::spawn_blocking(move || handle.join()).await?;
            let stats = joined.map_err(|_| eyre!("capture thread panicked"))??;
            Ok(stats)
        }
    }
}

async fn consume(rx: flume::Receiver<OwnedFrame>) -> u64 {
    let mut received = 0;
    while let Ok(frame) = rx.recv_async().await {
        received += 1;
        log_frame(&frame);
    }
    received
}

fn log_frame(frame: &OwnedFrame) {
    let meta = &frame.meta;
    debug!(
        "Frame {}: {}x{} {} ({} bytes, device time {:?})",
        meta.sequence,
        meta.width,
        meta.height,
        meta.format,
        frame.data.len(),
        meta.device_timestamp
    );
}
