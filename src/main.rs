//! camhal demo: stream preview from one camera until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camhal::capture::frame::Frame;
use camhal::pipeline::{BufferReturns, ChannelSink, Consumers};
use camhal::{BufferHandle, CameraControl, Config};
use color_eyre::{eyre::eyre, Result};
use flume::Receiver;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camhal=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camhal launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let registry = Arc::new(config.registry());
    if registry.is_empty() {
        return Err(eyre!("No camera found"));
    }
    let camera_id = config.capture.camera_id;
    info!("Using camera {:?}", registry.camera_info(camera_id)?);

    let depth = config.pipeline.consumer_queue_depth;
    let (preview, preview_rx) = ChannelSink::bounded("preview", depth);
    let (video, video_rx) = ChannelSink::bounded("video", depth);
    let (still, still_rx) = ChannelSink::bounded("still", 1);
    let consumers = Consumers {
        preview: Box::new(preview),
        video: Box::new(video),
        still: Box::new(still),
    };

    let control = Arc::new(CameraControl::spawn(
        Arc::clone(&registry),
        camera_id,
        consumers,
        &config,
    )?);
    let returns = control.returns();

    tokio::spawn(drain(preview_rx, returns.clone(), BufferReturns::preview_done));
    tokio::spawn(drain(video_rx, returns.clone(), BufferReturns::recording_done));
    tokio::spawn(drain(still_rx, returns, BufferReturns::picture_done));

    let ctl = Arc::clone(&control);
    tokio::task::spawn_blocking(move || ctl.start_preview()).await??;
    info!("Preview running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    let ctl = Arc::clone(&control);
    tokio::task::spawn_blocking(move || ctl.stop_preview()).await??;

    let stats = control.stats();
    info!(
        "Delivered {} frames, released {}, stale {}",
        stats.frames_delivered, stats.buffers_released, stats.stale_returns
    );

    match Arc::try_unwrap(control) {
        Ok(control) => tokio::task::spawn_blocking(move || control.shutdown()).await?,
        Err(_) => return Err(eyre!("camera control still shared at shutdown")),
    }

    info!("camhal shutting down");
    Ok(())
}

/// Stand-in consumer: look at each frame briefly, then hand it back.
async fn drain(
    rx: Receiver<Frame>,
    returns: BufferReturns,
    done: fn(&BufferReturns, BufferHandle),
) {
    while let Ok(frame) = rx.recv_async().await {
        debug!(
            "frame #{} slot {} {}x{} {} bytes",
            frame.meta.sequence,
            frame.handle.slot,
            frame.meta.width,
            frame.meta.height,
            frame.data.len()
        );
        let handle = frame.handle;
        drop(frame);
        tokio::time::sleep(Duration::from_millis(1)).await;
        done(&returns, handle);
    }
}
