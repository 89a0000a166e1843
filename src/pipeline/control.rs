//! API-facing camera handle
//!
//! `CameraControl` owns the coordinator thread. Commands become mailbox
//! messages and block until the worker replies; queries read state the
//! worker publishes and never wait on it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::capture::frame::PixelFormat;
use crate::capture::manager::BufferManager;
use crate::error::{CameraError, Status};
use crate::pipeline::consumer::{BufferReturns, Consumers};
use crate::pipeline::coordinator::{ControlState, Coordinator, Message, NUM_REPLIES};
use crate::pipeline::fps::FrameRateMonitor;
use crate::pipeline::mailbox::Mailbox;
use crate::pipeline::params::{FrameLimits, Parameters, Size};
use crate::pipeline::stats::{PipelineStats, StatsSnapshot};
use crate::registry::{CameraInfo, CameraRegistry};
use crate::Config;

pub struct CameraControl {
    camera: CameraInfo,
    mailbox: Arc<Mailbox<Message>>,
    /// Serializes callers so each reply slot has one waiter.
    commands: Mutex<()>,
    state: Arc<AtomicU8>,
    params: Arc<ArcSwap<Parameters>>,
    limits: FrameLimits,
    stats: Arc<PipelineStats>,
    worker: Option<JoinHandle<()>>,
}

impl CameraControl {
    /// Query camera `camera_id` for its limits and start its coordinator thread.
    pub fn spawn(
        registry: Arc<CameraRegistry>,
        camera_id: usize,
        consumers: Consumers,
        config: &Config,
    ) -> Result<Self, CameraError> {
        let camera = registry
            .camera_info(camera_id)
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;
        config.parameters.validate()?;
        if config.capture.buffer_count == 0 {
            return Err(CameraError::BadValue("buffer_count must be positive".into()));
        }

        let mut manager = BufferManager::new(Arc::clone(&registry), camera_id);
        let limits = query_limits(&mut manager, &camera, config.capture.format)?;

        let mailbox = Arc::new(Mailbox::new(format!("camera{}", camera_id), NUM_REPLIES));
        let state = Arc::new(AtomicU8::new(ControlState::Stopped as u8));
        let params = Arc::new(ArcSwap::from_pointee(config.parameters.clone()));
        let stats = Arc::new(PipelineStats::default());

        let fps = config
            .pipeline
            .enable_profiling
            .then(|| FrameRateMonitor::new(Duration::from_millis(config.pipeline.fps_interval_ms)));

        let coordinator = Coordinator {
            camera_id,
            mailbox: Arc::clone(&mailbox),
            manager,
            consumers,
            state: ControlState::Stopped,
            shared_state: Arc::clone(&state),
            table: None,
            last_recording: None,
            snapshot_pending: false,
            params: Arc::clone(&params),
            limits,
            sensor_format: config.capture.format,
            buffer_count: config.capture.buffer_count,
            fps,
            stats: Arc::clone(&stats),
            running: true,
        };

        let worker_core = config.pipeline.worker_core;
        let worker = thread::Builder::new()
            .name(format!("camhal-ctl{}", camera_id))
            .spawn(move || {
                if let Some(core) = worker_core {
                    pin_to_core(core);
                }
                coordinator.run();
            })
            .map_err(|e| CameraError::Unknown(format!("spawn coordinator: {}", e)))?;

        info!(
            "Camera {} ({:?}) ready, max picture {}x{}",
            camera_id, camera.facing, limits.picture.width, limits.picture.height
        );

        Ok(Self {
            camera,
            mailbox,
            commands: Mutex::new(()),
            state,
            params,
            limits,
            stats,
            worker: Some(worker),
        })
    }

    fn command(&self, msg: Message) -> Status {
        let _turn = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let reply = msg.reply_id();
        self.mailbox.send(msg, reply)
    }

    pub fn start_preview(&self) -> Status {
        self.command(Message::StartPreview)
    }

    pub fn stop_preview(&self) -> Status {
        self.command(Message::StopPreview)
    }

    pub fn start_recording(&self) -> Status {
        self.command(Message::StartRecording)
    }

    pub fn stop_recording(&self) -> Status {
        self.command(Message::StopRecording)
    }

    pub fn take_picture(&self) -> Status {
        self.command(Message::TakePicture)
    }

    pub fn set_parameters(&self, params: Parameters) -> Status {
        self.command(Message::SetParameters(Box::new(params)))
    }

    /// Current parameter snapshot.
    pub fn parameters(&self) -> Arc<Parameters> {
        self.params.load_full()
    }

    pub fn state(&self) -> ControlState {
        ControlState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn preview_enabled(&self) -> bool {
        self.state().is_previewing()
    }

    pub fn recording_enabled(&self) -> bool {
        self.state() == ControlState::Recording
    }

    pub fn camera_info(&self) -> &CameraInfo {
        &self.camera
    }

    pub fn frame_limits(&self) -> FrameLimits {
        self.limits
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Return path handed to consumers.
    pub fn returns(&self) -> BufferReturns {
        BufferReturns::new(Arc::clone(&self.mailbox))
    }

    /// Stop whatever is running and join the worker.
    pub fn shutdown(mut self) {
        self.join_worker();
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.mailbox.send(Message::Exit, None).is_err() {
            debug!("Coordinator already gone");
        }
        if worker.join().is_err() {
            warn!("Coordinator for camera {} panicked", self.camera.id);
        }
    }
}

impl Drop for CameraControl {
    fn drop(&mut self) {
        self.join_worker();
    }
}

fn query_limits(
    manager: &mut BufferManager,
    camera: &CameraInfo,
    format: PixelFormat,
) -> Result<FrameLimits, CameraError> {
    manager.open()?;
    let limits = match manager.query_max_resolution(format) {
        Ok((width, height)) => FrameLimits::with_picture(camera.facing, Size::new(width, height)),
        Err(e) => {
            warn!("Resolution query failed ({}), using defaults", e);
            FrameLimits::for_facing(camera.facing)
        }
    };
    manager.close();
    Ok(limits)
}

fn pin_to_core(core: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.into_iter().find(|c| c.id == core) {
        Some(id) => {
            if core_affinity::set_for_current(id) {
                debug!("Coordinator pinned to core {}", core);
            } else {
                warn!("Failed to pin coordinator to core {}", core);
            }
        }
        None => warn!("Core {} not available for pinning", core),
    }
}
