//! Stream Coordinator
//!
//! A single worker thread owns the buffer manager, the coupling table and the
//! control state. Everything else talks to it through the mailbox. Each loop
//! pass handles one pending message if there is one, otherwise advances one
//! frame while streaming, otherwise sleeps in `receive`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::FrameFormat;
use crate::capture::frame::{BufferHandle, CaptureMode, Frame, PixelFormat};
use crate::capture::manager::{BufferManager, DeviceState};
use crate::error::{CameraError, Status};
use crate::pipeline::consumer::{Consumers, Delivery};
use crate::pipeline::coupling::{Completion, ConsumerKind, ConsumerSet, CouplingTable};
use crate::pipeline::fps::FrameRateMonitor;
use crate::pipeline::mailbox::{Mailbox, ReplyId};
use crate::pipeline::params::{FrameLimits, Parameters, Size};
use crate::pipeline::stats::PipelineStats;

/// Pause after a failed dequeue before the next attempt.
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) const NUM_REPLIES: usize = 6;

pub(crate) enum Message {
    Exit,
    StartPreview,
    StopPreview,
    StartRecording,
    StopRecording,
    TakePicture,
    SetParameters(Box<Parameters>),
    PreviewDone(BufferHandle),
    RecordingDone(BufferHandle),
    PictureDone(BufferHandle),
}

impl Message {
    /// Commands reply synchronously; buffer returns and exit don't.
    pub(crate) fn reply_id(&self) -> Option<ReplyId> {
        match self {
            Message::StartPreview => Some(ReplyId(0)),
            Message::StopPreview => Some(ReplyId(1)),
            Message::StartRecording => Some(ReplyId(2)),
            Message::StopRecording => Some(ReplyId(3)),
            Message::TakePicture => Some(ReplyId(4)),
            Message::SetParameters(_) => Some(ReplyId(5)),
            Message::Exit
            | Message::PreviewDone(_)
            | Message::RecordingDone(_)
            | Message::PictureDone(_) => None,
        }
    }
}

/// Application-visible orchestration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlState {
    Stopped = 0,
    PreviewStill = 1,
    PreviewVideo = 2,
    Recording = 3,
    Capture = 4,
}

impl ControlState {
    /// States in which frames flow to the preview consumer.
    pub fn is_previewing(self) -> bool {
        matches!(
            self,
            ControlState::PreviewStill | ControlState::PreviewVideo | ControlState::Recording
        )
    }

    pub fn can_transition_to(self, next: ControlState) -> bool {
        use ControlState::*;
        matches!(
            (self, next),
            (Stopped, PreviewStill)
                | (Stopped, PreviewVideo)
                | (PreviewStill, Stopped)
                | (PreviewStill, Recording)
                | (PreviewStill, Capture)
                | (PreviewVideo, Stopped)
                | (PreviewVideo, Recording)
                | (Recording, PreviewVideo)
                | (Capture, Stopped)
        )
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ControlState::PreviewStill,
            2 => ControlState::PreviewVideo,
            3 => ControlState::Recording,
            4 => ControlState::Capture,
            _ => ControlState::Stopped,
        }
    }
}

pub(crate) struct Coordinator {
    pub(crate) camera_id: usize,
    pub(crate) mailbox: Arc<Mailbox<Message>>,
    pub(crate) manager: BufferManager,
    pub(crate) consumers: Consumers,
    pub(crate) state: ControlState,
    pub(crate) shared_state: Arc<AtomicU8>,
    pub(crate) table: Option<CouplingTable>,
    pub(crate) last_recording: Option<Frame>,
    pub(crate) snapshot_pending: bool,
    pub(crate) params: Arc<ArcSwap<Parameters>>,
    pub(crate) limits: FrameLimits,
    pub(crate) sensor_format: PixelFormat,
    pub(crate) buffer_count: u32,
    pub(crate) fps: Option<FrameRateMonitor>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) running: bool,
}

impl Coordinator {
    pub(crate) fn run(mut self) {
        info!("Coordinator for camera {} running", self.camera_id);

        while self.running {
            if self.mailbox.is_empty()
                && self.state.is_previewing()
                && self.manager.data_available()
            {
                self.advance_frame();
                continue;
            }

            match self.mailbox.receive() {
                Ok(msg) => self.dispatch(msg),
                Err(e) => {
                    error!("Coordinator mailbox failed: {}", e);
                    break;
                }
            }
        }

        self.teardown();
        info!("Coordinator for camera {} exited", self.camera_id);
    }

    fn dispatch(&mut self, msg: Message) {
        let reply = msg.reply_id();

        let status = match msg {
            Message::Exit => {
                self.running = false;
                Ok(())
            }
            Message::StartPreview => self.handle_start_preview(),
            Message::StopPreview => self.handle_stop_preview(),
            Message::StartRecording => self.handle_start_recording(),
            Message::StopRecording => self.handle_stop_recording(),
            Message::TakePicture => self.handle_take_picture(),
            Message::SetParameters(params) => self.handle_set_parameters(*params),
            Message::PreviewDone(handle) => {
                self.handle_returned(handle, ConsumerKind::Preview);
                Ok(())
            }
            Message::RecordingDone(handle) => {
                self.handle_returned(handle, ConsumerKind::Recording);
                Ok(())
            }
            Message::PictureDone(handle) => {
                self.handle_returned(handle, ConsumerKind::Snapshot);
                Ok(())
            }
        };

        if let Some(id) = reply {
            if let Err(e) = &status {
                error!("Command failed in {:?}: {}", self.state, e);
            }
            self.mailbox.reply(id, status);
        }
    }

    fn set_state(&mut self, next: ControlState) {
        if next == self.state {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.publish_state(next);
    }

    fn publish_state(&mut self, next: ControlState) {
        info!("State {:?} -> {:?}", self.state, next);
        self.state = next;
        self.shared_state.store(next as u8, Ordering::Release);
    }

    fn frame_format(&self, size: Size) -> FrameFormat {
        FrameFormat {
            width: size.width,
            height: size.height,
            format: self.sensor_format,
        }
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    fn handle_start_preview(&mut self) -> Status {
        if self.state == ControlState::Capture {
            self.stop_capture();
        }
        if self.state != ControlState::Stopped {
            return Err(CameraError::InvalidStateTransition(format!(
                "start preview while {:?}",
                self.state
            )));
        }

        let video = self.params.load().recording_hint;
        let target = self.start_preview_core(video)?;
        self.set_state(target);
        Ok(())
    }

    /// Start a preview session and build its record table. Returns the state
    /// to enter; the caller applies it.
    fn start_preview_core(&mut self, video: bool) -> Result<ControlState, CameraError> {
        let params = self.params.load_full();
        let (mode, size, target) = if video {
            (
                CaptureMode::Video,
                params.video_size.clamp_to(self.limits.video),
                ControlState::PreviewVideo,
            )
        } else {
            (
                CaptureMode::Preview,
                params.preview_size.clamp_to(self.limits.preview),
                ControlState::PreviewStill,
            )
        };

        let format = self.frame_format(size);
        self.manager
            .start_session(mode, format, self.buffer_count)?;

        if params.zoom != 0 {
            self.apply_zoom(params.zoom);
        }
        let table = CouplingTable::new(self.manager.pool_len());
        debug!("Tracking {} slots", table.len());
        self.table = Some(table);
        if let Some(fps) = self.fps.as_mut() {
            fps.reset();
        }
        Ok(target)
    }

    /// Tear down a preview session. Never fails; every step is attempted.
    /// Leaves the state to the caller.
    fn stop_preview_core(&mut self) {
        self.consumers.preview.flush();
        if matches!(
            self.state,
            ControlState::PreviewVideo | ControlState::Recording
        ) {
            self.consumers.video.flush();
        }

        self.manager.stop_session();
        self.table = None;
        self.last_recording = None;
        self.snapshot_pending = false;
    }

    fn stop_capture(&mut self) {
        self.consumers.still.flush();
        self.manager.stop_session();
        self.set_state(ControlState::Stopped);
    }

    /// Bring still preview back after a failed restart out of PreviewStill.
    /// Lands in Stopped if that fails too.
    fn restore_still_preview(&mut self) {
        if let Err(e) = self.start_preview_core(false) {
            error!("Could not restore preview: {}", e);
            self.set_state(ControlState::Stopped);
        }
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    fn handle_stop_preview(&mut self) -> Status {
        match self.state {
            ControlState::Stopped => {
                debug!("Preview already stopped");
                Ok(())
            }
            ControlState::Capture => {
                self.stop_capture();
                Ok(())
            }
            ControlState::PreviewStill | ControlState::PreviewVideo => {
                self.stop_preview_core();
                self.set_state(ControlState::Stopped);
                Ok(())
            }
            ControlState::Recording => Err(CameraError::InvalidStateTransition(
                "stop recording before stopping preview".into(),
            )),
        }
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    fn handle_start_recording(&mut self) -> Status {
        match self.state {
            ControlState::PreviewVideo => {
                self.set_state(ControlState::Recording);
                Ok(())
            }
            ControlState::PreviewStill => {
                info!("Restarting preview in video mode");
                self.stop_preview_core();
                if let Err(e) = self.start_preview_core(true) {
                    self.restore_still_preview();
                    return Err(e);
                }
                self.set_state(ControlState::Recording);
                Ok(())
            }
            other => Err(CameraError::InvalidStateTransition(format!(
                "start recording while {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    fn handle_stop_recording(&mut self) -> Status {
        if self.state != ControlState::Recording {
            return Err(CameraError::InvalidStateTransition(format!(
                "stop recording while {:?}",
                self.state
            )));
        }

        self.set_state(ControlState::PreviewVideo);
        if self.snapshot_pending {
            warn!("Recording stopped before a snapshot frame arrived");
            self.snapshot_pending = false;
        }

        // Frames the encoder never picked up count as returned. Frames it
        // still holds keep their records until it reports them done.
        for handle in self.consumers.video.flush() {
            self.handle_returned(handle, ConsumerKind::Recording);
        }
        self.last_recording = None;
        Ok(())
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    fn handle_take_picture(&mut self) -> Status {
        match self.state {
            ControlState::PreviewStill => self.capture_still(),
            ControlState::Recording => {
                self.snapshot_from_recording();
                Ok(())
            }
            other => Err(CameraError::InvalidStateTransition(format!(
                "take picture while {:?}",
                other
            ))),
        }
    }

    fn capture_still(&mut self) -> Status {
        let size = self.params.load().picture_size.clamp_to(self.limits.picture);
        let format = self.frame_format(size);
        self.stop_preview_core();

        let result = self
            .manager
            .start_session(CaptureMode::Capture, format, self.buffer_count)
            .and_then(|()| self.manager.acquire());

        match result {
            Ok(frame) => {
                info!("Captured still {}x{}", frame.meta.width, frame.meta.height);
                self.set_state(ControlState::Capture);
                self.stats.frame_delivered();
                self.deliver_to(ConsumerKind::Snapshot, frame);
                Ok(())
            }
            Err(e) => {
                self.manager.stop_session();
                self.restore_still_preview();
                Err(e)
            }
        }
    }

    /// The sensor can't run a still submode next to video, so the most
    /// recent recording frame doubles as the picture.
    fn snapshot_from_recording(&mut self) {
        let joined = match (&self.last_recording, self.table.as_mut()) {
            (Some(frame), Some(table)) => table.require(frame.handle, ConsumerKind::Snapshot),
            _ => false,
        };

        match self.last_recording.clone() {
            Some(frame) if joined => {
                debug!("Snapshot shares recording slot {}", frame.handle.slot);
                self.deliver_to(ConsumerKind::Snapshot, frame);
            }
            _ => {
                debug!("Last recording frame already recycled, using the next one");
                self.snapshot_pending = true;
            }
        }
    }

    #[instrument(skip(self, new), fields(state = ?self.state))]
    fn handle_set_parameters(&mut self, mut new: Parameters) -> Status {
        new.validate()?;

        if matches!(
            self.state,
            ControlState::PreviewVideo | ControlState::Recording
        ) && new.fit_preview_to_video()
        {
            warn!(
                "Preview size overridden to video size {}x{}",
                new.video_size.width, new.video_size.height
            );
        }

        let changes = self.params.load().diff(&new);
        let zoom = new.zoom;
        let video = new.recording_hint;
        self.params.store(Arc::new(new));

        if changes.is_empty() {
            return Ok(());
        }
        if changes.zoom {
            self.apply_zoom(zoom);
        }
        if changes.restart {
            match self.state {
                ControlState::PreviewStill | ControlState::PreviewVideo => {
                    info!("Static parameters changed, restarting preview");
                    self.stop_preview_core();
                    self.set_state(ControlState::Stopped);
                    let target = self.start_preview_core(video)?;
                    self.set_state(target);
                }
                ControlState::Stopped => {}
                other => info!("Static parameters apply after {:?} ends", other),
            }
        }
        Ok(())
    }

    fn apply_zoom(&mut self, zoom: i32) {
        if self.manager.state() == DeviceState::Closed {
            return;
        }
        if let Err(e) = self.manager.set_zoom(zoom) {
            warn!("Failed to set zoom {}: {}", zoom, e);
        }
    }

    fn advance_frame(&mut self) {
        let frame = match self.manager.acquire() {
            Ok(frame) => frame,
            Err(CameraError::NoDataYet) => return,
            Err(e) => {
                warn!("Failed to acquire frame: {}", e);
                self.stats.acquire_error();
                thread::sleep(ACQUIRE_RETRY_DELAY);
                return;
            }
        };

        let recording = self.state == ControlState::Recording;
        let snapshot = recording && self.snapshot_pending;

        let mut required = ConsumerSet::of(&[ConsumerKind::Preview]);
        if recording {
            required = required.with(ConsumerKind::Recording);
        }
        if snapshot {
            required = required.with(ConsumerKind::Snapshot);
            self.snapshot_pending = false;
        }

        let stamped = self
            .table
            .as_mut()
            .is_some_and(|table| table.stamp(frame.handle, required));
        if !stamped {
            warn!("No record for slot {}, requeueing", frame.handle.slot);
            self.release_buffer(frame.handle);
            return;
        }

        self.stats.frame_delivered();
        if let Some(fps) = self.fps.as_mut() {
            fps.tick();
        }

        if recording {
            self.last_recording = Some(frame.clone());
            self.deliver_to(ConsumerKind::Recording, frame.clone());
        }
        if snapshot {
            self.deliver_to(ConsumerKind::Snapshot, frame.clone());
        }
        self.deliver_to(ConsumerKind::Preview, frame);
    }

    fn deliver_to(&mut self, kind: ConsumerKind, frame: Frame) {
        let handle = frame.handle;
        let sink = match kind {
            ConsumerKind::Preview => &mut self.consumers.preview,
            ConsumerKind::Recording => &mut self.consumers.video,
            ConsumerKind::Snapshot => &mut self.consumers.still,
        };
        if sink.deliver(frame) == Delivery::Declined {
            self.handle_returned(handle, kind);
        }
    }

    /// A consumer is done with `handle`. May arrive after any state change.
    fn handle_returned(&mut self, handle: BufferHandle, kind: ConsumerKind) {
        if self.state == ControlState::Capture {
            if kind == ConsumerKind::Snapshot {
                self.release_buffer(handle);
            } else {
                debug!("Late {:?} return for slot {} in capture", kind, handle.slot);
                self.stats.stale_return();
            }
            return;
        }

        let Some(table) = self.table.as_mut() else {
            debug!("Late {:?} return for slot {}", kind, handle.slot);
            self.stats.stale_return();
            return;
        };

        match table.mark_returned(handle, kind) {
            Completion::Complete(handle) => self.release_buffer(handle),
            Completion::Pending => {}
            Completion::Ignored => {
                debug!("Ignoring {:?} return for slot {}", kind, handle.slot);
                self.stats.stale_return();
            }
        }
    }

    fn release_buffer(&mut self, handle: BufferHandle) {
        match self.manager.release(handle) {
            Ok(()) => self.stats.buffer_released(),
            Err(e) if e.is_stale() => {
                debug!("Dropping stale buffer {:?}", handle);
                self.stats.stale_return();
            }
            Err(e) => warn!("Failed to requeue slot {}: {}", handle.slot, e),
        }
    }

    fn teardown(&mut self) {
        match self.state {
            ControlState::Stopped => {}
            ControlState::Capture => self.stop_capture(),
            _ => {
                self.stop_preview_core();
                // Shutdown may leave Recording directly.
                self.publish_state(ControlState::Stopped);
            }
        }
        self.manager.close();
        self.mailbox.close();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Wake any caller still blocked on a reply, including after a panic.
        self.mailbox.close();
    }
}
