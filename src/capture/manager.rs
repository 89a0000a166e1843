//! Device Buffer Manager
//!
//! Owns one camera node and its pool of user-pointer buffers. The lifecycle
//! is `Closed -> Opened -> Configured -> Streaming` and back. Every buffer
//! handed out is stamped with the session epoch; returns from an earlier
//! session, or a second return of the same delivery, are refused as stale
//! and never requeued.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::capture::device::{FrameFormat, VideoDevice};
use crate::capture::frame::{BufferHandle, CaptureMode, Epoch, Frame, FrameMetadata, PixelFormat};
use crate::capture::memory::{frame_bytes, SlotMemory};
use crate::error::{CameraError, Status};
use crate::registry::{CameraRegistry, OpenDevice};

pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Used when the node cannot report a frame interval.
pub const DEFAULT_SENSOR_FPS: f32 = 15.0;

/// Width and height requested when querying the largest still size.
const QUERY_DIMENSION: u32 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

struct Slot {
    memory: Arc<SlotMemory>,
    queued: bool,
    /// Set while the slot is out with consumers.
    delivery: Option<BufferHandle>,
}

/// Read-only view of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: usize,
    pub len: usize,
    pub format: PixelFormat,
    pub queued: bool,
}

struct BufferPool {
    slots: Vec<Slot>,
    format: FrameFormat,
    queued: usize,
}

pub struct BufferManager {
    registry: Arc<CameraRegistry>,
    camera_id: usize,
    device: Option<OpenDevice>,
    state: DeviceState,
    mode: CaptureMode,
    pool: Option<BufferPool>,
    epoch: Epoch,
    sequence: u64,
    fps: f32,
}

impl BufferManager {
    pub fn new(registry: Arc<CameraRegistry>, camera_id: usize) -> Self {
        Self {
            registry,
            camera_id,
            device: None,
            state: DeviceState::Closed,
            mode: CaptureMode::None,
            pool: None,
            epoch: Epoch::default(),
            sequence: 0,
            fps: DEFAULT_SENSOR_FPS,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn frame_rate(&self) -> f32 {
        self.fps
    }

    pub fn pool_len(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.slots.len())
    }

    /// Negotiated format of the current pool.
    pub fn pool_format(&self) -> Option<FrameFormat> {
        self.pool.as_ref().map(|p| p.format)
    }

    pub fn pool_slots(&self) -> Vec<SlotInfo> {
        let Some(pool) = &self.pool else {
            return Vec::new();
        };
        pool.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                len: slot.memory.len(),
                format: pool.format.format,
                queued: slot.queued,
            })
            .collect()
    }

    /// Buffers currently owned by the device.
    pub fn queued_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.queued)
    }

    /// True while streaming with at least one buffer queued to the device.
    pub fn data_available(&self) -> bool {
        self.state == DeviceState::Streaming && self.queued_count() > 0
    }

    /// Whether `handle` belongs to the current session.
    pub fn is_valid(&self, handle: &BufferHandle) -> bool {
        handle.epoch == self.epoch
    }

    fn device(&mut self) -> Result<&mut dyn VideoDevice, CameraError> {
        match self.device.as_mut() {
            Some(open) => Ok(open.device.as_mut()),
            None => Err(CameraError::InvalidStateTransition(
                "device is not open".into(),
            )),
        }
    }

    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn open(&mut self) -> Status {
        if self.state != DeviceState::Closed {
            return Err(CameraError::DeviceUnavailable(format!(
                "camera {} is already open",
                self.camera_id
            )));
        }

        self.device = Some(self.registry.open(self.camera_id)?);
        self.state = DeviceState::Opened;
        info!("Camera {} opened", self.camera_id);
        Ok(())
    }

    /// Closing an already closed device is a no-op.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        if self.state == DeviceState::Streaming {
            self.stop();
        }
        if self.state == DeviceState::Configured {
            self.deconfigure();
        }

        self.device = None;
        self.state = DeviceState::Closed;
        info!("Camera {} closed", self.camera_id);
    }

    /// Select the capture submode, negotiate the format and allocate
    /// `buffer_count` slots. A configured device is deconfigured first.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn configure(
        &mut self,
        mode: CaptureMode,
        requested: FrameFormat,
        buffer_count: u32,
    ) -> Status {
        match self.state {
            DeviceState::Opened => {}
            DeviceState::Configured => self.deconfigure(),
            other => {
                return Err(CameraError::InvalidStateTransition(format!(
                    "configure while {:?}",
                    other
                )))
            }
        }

        if requested.width == 0 || requested.height == 0 {
            return Err(CameraError::ConfigurationFailed(format!(
                "invalid size {}x{}",
                requested.width, requested.height
            )));
        }
        if buffer_count == 0 {
            return Err(CameraError::ConfigurationFailed(
                "buffer count must be positive".into(),
            ));
        }

        let device = self.device()?;
        device
            .set_capture_mode(mode)
            .map_err(|e| CameraError::ConfigurationFailed(format!("capture mode {:?}: {}", mode, e)))?;

        let format = device
            .set_format(requested)
            .map_err(|e| CameraError::ConfigurationFailed(format!("set format: {}", e)))?;

        let fps = match device.frame_rate(format.format, format.width, format.height) {
            Ok(fps) if fps > 0.0 => fps,
            Ok(_) | Err(_) => {
                warn!(
                    "Could not read frame rate for {}x{}, assuming {}",
                    format.width, format.height, DEFAULT_SENSOR_FPS
                );
                DEFAULT_SENSOR_FPS
            }
        };

        let slots = allocate_slots(device, buffer_count)?;

        info!(
            "Configured {:?} {}x{} {:?} @ {:.1} fps with {} buffers",
            mode,
            format.width,
            format.height,
            format.format,
            fps,
            slots.len()
        );

        self.fps = fps;
        self.mode = mode;
        self.pool = Some(BufferPool {
            slots,
            format,
            queued: 0,
        });
        self.state = DeviceState::Configured;
        Ok(())
    }

    /// Free the pool and return to `Opened`.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn deconfigure(&mut self) {
        if self.state == DeviceState::Streaming {
            self.stop();
        }
        if self.state != DeviceState::Configured {
            return;
        }

        if let Ok(device) = self.device() {
            if let Err(e) = device.request_buffers(0) {
                warn!("Failed to free device buffers: {}", e);
            }
        }
        self.pool = None;
        self.mode = CaptureMode::None;
        self.state = DeviceState::Opened;
        debug!("Buffer pool freed");
    }

    /// Queue every slot and arm the stream. Starts a new epoch.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn start(&mut self) -> Status {
        if self.state != DeviceState::Configured {
            return Err(CameraError::InvalidStateTransition(format!(
                "start while {:?}",
                self.state
            )));
        }

        let (device, pool) = match (self.device.as_mut(), self.pool.as_mut()) {
            (Some(open), Some(pool)) => (open.device.as_mut(), pool),
            _ => {
                return Err(CameraError::InvalidStateTransition(
                    "no buffer pool".into(),
                ))
            }
        };

        let armed = queue_all(device, pool).and_then(|()| {
            device
                .stream_on()
                .map_err(|e| CameraError::from_io("stream on", e))
        });

        if let Err(e) = armed {
            warn!("Failed to start streaming: {}", e);
            if let Err(e) = device.stream_off() {
                debug!("stream off after failed start: {}", e);
            }
            reset_queue(pool);
            return Err(e);
        }

        self.epoch = self.epoch.next();
        self.state = DeviceState::Streaming;
        info!(
            "Streaming {:?} with {} buffers ({})",
            self.mode,
            pool.slots.len(),
            self.epoch
        );
        Ok(())
    }

    /// Disarm the stream. Failures are logged and never block teardown.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn stop(&mut self) {
        if self.state != DeviceState::Streaming {
            debug!("stop while {:?}, nothing to do", self.state);
            return;
        }

        if let Some(open) = self.device.as_mut() {
            if let Err(e) = open.device.stream_off() {
                warn!("Failed to stop streaming: {}", e);
            }
        }
        if let Some(pool) = self.pool.as_mut() {
            reset_queue(pool);
        }
        self.state = DeviceState::Configured;
        info!("Streaming stopped ({})", self.epoch);
    }

    /// Dequeue the next completed buffer. Blocks until one is ready; returns
    /// `NoDataYet` when nothing is queued to the device.
    pub fn acquire(&mut self) -> Result<Frame, CameraError> {
        if self.state != DeviceState::Streaming {
            return Err(CameraError::InvalidStateTransition(format!(
                "acquire while {:?}",
                self.state
            )));
        }
        if self.queued_count() == 0 {
            return Err(CameraError::NoDataYet);
        }

        let (device, pool) = match (self.device.as_mut(), self.pool.as_mut()) {
            (Some(open), Some(pool)) => (open.device.as_mut(), pool),
            _ => return Err(CameraError::NoDataYet),
        };

        let done = device
            .dequeue_buffer()
            .map_err(|e| CameraError::from_io("dequeue", e))?;

        let index = done.index as usize;
        let slot = pool
            .slots
            .get_mut(index)
            .ok_or_else(|| CameraError::Unknown(format!("device returned index {}", index)))?;
        if !slot.queued {
            return Err(CameraError::Unknown(format!(
                "device returned slot {} which was not queued",
                index
            )));
        }

        self.sequence += 1;
        let handle = BufferHandle {
            slot: index,
            epoch: self.epoch,
            sequence: self.sequence,
        };
        slot.queued = false;
        slot.delivery = Some(handle);
        pool.queued -= 1;

        let meta = FrameMetadata {
            sequence: self.sequence,
            width: pool.format.width,
            height: pool.format.height,
            format: pool.format.format,
            device_timestamp: done.timestamp,
        };

        Ok(Frame {
            handle,
            data: frame_bytes(&slot.memory, done.bytes_used as usize),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        })
    }

    /// Requeue a delivered buffer. Returns from another epoch, or for a slot
    /// that is not out with this exact delivery, are `StaleBuffer`.
    pub fn release(&mut self, handle: BufferHandle) -> Status {
        if handle.epoch != self.epoch {
            return Err(CameraError::StaleBuffer { slot: handle.slot });
        }
        if self.state != DeviceState::Streaming {
            return Err(CameraError::StaleBuffer { slot: handle.slot });
        }

        let (device, pool) = match (self.device.as_mut(), self.pool.as_mut()) {
            (Some(open), Some(pool)) => (open.device.as_mut(), pool),
            _ => return Err(CameraError::StaleBuffer { slot: handle.slot }),
        };

        let slot = pool
            .slots
            .get_mut(handle.slot)
            .ok_or(CameraError::StaleBuffer { slot: handle.slot })?;
        if slot.delivery != Some(handle) {
            return Err(CameraError::StaleBuffer { slot: handle.slot });
        }

        // Whatever the outcome this delivery is finished; a failed queue
        // parks the slot until the next start.
        slot.delivery = None;
        if let Err(e) = device.queue_buffer(handle.slot as u32, &slot.memory) {
            warn!("Slot {} lost until restart: {}", handle.slot, e);
            return Err(CameraError::from_io("queue", e));
        }
        slot.queued = true;
        pool.queued += 1;
        Ok(())
    }

    /// Query the largest still size the sensor offers. The device must be
    /// open and idle. Callers substitute static defaults on failure.
    #[instrument(skip(self), fields(camera = self.camera_id))]
    pub fn query_max_resolution(&mut self, format: PixelFormat) -> Result<(u32, u32), CameraError> {
        if self.state != DeviceState::Opened {
            return Err(CameraError::InvalidStateTransition(format!(
                "resolution query while {:?}",
                self.state
            )));
        }

        let device = self.device()?;
        device
            .set_capture_mode(CaptureMode::Capture)
            .map_err(|e| CameraError::ConfigurationFailed(format!("capture mode: {}", e)))?;

        match device.enum_frame_sizes(format) {
            Ok(sizes) => {
                for (w, h) in &sizes {
                    debug!("Supported size {}x{}", w, h);
                }
            }
            Err(e) => debug!("Frame size enumeration unavailable: {}", e),
        }

        let granted = device
            .try_format(FrameFormat {
                width: QUERY_DIMENSION,
                height: QUERY_DIMENSION,
                format,
            })
            .map_err(|e| CameraError::ConfigurationFailed(format!("try format: {}", e)))?;

        info!("Max resolution {}x{}", granted.width, granted.height);
        Ok((granted.width, granted.height))
    }

    /// Best-effort zoom. Ignored while in still-capture mode.
    pub fn set_zoom(&mut self, zoom: i32) -> Status {
        if self.mode == CaptureMode::Capture {
            debug!("Zoom ignored in capture mode");
            return Ok(());
        }
        let device = self.device()?;
        device
            .set_zoom(zoom)
            .map_err(|e| CameraError::from_io("set zoom", e))
    }

    /// Open, configure and start in one step. Anything already done is
    /// unwound if a later step fails.
    pub fn start_session(
        &mut self,
        mode: CaptureMode,
        format: FrameFormat,
        buffer_count: u32,
    ) -> Status {
        let opened_here = self.state == DeviceState::Closed;
        if opened_here {
            self.open()?;
        }

        let result = self
            .configure(mode, format, buffer_count)
            .and_then(|()| self.start());

        if let Err(e) = result {
            warn!("Failed to start {:?} session: {}", mode, e);
            self.deconfigure();
            if opened_here {
                self.close();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop, free buffers and close.
    pub fn stop_session(&mut self) {
        self.stop();
        self.deconfigure();
        self.close();
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn allocate_slots(device: &mut dyn VideoDevice, count: u32) -> Result<Vec<Slot>, CameraError> {
    let result = try_allocate(device, count);
    if result.is_err() {
        if let Err(e) = device.request_buffers(0) {
            warn!("Rollback of device buffers failed: {}", e);
        }
    }
    result
}

fn try_allocate(device: &mut dyn VideoDevice, count: u32) -> Result<Vec<Slot>, CameraError> {
    let granted = device
        .request_buffers(count)
        .map_err(|e| CameraError::AllocationFailed(format!("request buffers: {}", e)))?;
    if granted < count {
        return Err(CameraError::AllocationFailed(format!(
            "requested {} buffers, device granted {}",
            count, granted
        )));
    }

    let mut slots = Vec::with_capacity(count as usize);
    for index in 0..count {
        let len = device
            .query_buffer(index)
            .map_err(|e| CameraError::AllocationFailed(format!("query buffer {}: {}", index, e)))?;
        let memory = SlotMemory::allocate(len)?;
        slots.push(Slot {
            memory: Arc::new(memory),
            queued: false,
            delivery: None,
        });
    }
    Ok(slots)
}

fn queue_all(device: &mut dyn VideoDevice, pool: &mut BufferPool) -> Status {
    reset_queue(pool);
    for (index, slot) in pool.slots.iter_mut().enumerate() {
        device
            .queue_buffer(index as u32, &slot.memory)
            .map_err(|e| CameraError::from_io("queue", e))?;
        slot.queued = true;
        pool.queued += 1;
    }
    Ok(())
}

fn reset_queue(pool: &mut BufferPool) {
    for slot in &mut pool.slots {
        slot.queued = false;
        slot.delivery = None;
    }
    pool.queued = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimFaults, SimulatedSensor};
    use crate::registry::Facing;

    fn manager() -> (BufferManager, SimulatedSensor) {
        let sensor = SimulatedSensor::default();
        let mut registry = CameraRegistry::new();
        registry
            .register_simulated(Facing::Back, 0, sensor.clone())
            .unwrap();
        (BufferManager::new(Arc::new(registry), 0), sensor)
    }

    fn vga() -> FrameFormat {
        FrameFormat {
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv4,
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (mut mgr, sensor) = manager();
        mgr.close();
        mgr.open().unwrap();
        mgr.close();
        mgr.close();
        assert_eq!(mgr.state(), DeviceState::Closed);
        assert_eq!(sensor.counters().closes, 1);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let (mut mgr, _) = manager();
        mgr.open().unwrap();
        let bad = FrameFormat {
            width: 0,
            ..vga()
        };
        assert!(matches!(
            mgr.configure(CaptureMode::Preview, bad, 4),
            Err(CameraError::ConfigurationFailed(_))
        ));
        assert!(matches!(
            mgr.configure(CaptureMode::Preview, vga(), 0),
            Err(CameraError::ConfigurationFailed(_))
        ));
        assert_eq!(mgr.state(), DeviceState::Opened);
    }

    #[test]
    fn capture_mode_is_set_before_the_format() {
        let (mut mgr, sensor) = manager();
        sensor.set_faults(SimFaults {
            fail_set_mode: true,
            ..Default::default()
        });
        mgr.open().unwrap();
        assert!(mgr.configure(CaptureMode::Video, vga(), 4).is_err());
        assert_eq!(sensor.counters().format_sets, 0);
    }

    #[test]
    fn frame_rate_falls_back_when_the_node_cannot_report_it() {
        let (mut mgr, sensor) = manager();
        sensor.set_faults(SimFaults {
            fail_frame_rate: true,
            ..Default::default()
        });
        mgr.open().unwrap();
        mgr.configure(CaptureMode::Preview, vga(), 2).unwrap();
        assert_eq!(mgr.frame_rate(), DEFAULT_SENSOR_FPS);
    }

    #[test]
    fn acquire_with_nothing_queued_is_no_data() {
        let (mut mgr, _) = manager();
        mgr.start_session(CaptureMode::Preview, vga(), 1).unwrap();
        let frame = mgr.acquire().unwrap();
        assert!(!mgr.data_available());
        assert_eq!(mgr.acquire().unwrap_err(), CameraError::NoDataYet);
        mgr.release(frame.handle).unwrap();
        assert!(mgr.data_available());
    }

    #[test]
    fn max_resolution_query_uses_capture_mode() {
        let (mut mgr, sensor) = manager();
        mgr.open().unwrap();
        let (w, h) = mgr.query_max_resolution(PixelFormat::Yuyv4).unwrap();
        assert_eq!((w, h), sensor.max_size());
        assert_eq!(sensor.last_mode(), CaptureMode::Capture);
    }

    #[test]
    fn zoom_is_skipped_in_capture_mode() {
        let (mut mgr, sensor) = manager();
        mgr.start_session(CaptureMode::Capture, vga(), 1).unwrap();
        mgr.set_zoom(3).unwrap();
        assert_eq!(sensor.counters().zoom_sets, 0);
    }
}
