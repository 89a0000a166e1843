//! Streaming-device protocol boundary
//!
//! `VideoDevice` mirrors the Video4Linux2 calls the buffer manager issues, one
//! method per ioctl, so the manager can run the same protocol against a real
//! node or the simulated sensor.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::frame::{CaptureMode, PixelFormat};
use crate::capture::memory::SlotMemory;

#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub video_capture: bool,
    pub streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A buffer reported complete by the device.
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Option<Duration>,
}

pub trait VideoDevice: Send {
    fn query_caps(&self) -> io::Result<DeviceCaps>;

    /// Switch the capture submode. Must precede format negotiation.
    fn set_capture_mode(&mut self, mode: CaptureMode) -> io::Result<()>;

    fn get_format(&self) -> io::Result<FrameFormat>;
    fn try_format(&self, requested: FrameFormat) -> io::Result<FrameFormat>;
    fn set_format(&mut self, requested: FrameFormat) -> io::Result<FrameFormat>;

    /// Request `count` user-pointer buffers; zero frees them.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Native length in bytes of buffer `index`.
    fn query_buffer(&self, index: u32) -> io::Result<usize>;

    fn queue_buffer(&mut self, index: u32, memory: &Arc<SlotMemory>) -> io::Result<()>;

    /// Blocks until a queued buffer completes.
    fn dequeue_buffer(&mut self) -> io::Result<Dequeued>;

    fn stream_on(&mut self) -> io::Result<()>;
    fn stream_off(&mut self) -> io::Result<()>;

    fn enum_frame_sizes(&self, format: PixelFormat) -> io::Result<Vec<(u32, u32)>>;

    /// Frames per second for the given size.
    fn frame_rate(&self, format: PixelFormat, width: u32, height: u32) -> io::Result<f32>;

    fn set_zoom(&mut self, zoom: i32) -> io::Result<()>;
}
