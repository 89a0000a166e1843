use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use v4l::FourCC;

/// Frame handed to a consumer by reference to its pool slot
#[derive(Clone)]
pub struct Frame {
    /// Identity used to return the buffer
    pub handle: BufferHandle,

    /// Pixel data, borrowed from the slot memory without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the coordinator dequeued the buffer
    pub timestamp: Instant,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("handle", &self.handle)
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YUYV" => Some(PixelFormat::Yuyv4),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }

    /// Nominal frame size in bytes. Compressed formats report the
    /// uncompressed upper bound.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg => pixels * 2,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

/// Device-level capture submode.
///
/// The discriminants are the values written into the capture-mode field of
/// the streaming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    None = 0,
    Preview = 1,
    Capture = 2,
    Video = 3,
}

impl CaptureMode {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Device session counter, bumped once per successful start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

/// Identity of one delivered buffer: the pool slot, the session it was
/// dequeued in, and the delivery sequence within the manager.
///
/// Two deliveries of the same slot in the same epoch differ by `sequence`,
/// which lets late returns from an earlier cycle be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub slot: usize,
    pub epoch: Epoch,
    pub sequence: u64,
}
