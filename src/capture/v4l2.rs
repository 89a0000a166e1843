//! Video4Linux2 node driven in user-pointer streaming mode

use std::io;
use std::mem;
use std::os::raw::{c_ulong, c_void};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::fraction::Fraction;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_format, v4l2_requestbuffers, v4l2_streamparm};
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::capture::device::{DeviceCaps, Dequeued, FrameFormat, VideoDevice};
use crate::capture::frame::{CaptureMode, PixelFormat};
use crate::capture::memory::SlotMemory;

const V4L2_CID_ZOOM_ABSOLUTE: u32 = 0x009a_090d;

/// Issue an ioctl, retrying when interrupted by a signal.
///
/// # Safety
///
/// `arg` must point to the structure `request` expects.
unsafe fn xioctl(fd: i32, request: vidioc::_IOC_TYPE, arg: *mut c_void) -> io::Result<()> {
    loop {
        match v4l2::ioctl(fd, request, arg) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn raw_fourcc(format: PixelFormat) -> u32 {
    u32::from_le_bytes(format.fourcc().repr)
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_string())
}

/// Frames per second for the shortest of `intervals`. Zero intervals are
/// skipped.
fn highest_rate(intervals: impl IntoIterator<Item = Fraction>) -> Option<f32> {
    intervals
        .into_iter()
        .filter(|f| f.numerator > 0)
        .map(|f| f.denominator as f32 / f.numerator as f32)
        .reduce(f32::max)
}

pub struct V4l2Device {
    device: Device,
}

impl V4l2Device {
    pub fn open(path: &str) -> io::Result<Self> {
        info!("Opening V4L2 device: {}", path);
        let device = Device::with_path(path)?;
        Ok(Self { device })
    }

    fn fd(&self) -> i32 {
        self.device.handle().fd()
    }

    /// Block until the node signals a completed buffer.
    fn wait_readable(&self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pfd is a valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl VideoDevice for V4l2Device {
    fn query_caps(&self) -> io::Result<DeviceCaps> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCaps {
            driver: caps.driver,
            card: caps.card,
            video_capture: caps.capabilities.contains(CapFlags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(CapFlags::STREAMING),
        })
    }

    fn set_capture_mode(&mut self, mode: CaptureMode) -> io::Result<()> {
        debug!("Setting capture mode {:?}", mode);
        // SAFETY: v4l2_streamparm is plain data; the union member written is
        // the one selected by the capture buffer type.
        unsafe {
            let mut parm: v4l2_streamparm = mem::zeroed();
            parm.type_ = Type::VideoCapture as u32;
            xioctl(
                self.fd(),
                vidioc::VIDIOC_G_PARM,
                &mut parm as *mut _ as *mut c_void,
            )?;
            parm.parm.capture.capturemode = mode.as_raw();
            xioctl(
                self.fd(),
                vidioc::VIDIOC_S_PARM,
                &mut parm as *mut _ as *mut c_void,
            )
        }
    }

    fn get_format(&self) -> io::Result<FrameFormat> {
        let fmt = self.device.format()?;
        let format = PixelFormat::from_fourcc(fmt.fourcc)
            .ok_or_else(|| unsupported("device pixel format"))?;
        Ok(FrameFormat {
            width: fmt.width,
            height: fmt.height,
            format,
        })
    }

    fn try_format(&self, requested: FrameFormat) -> io::Result<FrameFormat> {
        // SAFETY: v4l2_format is plain data; pix is the member used by the
        // capture buffer type.
        let (width, height, fourcc) = unsafe {
            let mut fmt: v4l2_format = mem::zeroed();
            fmt.type_ = Type::VideoCapture as u32;
            fmt.fmt.pix.width = requested.width;
            fmt.fmt.pix.height = requested.height;
            fmt.fmt.pix.pixelformat = raw_fourcc(requested.format);
            xioctl(
                self.fd(),
                vidioc::VIDIOC_TRY_FMT,
                &mut fmt as *mut _ as *mut c_void,
            )?;
            (fmt.fmt.pix.width, fmt.fmt.pix.height, fmt.fmt.pix.pixelformat)
        };

        let format = PixelFormat::from_fourcc(FourCC::new(&fourcc.to_le_bytes()))
            .unwrap_or(requested.format);
        Ok(FrameFormat {
            width,
            height,
            format,
        })
    }

    fn set_format(&mut self, requested: FrameFormat) -> io::Result<FrameFormat> {
        let fmt = Format::new(requested.width, requested.height, requested.format.fourcc());
        let actual = self.device.set_format(&fmt)?;

        if actual.width != requested.width || actual.height != requested.height {
            info!(
                "Device adjusted {}x{} to {}x{}",
                requested.width, requested.height, actual.width, actual.height
            );
        }

        let format = PixelFormat::from_fourcc(actual.fourcc)
            .ok_or_else(|| unsupported("negotiated pixel format"))?;
        Ok(FrameFormat {
            width: actual.width,
            height: actual.height,
            format,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: v4l2_requestbuffers is plain data.
        unsafe {
            let mut req: v4l2_requestbuffers = mem::zeroed();
            req.count = count;
            req.type_ = Type::VideoCapture as u32;
            req.memory = Memory::UserPtr as u32;
            xioctl(
                self.fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )?;
            Ok(req.count)
        }
    }

    fn query_buffer(&self, index: u32) -> io::Result<usize> {
        // SAFETY: v4l2_buffer is plain data.
        unsafe {
            let mut buf: v4l2_buffer = mem::zeroed();
            buf.index = index;
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::UserPtr as u32;
            xioctl(
                self.fd(),
                vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut _ as *mut c_void,
            )?;
            Ok(buf.length as usize)
        }
    }

    fn queue_buffer(&mut self, index: u32, memory: &Arc<SlotMemory>) -> io::Result<()> {
        // SAFETY: the slot memory stays allocated while the pool holds its
        // Arc, which outlives the buffer's time in the driver queue.
        unsafe {
            let mut buf: v4l2_buffer = mem::zeroed();
            buf.index = index;
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::UserPtr as u32;
            buf.m.userptr = memory.as_ptr() as c_ulong;
            buf.length = memory.len() as u32;
            xioctl(
                self.fd(),
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        self.wait_readable()?;

        // SAFETY: v4l2_buffer is plain data.
        let buf = unsafe {
            let mut buf: v4l2_buffer = mem::zeroed();
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::UserPtr as u32;
            xioctl(
                self.fd(),
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )?;
            buf
        };

        let timestamp = if buf.timestamp.tv_sec > 0 || buf.timestamp.tv_usec > 0 {
            Some(
                Duration::from_secs(buf.timestamp.tv_sec as u64)
                    + Duration::from_micros(buf.timestamp.tv_usec as u64),
            )
        } else {
            None
        };

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: STREAMON takes a pointer to the buffer type.
        unsafe {
            xioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMON,
                &mut typ as *mut _ as *mut c_void,
            )
        }
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: STREAMOFF takes a pointer to the buffer type.
        unsafe {
            xioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut _ as *mut c_void,
            )
        }
    }

    fn enum_frame_sizes(&self, format: PixelFormat) -> io::Result<Vec<(u32, u32)>> {
        let sizes = self.device.enum_framesizes(format.fourcc())?;
        Ok(sizes
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => (d.width, d.height),
                FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
            })
            .collect())
    }

    fn frame_rate(&self, format: PixelFormat, width: u32, height: u32) -> io::Result<f32> {
        let intervals = self
            .device
            .enum_frameintervals(format.fourcc(), width, height)?;
        highest_rate(intervals.iter().map(|interval| match &interval.interval {
            FrameIntervalEnum::Discrete(f) => *f,
            FrameIntervalEnum::Stepwise(s) => s.min,
        }))
        .ok_or_else(|| unsupported("no usable frame intervals"))
    }

    fn set_zoom(&mut self, zoom: i32) -> io::Result<()> {
        self.device.set_control(Control {
            id: V4L2_CID_ZOOM_ABSOLUTE,
            value: Value::Integer(i64::from(zoom)),
        })
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        debug!("Closing V4L2 device fd {}", self.fd());
    }
}
