//! Simulated sensor
//!
//! Serves `sim://` cameras. It speaks the same queue/dequeue protocol as a
//! real node, fills a synthetic pattern into each buffer it completes and
//! counts every call, so tests can assert how many times the pipeline touched
//! the device. Faults are injected through `SimFaults`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use tracing::{debug, trace};

use crate::capture::device::{DeviceCaps, Dequeued, FrameFormat, VideoDevice};
use crate::capture::frame::{CaptureMode, PixelFormat};
use crate::capture::memory::SlotMemory;

/// Failure knobs. All off by default.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    pub fail_open: bool,
    /// Report a capture node without streaming support.
    pub no_streaming: bool,
    pub fail_set_mode: bool,
    pub fail_set_format: bool,
    /// Grant fewer buffers than requested.
    pub short_grant: Option<u32>,
    /// Fail QUERYBUF for this buffer index.
    pub fail_query_buffer_at: Option<u32>,
    pub fail_stream_on: bool,
    /// Fail QBUF for every buffer.
    pub fail_queue: bool,
    pub fail_dequeue: bool,
    pub fail_frame_rate: bool,
    pub fail_frame_sizes: bool,
    pub fail_zoom: bool,
}

#[derive(Default)]
struct SimStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    mode_switches: AtomicUsize,
    format_sets: AtomicUsize,
    buffer_requests: AtomicUsize,
    queued: AtomicUsize,
    dequeued: AtomicUsize,
    stream_on: AtomicUsize,
    stream_off: AtomicUsize,
    zoom_sets: AtomicUsize,
    last_mode: AtomicU32,
}

/// Plain copy of the call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub opens: usize,
    pub closes: usize,
    pub mode_switches: usize,
    pub format_sets: usize,
    pub buffer_requests: usize,
    pub queued: usize,
    pub dequeued: usize,
    pub stream_on: usize,
    pub stream_off: usize,
    pub zoom_sets: usize,
}

impl SimCounters {
    /// Calls that change device streaming state.
    pub fn stream_calls(&self) -> usize {
        self.stream_on + self.stream_off
    }
}

struct SimShared {
    stats: CachePadded<SimStats>,
    faults: ArcSwap<SimFaults>,
    sizes: Vec<(u32, u32)>,
    fps: f32,
}

/// Handle to one simulated sensor. Clones share counters and faults.
#[derive(Clone)]
pub struct SimulatedSensor {
    shared: Arc<SimShared>,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(vec![(640, 480), (1280, 720), (1920, 1080), (2592, 1944)], 30.0)
    }
}

impl SimulatedSensor {
    pub fn new(sizes: Vec<(u32, u32)>, fps: f32) -> Self {
        Self {
            shared: Arc::new(SimShared {
                stats: CachePadded::new(SimStats::default()),
                faults: ArcSwap::from_pointee(SimFaults::default()),
                sizes,
                fps,
            }),
        }
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.shared.faults.store(Arc::new(faults));
    }

    pub fn clear_faults(&self) {
        self.set_faults(SimFaults::default());
    }

    pub fn counters(&self) -> SimCounters {
        let s = &self.shared.stats;
        SimCounters {
            opens: s.opens.load(Ordering::Relaxed),
            closes: s.closes.load(Ordering::Relaxed),
            mode_switches: s.mode_switches.load(Ordering::Relaxed),
            format_sets: s.format_sets.load(Ordering::Relaxed),
            buffer_requests: s.buffer_requests.load(Ordering::Relaxed),
            queued: s.queued.load(Ordering::Relaxed),
            dequeued: s.dequeued.load(Ordering::Relaxed),
            stream_on: s.stream_on.load(Ordering::Relaxed),
            stream_off: s.stream_off.load(Ordering::Relaxed),
            zoom_sets: s.zoom_sets.load(Ordering::Relaxed),
        }
    }

    /// Capture submode most recently set on the sensor.
    pub fn last_mode(&self) -> CaptureMode {
        match self.shared.stats.last_mode.load(Ordering::Relaxed) {
            1 => CaptureMode::Preview,
            2 => CaptureMode::Capture,
            3 => CaptureMode::Video,
            _ => CaptureMode::None,
        }
    }

    pub fn max_size(&self) -> (u32, u32) {
        self.shared
            .sizes
            .iter()
            .copied()
            .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h))
            .unwrap_or((0, 0))
    }

    pub(crate) fn open(&self) -> io::Result<SimulatedDevice> {
        if self.shared.faults.load().fail_open {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.shared.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(SimulatedDevice {
            shared: Arc::clone(&self.shared),
            format: FrameFormat {
                width: 640,
                height: 480,
                format: PixelFormat::Yuyv4,
            },
            granted: 0,
            queue: VecDeque::new(),
            streaming: false,
            sequence: 0,
            started: Instant::now(),
        })
    }
}

fn injected(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

pub(crate) struct SimulatedDevice {
    shared: Arc<SimShared>,
    format: FrameFormat,
    granted: u32,
    queue: VecDeque<(u32, Arc<SlotMemory>)>,
    streaming: bool,
    sequence: u32,
    started: Instant,
}

impl SimulatedDevice {
    fn faults(&self) -> Arc<SimFaults> {
        self.shared.faults.load_full()
    }

    fn clamp(&self, requested: FrameFormat) -> FrameFormat {
        let (max_w, max_h) = self
            .shared
            .sizes
            .iter()
            .copied()
            .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h))
            .unwrap_or((requested.width, requested.height));
        FrameFormat {
            width: requested.width.min(max_w),
            height: requested.height.min(max_h),
            format: requested.format,
        }
    }
}

impl VideoDevice for SimulatedDevice {
    fn query_caps(&self) -> io::Result<DeviceCaps> {
        Ok(DeviceCaps {
            driver: "camhal-sim".into(),
            card: "Simulated sensor".into(),
            video_capture: true,
            streaming: !self.faults().no_streaming,
        })
    }

    fn set_capture_mode(&mut self, mode: CaptureMode) -> io::Result<()> {
        if self.faults().fail_set_mode {
            return Err(injected(libc::EINVAL));
        }
        let stats = &self.shared.stats;
        stats.mode_switches.fetch_add(1, Ordering::Relaxed);
        stats.last_mode.store(mode.as_raw(), Ordering::Relaxed);
        Ok(())
    }

    fn get_format(&self) -> io::Result<FrameFormat> {
        Ok(self.format)
    }

    fn try_format(&self, requested: FrameFormat) -> io::Result<FrameFormat> {
        Ok(self.clamp(requested))
    }

    fn set_format(&mut self, requested: FrameFormat) -> io::Result<FrameFormat> {
        if self.faults().fail_set_format {
            return Err(injected(libc::EINVAL));
        }
        if self.streaming || self.granted > 0 {
            return Err(injected(libc::EBUSY));
        }
        self.shared.stats.format_sets.fetch_add(1, Ordering::Relaxed);
        self.format = self.clamp(requested);
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(injected(libc::EBUSY));
        }
        self.shared
            .stats
            .buffer_requests
            .fetch_add(1, Ordering::Relaxed);
        self.queue.clear();
        self.granted = match self.faults().short_grant {
            Some(limit) if count > 0 => count.min(limit),
            _ => count,
        };
        Ok(self.granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<usize> {
        if index >= self.granted || self.faults().fail_query_buffer_at == Some(index) {
            return Err(injected(libc::EINVAL));
        }
        Ok(self
            .format
            .format
            .frame_size(self.format.width, self.format.height))
    }

    fn queue_buffer(&mut self, index: u32, memory: &Arc<SlotMemory>) -> io::Result<()> {
        if self.faults().fail_queue {
            return Err(injected(libc::EIO));
        }
        if index >= self.granted || self.queue.iter().any(|(i, _)| *i == index) {
            return Err(injected(libc::EINVAL));
        }
        self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.queue.push_back((index, Arc::clone(memory)));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        if !self.streaming {
            return Err(injected(libc::EINVAL));
        }
        if self.faults().fail_dequeue {
            return Err(injected(libc::EIO));
        }
        let Some((index, memory)) = self.queue.pop_front() else {
            return Err(injected(libc::EAGAIN));
        };

        let used = self
            .format
            .format
            .frame_size(self.format.width, self.format.height)
            .min(memory.len());
        let fill = (self.sequence % 251) as u8;
        // SAFETY: the buffer was queued to this device until the pop above;
        // nobody else writes to it until it is handed out.
        unsafe { memory.as_mut_slice()[..used].fill(fill) };

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.shared.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        trace!("sim dequeue index {} seq {}", index, sequence);

        Ok(Dequeued {
            index,
            bytes_used: used as u32,
            sequence,
            timestamp: Some(self.started.elapsed()),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.faults().fail_stream_on {
            return Err(injected(libc::EIO));
        }
        self.shared.stats.stream_on.fetch_add(1, Ordering::Relaxed);
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.shared.stats.stream_off.fetch_add(1, Ordering::Relaxed);
        self.streaming = false;
        self.queue.clear();
        Ok(())
    }

    fn enum_frame_sizes(&self, _format: PixelFormat) -> io::Result<Vec<(u32, u32)>> {
        if self.faults().fail_frame_sizes {
            return Err(injected(libc::EINVAL));
        }
        Ok(self.shared.sizes.clone())
    }

    fn frame_rate(&self, _format: PixelFormat, _width: u32, _height: u32) -> io::Result<f32> {
        if self.faults().fail_frame_rate {
            return Err(injected(libc::EINVAL));
        }
        Ok(self.shared.fps)
    }

    fn set_zoom(&mut self, zoom: i32) -> io::Result<()> {
        if self.faults().fail_zoom {
            return Err(injected(libc::EINVAL));
        }
        self.shared.stats.zoom_sets.fetch_add(1, Ordering::Relaxed);
        debug!("sim zoom {}", zoom);
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shared.stats.closes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(len: usize) -> Arc<SlotMemory> {
        Arc::new(SlotMemory::allocate(len).unwrap())
    }

    #[test]
    fn dequeue_returns_buffers_in_queue_order_and_fills_them() {
        let sensor = SimulatedSensor::default();
        let mut dev = sensor.open().unwrap();
        dev.set_format(FrameFormat {
            width: 8,
            height: 2,
            format: PixelFormat::Yuyv4,
        })
        .unwrap();
        assert_eq!(dev.request_buffers(2).unwrap(), 2);
        let len = dev.query_buffer(0).unwrap();
        assert_eq!(len, 32);

        let (a, b) = (memory(len), memory(len));
        dev.queue_buffer(1, &b).unwrap();
        dev.queue_buffer(0, &a).unwrap();
        dev.stream_on().unwrap();

        assert_eq!(dev.dequeue_buffer().unwrap().index, 1);
        let second = dev.dequeue_buffer().unwrap();
        assert_eq!(second.index, 0);
        assert_eq!(second.bytes_used, 32);
        assert!(a.as_ref().iter().all(|x| *x == 1));

        let err = dev.dequeue_buffer().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));

        let c = sensor.counters();
        assert_eq!((c.queued, c.dequeued, c.stream_on), (2, 2, 1));
    }

    #[test]
    fn a_buffer_cannot_be_queued_twice() {
        let sensor = SimulatedSensor::default();
        let mut dev = sensor.open().unwrap();
        dev.request_buffers(1).unwrap();
        let mem = memory(dev.query_buffer(0).unwrap());
        dev.queue_buffer(0, &mem).unwrap();
        assert!(dev.queue_buffer(0, &mem).is_err());
    }

    #[test]
    fn short_grant_and_close_counting() {
        let sensor = SimulatedSensor::default();
        sensor.set_faults(SimFaults {
            short_grant: Some(2),
            ..Default::default()
        });
        {
            let mut dev = sensor.open().unwrap();
            assert_eq!(dev.request_buffers(4).unwrap(), 2);
            assert_eq!(dev.request_buffers(0).unwrap(), 0);
        }
        let c = sensor.counters();
        assert_eq!((c.opens, c.closes), (1, 1));
    }
}
