//! Camera registry
//!
//! An explicit table of the cameras this process may drive, owned by whoever
//! builds the coordinators and shared with them through an `Arc`. Entries come
//! from configuration or from scanning `/dev/video*`. Paths starting with
//! `sim://` are served by the simulated sensor.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use v4l::capability::Flags;
use v4l::Device;

use crate::capture::device::VideoDevice;
use crate::capture::sim::SimulatedSensor;
use crate::capture::v4l2::V4l2Device;
use crate::error::CameraError;

/// Upper bound on registered cameras.
pub const MAX_CAMERAS: usize = 8;

const SIM_SCHEME: &str = "sim://";
const DETECT_NODES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Back,
    Front,
}

/// Registry entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEntry {
    pub path: String,
    pub facing: Facing,
    #[serde(default)]
    pub orientation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: usize,
    pub path: String,
    pub facing: Facing,
    pub orientation: u32,
}

enum Backend {
    V4l2,
    Simulated(SimulatedSensor),
}

struct Sensor {
    info: CameraInfo,
    backend: Backend,
    claimed: AtomicBool,
}

#[derive(Default)]
pub struct CameraRegistry {
    sensors: Vec<Sensor>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration entries. Extra entries beyond
    /// `MAX_CAMERAS` are dropped with a warning.
    pub fn from_entries(entries: &[CameraEntry]) -> Self {
        let mut registry = Self::new();
        if entries.len() > MAX_CAMERAS {
            warn!(
                "{} cameras configured, only the first {} are used",
                entries.len(),
                MAX_CAMERAS
            );
        }
        for entry in entries.iter().take(MAX_CAMERAS) {
            // Cannot fail: the loop is bounded by MAX_CAMERAS.
            let _ = registry.register(entry.clone());
        }
        registry
    }

    /// Scan `/dev/video*` for nodes that can stream video capture.
    pub fn detect() -> Self {
        info!("Auto-detecting capture devices...");

        let mut registry = Self::new();
        for i in 0..DETECT_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };

            if caps.capabilities.contains(Flags::VIDEO_CAPTURE)
                && caps.capabilities.contains(Flags::STREAMING)
            {
                let facing = if registry.is_empty() {
                    Facing::Back
                } else {
                    Facing::Front
                };
                info!("Found capture device: {} - {}", path, caps.card);
                let entry = CameraEntry {
                    path,
                    facing,
                    orientation: 0,
                };
                if registry.register(entry).is_err() {
                    break;
                }
            }
        }

        registry
    }

    pub fn register(&mut self, entry: CameraEntry) -> Result<usize, CameraError> {
        let backend = if entry.path.starts_with(SIM_SCHEME) {
            Backend::Simulated(SimulatedSensor::default())
        } else {
            Backend::V4l2
        };
        self.push(entry, backend)
    }

    /// Register a simulated sensor the caller keeps a handle to, so it can
    /// inject faults and read call counters.
    pub fn register_simulated(
        &mut self,
        facing: Facing,
        orientation: u32,
        sensor: SimulatedSensor,
    ) -> Result<usize, CameraError> {
        let entry = CameraEntry {
            path: format!("{}{}", SIM_SCHEME, self.sensors.len()),
            facing,
            orientation,
        };
        self.push(entry, Backend::Simulated(sensor))
    }

    fn push(&mut self, entry: CameraEntry, backend: Backend) -> Result<usize, CameraError> {
        if self.sensors.len() >= MAX_CAMERAS {
            return Err(CameraError::BadValue(format!(
                "registry is full ({} cameras)",
                MAX_CAMERAS
            )));
        }

        let id = self.sensors.len();
        debug!("Registered camera {}: {} {:?}", id, entry.path, entry.facing);
        self.sensors.push(Sensor {
            info: CameraInfo {
                id,
                path: entry.path,
                facing: entry.facing,
                orientation: entry.orientation,
            },
            backend,
            claimed: AtomicBool::new(false),
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn camera_info(&self, id: usize) -> Result<CameraInfo, CameraError> {
        self.sensors
            .get(id)
            .map(|s| s.info.clone())
            .ok_or_else(|| CameraError::BadValue(format!("no camera with id {}", id)))
    }

    pub fn is_open(&self, id: usize) -> bool {
        self.sensors
            .get(id)
            .is_some_and(|s| s.claimed.load(Ordering::Acquire))
    }

    /// Claim camera `id` and open its node. The claim is held by the returned
    /// `OpenDevice` and released when it drops.
    pub(crate) fn open(self: &Arc<Self>, id: usize) -> Result<OpenDevice, CameraError> {
        let sensor = self
            .sensors
            .get(id)
            .ok_or_else(|| CameraError::DeviceUnavailable(format!("unknown camera id {}", id)))?;

        if sensor
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CameraError::DeviceUnavailable(format!(
                "camera {} is already open",
                id
            )));
        }
        let claim = DeviceClaim {
            registry: Arc::clone(self),
            id,
        };

        let device: Box<dyn VideoDevice> = match &sensor.backend {
            Backend::V4l2 => Box::new(
                V4l2Device::open(&sensor.info.path)
                    .map_err(|e| CameraError::from_io(&sensor.info.path, e))
                    .map_err(into_unavailable)?,
            ),
            Backend::Simulated(sim) => Box::new(
                sim.open()
                    .map_err(|e| CameraError::from_io(&sensor.info.path, e))
                    .map_err(into_unavailable)?,
            ),
        };

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::from_io("query capabilities", e))
            .map_err(into_unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.video_capture {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} doesn't support video capture",
                sensor.info.path
            )));
        }
        if !caps.streaming {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} is not a streaming device",
                sensor.info.path
            )));
        }

        Ok(OpenDevice {
            device,
            _claim: claim,
        })
    }

    fn release(&self, id: usize) {
        if let Some(sensor) = self.sensors.get(id) {
            sensor.claimed.store(false, Ordering::Release);
        }
    }
}

fn into_unavailable(err: CameraError) -> CameraError {
    match err {
        CameraError::DeviceUnavailable(_) => err,
        other => CameraError::DeviceUnavailable(other.to_string()),
    }
}

struct DeviceClaim {
    registry: Arc<CameraRegistry>,
    id: usize,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// An open device handle together with its registry claim. Dropping it
/// closes the node and frees the claim.
pub(crate) struct OpenDevice {
    pub(crate) device: Box<dyn VideoDevice>,
    _claim: DeviceClaim,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_entry(n: usize) -> CameraEntry {
        CameraEntry {
            path: format!("sim://{}", n),
            facing: if n == 0 { Facing::Back } else { Facing::Front },
            orientation: 90,
        }
    }

    #[test]
    fn entries_beyond_the_limit_are_dropped() {
        let entries: Vec<_> = (0..MAX_CAMERAS + 3).map(sim_entry).collect();
        let registry = CameraRegistry::from_entries(&entries);
        assert_eq!(registry.len(), MAX_CAMERAS);
    }

    #[test]
    fn camera_info_reports_facing_and_rejects_unknown_ids() {
        let registry = CameraRegistry::from_entries(&[sim_entry(0), sim_entry(1)]);
        let info = registry.camera_info(1).unwrap();
        assert_eq!(info.facing, Facing::Front);
        assert_eq!(info.orientation, 90);
        assert!(matches!(
            registry.camera_info(7),
            Err(CameraError::BadValue(_))
        ));
    }

    #[test]
    fn second_open_of_the_same_camera_is_refused_until_the_first_drops() {
        let registry = Arc::new(CameraRegistry::from_entries(&[sim_entry(0)]));

        let first = registry.open(0).unwrap();
        assert!(registry.is_open(0));
        assert!(matches!(
            registry.open(0),
            Err(CameraError::DeviceUnavailable(_))
        ));

        drop(first);
        assert!(!registry.is_open(0));
        assert!(registry.open(0).is_ok());
    }

    #[test]
    fn unknown_id_is_unavailable() {
        let registry = Arc::new(CameraRegistry::new());
        assert!(matches!(
            registry.open(0),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn failed_open_releases_the_claim() {
        let sensor = SimulatedSensor::default();
        sensor.set_faults(crate::capture::sim::SimFaults {
            no_streaming: true,
            ..Default::default()
        });
        let mut registry = CameraRegistry::new();
        registry
            .register_simulated(Facing::Back, 0, sensor.clone())
            .unwrap();
        let registry = Arc::new(registry);

        assert!(matches!(
            registry.open(0),
            Err(CameraError::DeviceUnavailable(_))
        ));
        assert!(!registry.is_open(0));
        assert_eq!(sensor.counters().closes, sensor.counters().opens);
    }
}
