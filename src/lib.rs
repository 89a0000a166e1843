pub mod capture;
pub mod error;
pub mod pipeline;
pub mod registry;

use std::path::Path;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::frame::{BufferHandle, Frame};
pub use error::{CameraError, Status};
pub use pipeline::{CameraControl, ControlState, Parameters};
pub use registry::{CameraEntry, CameraRegistry, Facing};

/// Environment overrides look like `CAMHAL__CAPTURE__BUFFER_COUNT=6`.
const ENV_PREFIX: &str = "CAMHAL";
const ENV_SEPARATOR: &str = "__";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry entries. Empty means auto-detect.
    pub cameras: Vec<CameraEntry>,
    pub capture: CaptureConfig,
    /// Parameters in effect when the camera is opened.
    pub parameters: Parameters,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera_id: usize,
    /// Pixel format negotiated with the sensor.
    pub format: PixelFormat,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames each consumer channel holds before the coordinator treats
    /// further deliveries as declined.
    pub consumer_queue_depth: usize,
    pub enable_profiling: bool,
    pub fps_interval_ms: u64,
    pub worker_core: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            format: PixelFormat::Yuyv4,
            buffer_count: capture::manager::DEFAULT_BUFFER_COUNT,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consumer_queue_depth: 2,
            enable_profiling: false,
            fps_interval_ms: 5000,
            worker_core: None,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, CameraError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| CameraError::BadValue(format!("configuration: {}", e)))
    }

    pub fn registry(&self) -> CameraRegistry {
        if self.cameras.is_empty() {
            CameraRegistry::detect()
        } else {
            CameraRegistry::from_entries(&self.cameras)
        }
    }
}
