//! Camera parameters as seen by the coordinator
//!
//! Values arrive pre-validated from the external parameter layer; only
//! structural checks happen here. Sizes and the preview format are static
//! (they need a device restart), zoom is applied live, the rest is stored for
//! the external stages.

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::error::CameraError;
use crate::registry::Facing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp each dimension to `max`.
    pub fn clamp_to(self, max: Size) -> Size {
        Size::new(self.width.min(max.width), self.height.min(max.height))
    }

    fn exceeds(self, other: Size) -> bool {
        self.width > other.width || self.height > other.height
    }
}

const SIZE_1080P: Size = Size::new(1920, 1080);

/// Largest sizes the sensor accepts per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub preview: Size,
    pub video: Size,
    pub picture: Size,
}

impl FrameLimits {
    /// Static limits used when the sensor can't be queried.
    pub fn for_facing(facing: Facing) -> Self {
        match facing {
            Facing::Back | Facing::Front => Self {
                preview: SIZE_1080P,
                video: SIZE_1080P,
                picture: SIZE_1080P,
            },
        }
    }

    /// Static preview and video limits with a queried still size.
    pub fn with_picture(facing: Facing, picture: Size) -> Self {
        Self {
            picture,
            ..Self::for_facing(facing)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusMode {
    #[default]
    Auto,
    Infinity,
    Macro,
    ContinuousVideo,
    ContinuousPicture,
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteBalance {
    #[default]
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
    CloudyDaylight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SceneMode {
    #[default]
    Auto,
    Portrait,
    Sports,
    Landscape,
    Night,
    NightPortrait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashMode {
    #[default]
    Off,
    Auto,
    On,
    Torch,
}

/// Rectangle in the (-1000, -1000)..(1000, 1000) sensor space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraWindow {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub weight: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub preview_size: Size,
    pub video_size: Size,
    pub picture_size: Size,
    pub preview_format: PixelFormat,
    pub recording_hint: bool,
    pub zoom: i32,
    pub focus_mode: FocusMode,
    pub white_balance: WhiteBalance,
    pub scene_mode: SceneMode,
    pub flash_mode: FlashMode,
    pub exposure_compensation: i32,
    pub focus_areas: Vec<CameraWindow>,
    pub metering_areas: Vec<CameraWindow>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            preview_size: Size::new(640, 480),
            video_size: Size::new(1920, 1080),
            picture_size: Size::new(1920, 1080),
            preview_format: PixelFormat::Nv12,
            recording_hint: false,
            zoom: 0,
            focus_mode: FocusMode::default(),
            white_balance: WhiteBalance::default(),
            scene_mode: SceneMode::default(),
            flash_mode: FlashMode::default(),
            exposure_compensation: 0,
            focus_areas: Vec::new(),
            metering_areas: Vec::new(),
        }
    }
}

/// What changed between two parameter sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterChanges {
    /// A change that needs the device restarted.
    pub restart: bool,
    pub zoom: bool,
    /// Anything stored for the external stages.
    pub other: bool,
}

impl ParameterChanges {
    pub fn is_empty(&self) -> bool {
        !(self.restart || self.zoom || self.other)
    }
}

impl Parameters {
    /// Structural checks only: every size must be non-zero.
    pub fn validate(&self) -> Result<(), CameraError> {
        for (name, size) in [
            ("preview", self.preview_size),
            ("video", self.video_size),
            ("picture", self.picture_size),
        ] {
            if size.width == 0 || size.height == 0 {
                return Err(CameraError::BadValue(format!(
                    "{} size {}x{}",
                    name, size.width, size.height
                )));
            }
        }
        Ok(())
    }

    pub fn diff(&self, new: &Parameters) -> ParameterChanges {
        ParameterChanges {
            restart: self.preview_size != new.preview_size
                || self.video_size != new.video_size
                || self.preview_format != new.preview_format,
            zoom: self.zoom != new.zoom,
            // Picture size is read when the picture is taken.
            other: self.picture_size != new.picture_size
                || self.recording_hint != new.recording_hint
                || self.focus_mode != new.focus_mode
                || self.white_balance != new.white_balance
                || self.scene_mode != new.scene_mode
                || self.flash_mode != new.flash_mode
                || self.exposure_compensation != new.exposure_compensation
                || self.focus_areas != new.focus_areas
                || self.metering_areas != new.metering_areas,
        }
    }

    /// In video modes the preview can't be larger than the video stream.
    /// Returns true if the preview size was overridden.
    pub fn fit_preview_to_video(&mut self) -> bool {
        if self.preview_size.exceeds(self.video_size) {
            self.preview_size = self.video_size;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_and_format_changes_need_a_restart() {
        let base = Parameters::default();

        let mut new = base.clone();
        new.video_size = Size::new(1280, 720);
        assert!(base.diff(&new).restart);

        let mut new = base.clone();
        new.picture_size = Size::new(2592, 1944);
        let changes = base.diff(&new);
        assert!(!changes.restart);
        assert!(changes.other);

        let mut new = base.clone();
        new.preview_format = PixelFormat::Yuyv4;
        assert!(base.diff(&new).restart);
    }

    #[test]
    fn zoom_and_enums_are_live() {
        let base = Parameters::default();
        let mut new = base.clone();
        new.zoom = 4;
        new.white_balance = WhiteBalance::Daylight;

        let changes = base.diff(&new);
        assert!(!changes.restart);
        assert!(changes.zoom);
        assert!(changes.other);
        assert!(base.diff(&base).is_empty());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut params = Parameters::default();
        params.video_size = Size::new(1280, 0);
        assert!(matches!(params.validate(), Err(CameraError::BadValue(_))));
    }

    #[test]
    fn preview_is_fitted_to_video() {
        let mut params = Parameters {
            preview_size: Size::new(1920, 1080),
            video_size: Size::new(1280, 720),
            ..Default::default()
        };
        assert!(params.fit_preview_to_video());
        assert_eq!(params.preview_size, Size::new(1280, 720));
        assert!(!params.fit_preview_to_video());
    }
}
