pub mod device;
pub mod frame;
pub mod manager;
pub mod memory;
pub mod sim;
pub mod v4l2;

pub use device::{FrameFormat, VideoDevice};
pub use frame::{BufferHandle, CaptureMode, Epoch, Frame, PixelFormat};
pub use manager::{BufferManager, DeviceState};
pub use sim::{SimFaults, SimulatedSensor};
