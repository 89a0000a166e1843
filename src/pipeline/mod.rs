pub mod consumer;
pub mod control;
pub mod coordinator;
pub mod coupling;
pub mod fps;
pub mod mailbox;
pub mod params;
pub mod stats;

pub use consumer::{BufferReturns, ChannelSink, Consumers, Delivery, FrameSink, NullSink};
pub use control::CameraControl;
pub use coordinator::ControlState;
pub use params::{FrameLimits, Parameters, Size};
