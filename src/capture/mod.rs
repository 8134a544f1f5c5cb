pub mod backend;
pub mod convert;
pub mod device;
pub mod format;
pub mod frame;
pub mod pool;
pub mod stream;
pub mod synthetic;
pub mod v4l2;

pub use backend::{DeviceBackend, FormatRequest, FrameInterval, GrantedFormat};
pub use device::DeviceHandle;
pub use format::FormatNegotiator;
pub use frame::{OwnedFrame, PixelFormat, SinkFrame};
pub use pool::{BufferPool, Owner};
pub use stream::{Capture, Frame, IoMode, StreamState, StreamingController};
pub use synthetic::{SyntheticBackend, SyntheticConfig};
pub use v4l2::V4l2Backend;
