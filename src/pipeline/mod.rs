pub mod cancel;
pub mod pacer;
pub mod session;
pub mod stats;

pub use cancel::CancelToken;
pub use pacer::{Clock, FramePacer, MonotonicClock};
pub use session::CaptureSession;
pub use stats::{Statistics, StatsSnapshot};
