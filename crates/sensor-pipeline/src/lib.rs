//! sensor-pipeline: per-device acquisition loops and the coordinator that keeps them in
//! step with the devices present on the host
//!
//! Each bridged device runs one task: read a cycle of channels, normalize, encode and hand
//! the messages to the shared [`bus_publisher::Publisher`]. The [`Coordinator`] starts the
//! tasks, rescans periodically and tears loops down when devices go away.

mod error;
pub use error::{PipelineError, Result};

mod reader;
pub use reader::{ChannelReader, ChannelReading};

mod device;
pub use device::{DeviceLoop, LoopExit};

mod coordinator;
pub use coordinator::{discover_selected, Coordinator};
