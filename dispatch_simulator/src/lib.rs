//! dispatch_simulator: in-memory devices implementing the dispatcher's link traits.

pub mod network_device;
pub mod serial_device;

pub use network_device::{AuthBehavior, SimCall, SimNetworkDevice};
pub use serial_device::SimSerialDevice;
