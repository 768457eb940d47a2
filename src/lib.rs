//! Job and device dispatch for 3D printers: the shared model, the host
//! runtime and the in-memory simulator, re-exported under one crate.

pub use dispatch_host as host;
pub use dispatch_shared as shared;
pub use dispatch_simulator as simulator;
