//! Device links: the serial command executor and the concrete transports.

pub mod executor;
pub mod serial;
pub mod tcp;
