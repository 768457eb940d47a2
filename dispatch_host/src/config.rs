//! Host configuration.
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [executor]
//! max_retries = 5
//!
//! [[machines]]
//! name = "replicator"
//! kind = "serial"
//! port = "/dev/ttyACM0"
//! ```

pub use dispatch_shared::config::*;
