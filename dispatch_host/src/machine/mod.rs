//! Host-side model of a connected device.
//!
//! Both families expose the same [`Machine`] surface. They differ in how
//! device state flows back in: the serial family polls ([`poll`]), the
//! network family is pushed notifications ([`push`]).

pub mod base;
pub mod network;
pub mod poll;
pub mod push;
pub mod reconcile;
pub mod serial;

use crate::communication::executor::ExecuteError;
use async_trait::async_trait;
use dispatch_shared::api_models::{MachineInfo, MachineState};
use dispatch_shared::device::{EepromMap, LinkError};
use dispatch_shared::job::{Job, JobError, JobId, JobOrigin};
use dispatch_shared::Axis;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use self::network::NetworkMachine;
pub use self::serial::SerialMachine;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("cannot {operation} while machine is {state}")]
    InvalidState {
        state: MachineState,
        operation: &'static str,
    },
    #[error("job {0} is already in progress on this machine")]
    OperationInFlight(JobId),
    #[error("operation not supported by this machine: {0}")]
    Unsupported(&'static str),
    #[error("machine is not connected")]
    NotConnected,
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Machine: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> MachineState;
    fn info(&self) -> MachineInfo;
    fn origin(&self) -> Arc<dyn JobOrigin>;
    fn serial_number(&self) -> Option<String>;
    async fn wait_for_state(&self, state: MachineState, timeout: Duration) -> bool;

    async fn connect(&self) -> Result<(), MachineError>;
    async fn disconnect(&self) -> Result<(), MachineError>;

    /// Stream `lines`, driving `job` (or a new print job) through its lifecycle.
    async fn print(&self, lines: Vec<String>, job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError>;
    async fn print_from_file(&self, path: &Path, job: Option<Arc<Job>>) -> Result<Arc<Job>, MachineError>;
    async fn pause(&self) -> Result<(), MachineError>;
    async fn unpause(&self) -> Result<(), MachineError>;
    async fn cancel(&self) -> Result<(), MachineError>;

    async fn jog(&self, axis: Axis, distance: f64, feedrate: f64) -> Result<Arc<Job>, MachineError>;
    async fn home(&self) -> Result<Arc<Job>, MachineError>;
    async fn calibrate(&self) -> Result<Arc<Job>, MachineError>;
    async fn preheat(&self, temperatures: Vec<f64>) -> Result<Arc<Job>, MachineError>;
    async fn load_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError>;
    async fn unload_filament(&self, tool: u8) -> Result<Arc<Job>, MachineError>;

    async fn read_eeprom(&self) -> Result<EepromMap, MachineError>;
    async fn write_eeprom(&self, values: EepromMap) -> Result<(), MachineError>;
    async fn upload_firmware(&self, image: &Path) -> Result<Arc<Job>, MachineError>;

    async fn zip_logs(&self, _path: &Path) -> Result<Arc<Job>, MachineError> {
        Err(MachineError::Unsupported("zip_logs"))
    }
}
