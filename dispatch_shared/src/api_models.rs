//! Shared data models pushed out to the transport layer (job_added,
//! job_changed, machine_state_changed, machine_temperature_changed).

use crate::device::LinkError;
use crate::job::{JobId, JobInfo};
use crate::{Position, Temperatures};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineState {
    Disconnected,
    Unauthenticated,
    Pending,
    Idle,
    Running,
    Paused,
}

impl MachineState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, MachineState::Disconnected)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Disconnected => "DISCONNECTED",
            MachineState::Unauthenticated => "UNAUTHENTICATED",
            MachineState::Pending => "PENDING",
            MachineState::Idle => "IDLE",
            MachineState::Running => "RUNNING",
            MachineState::Paused => "PAUSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    RetriesExhausted,
    NotAuthorized,
    ConnectFailed,
    LinkClosed,
    Protocol,
    Unsupported,
    Overheat,
    Device,
    Unknown,
}

/// The machine's error code/message pair. Kept until the next successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFault {
    pub code: FaultCode,
    pub message: String,
}

impl MachineFault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_link(error: &LinkError) -> Self {
        let code = match error {
            LinkError::Timeout | LinkError::Io(_) => FaultCode::RetriesExhausted,
            LinkError::NotAuthorized(_) => FaultCode::NotAuthorized,
            LinkError::Protocol(_) => FaultCode::Protocol,
            LinkError::Unsupported(_) => FaultCode::Unsupported,
            LinkError::Overheat(_) => FaultCode::Overheat,
            LinkError::Device { .. } => FaultCode::Device,
            LinkError::Closed => FaultCode::LinkClosed,
            LinkError::BufferOverflow => FaultCode::Unknown,
        };
        Self::new(code, error.to_string())
    }

    /// Failure payload stored on jobs that die with the connection.
    pub fn to_value(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl fmt::Display for MachineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineInfo {
    pub name: String,
    pub state: MachineState,
    pub driver: String,
    pub profile: String,
    pub fault: Option<MachineFault>,
    pub temperatures: Temperatures,
    pub position: Option<Position>,
    pub current_job: Option<JobId>,
}

/// Out-of-band notifications for the transport layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum DispatchEvent {
    JobAdded(JobInfo),
    JobChanged(JobInfo),
    MachineStateChanged(MachineInfo),
    MachineTemperatureChanged {
        machine: String,
        temperatures: Temperatures,
    },
}
