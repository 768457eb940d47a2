//! Link/device capability surface consumed by the machine drivers.
//!
//! Two device families:
//! - legacy serial machines, driven one command at a time through a
//!   [`SerialLink`] (text lines or structured [`ControlCall`]s);
//! - networked machines, driven through a [`NetworkClient`] that also
//!   delivers asynchronous [`Notification`]s.

use crate::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque EEPROM-style key/value blob, read and written wholesale.
pub type EepromMap = BTreeMap<String, Value>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    #[error("device input buffer is full")]
    BufferOverflow,
    #[error("link timed out")]
    Timeout,
    #[error("link I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error("device overheated: {0}")]
    Overheat(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("device error {code}: {message}")]
    Device { code: i64, message: String },
    #[error("link closed")]
    Closed,
}

/// How a link error is handled by the retry layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device queue full; expected during fast printing, retried forever.
    Backpressure,
    /// Timeouts and I/O errors; retried up to a ceiling.
    Transient,
    /// Explicit authorization refusal; never retried.
    Auth,
    /// Everything else; the connection is closed.
    Fatal,
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::BufferOverflow => ErrorClass::Backpressure,
            LinkError::Timeout | LinkError::Io(_) => ErrorClass::Transient,
            LinkError::NotAuthorized(_) => ErrorClass::Auth,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => LinkError::Timeout,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => LinkError::Closed,
            _ => LinkError::Io(e.to_string()),
        }
    }
}

// --- Legacy serial family ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotherboardFlags {
    pub preheat: bool,
    pub manual_mode: bool,
    pub onboard_script: bool,
    pub onboard_process: bool,
    pub wait_for_button: bool,
    pub build_cancelling: bool,
    pub heat_shutdown: bool,
    pub power_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    None,
    Running,
    FinishedNormally,
    Paused,
    Canceled,
    Sleeping,
}

/// Raw vendor status as reported by a legacy machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildStatus {
    pub flags: MotherboardFlags,
    pub build_state: BuildState,
}

/// Structured device call, dispatched through the same retry/lock wrapper as
/// streamed G-code lines.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    BuildStatus,
    IsFinished,
    Abort,
    Position,
    ToolTemperature(u8),
    ToolTargetTemperature(u8),
    ToolReady(u8),
    PlatformTemperature,
    PlatformTargetTemperature,
    PlatformReady,
    SerialNumber,
    ReadEeprom,
    WriteEeprom(EepromMap),
}

impl ControlCall {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCall::BuildStatus => "build_status",
            ControlCall::IsFinished => "is_finished",
            ControlCall::Abort => "abort",
            ControlCall::Position => "position",
            ControlCall::ToolTemperature(_) => "tool_temperature",
            ControlCall::ToolTargetTemperature(_) => "tool_target_temperature",
            ControlCall::ToolReady(_) => "tool_ready",
            ControlCall::PlatformTemperature => "platform_temperature",
            ControlCall::PlatformTargetTemperature => "platform_target_temperature",
            ControlCall::PlatformReady => "platform_ready",
            ControlCall::SerialNumber => "serial_number",
            ControlCall::ReadEeprom => "read_eeprom",
            ControlCall::WriteEeprom(_) => "write_eeprom",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Flag(bool),
    Temperature(f64),
    Position(Position),
    Status(BuildStatus),
    Text(String),
    Eeprom(EepromMap),
}

impl Reply {
    pub fn into_flag(self) -> Result<bool, LinkError> {
        match self {
            Reply::Flag(flag) => Ok(flag),
            other => Err(unexpected("flag", &other)),
        }
    }

    pub fn into_temperature(self) -> Result<f64, LinkError> {
        match self {
            Reply::Temperature(t) => Ok(t),
            other => Err(unexpected("temperature", &other)),
        }
    }

    pub fn into_position(self) -> Result<Position, LinkError> {
        match self {
            Reply::Position(p) => Ok(p),
            other => Err(unexpected("position", &other)),
        }
    }

    pub fn into_status(self) -> Result<BuildStatus, LinkError> {
        match self {
            Reply::Status(s) => Ok(s),
            other => Err(unexpected("build status", &other)),
        }
    }

    pub fn into_text(self) -> Result<String, LinkError> {
        match self {
            Reply::Text(s) => Ok(s),
            other => Err(unexpected("text", &other)),
        }
    }

    pub fn into_eeprom(self) -> Result<EepromMap, LinkError> {
        match self {
            Reply::Eeprom(map) => Ok(map),
            other => Err(unexpected("eeprom map", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Reply) -> LinkError {
    LinkError::Protocol(format!("expected {} reply, got {:?}", expected, got))
}

#[async_trait]
pub trait SerialLink: Send + Sync {
    fn port(&self) -> &str;
    /// Send one line of G-code; returns once the device accepted it.
    async fn send_line(&self, line: &str) -> Result<(), LinkError>;
    async fn control(&self, call: &ControlCall) -> Result<Reply, LinkError>;
}

#[async_trait]
pub trait SerialConnector: Send + Sync {
    fn port(&self) -> &str;
    async fn open(&self) -> Result<Arc<dyn SerialLink>, LinkError>;
}

// --- Networked family ---

pub type ProcessId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFailure {
    pub code: i64,
    pub message: String,
}

fn default_true() -> bool {
    true
}

/// One process as summarized in a system notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub id: ProcessId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<ProcessFailure>,
    #[serde(default = "default_true")]
    pub can_cancel: bool,
}

impl ProcessSummary {
    pub fn new(id: ProcessId, name: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            step: step.into(),
            paused: false,
            cancelled: false,
            complete: false,
            progress: None,
            error: None,
            can_cancel: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Running,
    Paused,
    #[serde(other)]
    Unknown,
}

/// Aggregate snapshot: machine-level state plus every current/suspended process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotification {
    pub machine_state: DeviceState,
    #[serde(default)]
    pub current_process: Option<ProcessSummary>,
    #[serde(default)]
    pub suspended_processes: Vec<ProcessSummary>,
    #[serde(default)]
    pub tool_temperatures: Vec<f64>,
}

impl SystemNotification {
    pub fn idle() -> Self {
        Self {
            machine_state: DeviceState::Idle,
            current_process: None,
            suspended_processes: Vec::new(),
            tool_temperatures: Vec::new(),
        }
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessSummary> {
        self.current_process.iter().chain(self.suspended_processes.iter())
    }
}

/// Delta: one object's state or step changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateNotification {
    #[serde(default)]
    pub process_id: Option<ProcessId>,
    #[serde(default)]
    pub machine_state: Option<DeviceState>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub paused: Option<bool>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<ProcessFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Notification {
    SystemNotification(SystemNotification),
    StateNotification(StateNotification),
}

/// Work a networked machine runs as a device-side process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessRequest {
    Print { path: String },
    LoadFilament { tool: u8 },
    UnloadFilament { tool: u8 },
    Preheat { temperatures: Vec<f64> },
    ZipLogs { path: String },
    FirmwareUpload { path: String },
    Calibrate,
    Home,
    Jog { axis: crate::Axis, distance: f64, feedrate: f64 },
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), LinkError>;
    /// Initial snapshot fetched once the session is authenticated.
    async fn handshake(&self) -> Result<SystemNotification, LinkError>;
    async fn reserve_process_id(&self) -> Result<ProcessId, LinkError>;
    async fn start_process(&self, id: ProcessId, request: &ProcessRequest) -> Result<(), LinkError>;
    async fn pause(&self, id: ProcessId) -> Result<(), LinkError>;
    async fn resume(&self, id: ProcessId) -> Result<(), LinkError>;
    async fn cancel(&self, id: ProcessId) -> Result<(), LinkError>;
    async fn read_eeprom(&self) -> Result<EepromMap, LinkError>;
    async fn write_eeprom(&self, values: &EepromMap) -> Result<(), LinkError>;
    async fn close(&self);
}

pub struct NetworkSession {
    pub client: Arc<dyn NetworkClient>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
pub trait NetworkConnector: Send + Sync {
    fn address(&self) -> &str;
    async fn open(&self) -> Result<NetworkSession, LinkError>;
}
