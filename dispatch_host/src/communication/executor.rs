//! Bounded-retry command executor for one serial connection.
//!
//! Every command sent to a device, streamed G-code or structured control
//! call, goes through [`CommandExecutor::execute`]. The execution lock is held
//! for exactly one device round trip. Device backpressure is retried without
//! limit (the caller stops it through the machine's stop signal), transient
//! link errors are retried up to `max_retries`, anything else faults the
//! machine immediately.

use crate::machine::base::{MachineCore, StopSignal};
use dispatch_shared::api_models::{FaultCode, MachineFault};
use dispatch_shared::config::ExecutorConfig;
use dispatch_shared::device::{ControlCall, ErrorClass, LinkError, Reply, SerialLink};
use dispatch_shared::gcode_utils::parse_temperature_command;
use dispatch_shared::{Heater, HeaterReading, Temperatures};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Line(String),
    Control(ControlCall),
}

impl Command {
    pub fn line(line: impl Into<String>) -> Self {
        Command::Line(line.into())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Line(line) => f.write_str(line),
            Command::Control(call) => write!(f, "<{}>", call.name()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecuteError {
    #[error("machine is stopping")]
    Stopped,
    #[error("machine fault: {0}")]
    Fatal(MachineFault),
}

pub struct CommandExecutor {
    link: Arc<dyn SerialLink>,
    core: Arc<MachineCore>,
    stop: StopSignal,
    settings: ExecutorConfig,
    lock: tokio::sync::Mutex<()>,
    overflows: AtomicU64,
    retries: AtomicU64,
    last_command: Mutex<Option<String>>,
}

impl CommandExecutor {
    /// Binds to the connection's current stop signal.
    pub fn new(link: Arc<dyn SerialLink>, core: Arc<MachineCore>, settings: ExecutorConfig) -> Self {
        Self {
            link,
            stop: core.stop(),
            core,
            settings,
            lock: tokio::sync::Mutex::new(()),
            overflows: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_command: Mutex::new(None),
        }
    }

    pub fn link(&self) -> &Arc<dyn SerialLink> {
        &self.link
    }

    pub fn stop(&self) -> &StopSignal {
        &self.stop
    }

    /// Buffer overflows absorbed over the life of the connection.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Transient failures retried over the life of the connection.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn last_command(&self) -> Option<String> {
        self.last_command.lock().clone()
    }

    pub async fn execute(&self, command: &Command) -> Result<Reply, ExecuteError> {
        let stop = &self.stop;
        let mut consecutive_overflows: u32 = 0;
        let mut attempts: u32 = 0;
        loop {
            if stop.is_set() {
                return Err(ExecuteError::Stopped);
            }
            let outcome = {
                let _guard = self.lock.lock().await;
                *self.last_command.lock() = Some(command.to_string());
                match command {
                    Command::Line(line) => self.link.send_line(line).await.map(|_| Reply::Unit),
                    Command::Control(call) => self.link.control(call).await,
                }
            };
            let error = match outcome {
                Ok(reply) => {
                    if let Command::Line(line) = command {
                        tracing::debug!(machine = %self.core.name(), "sent: {}", line);
                        if let Some((heater, celsius)) = parse_temperature_command(line) {
                            self.core.set_target_temperature(heater, celsius);
                        }
                    }
                    return Ok(reply);
                }
                Err(e) => e,
            };
            match error.class() {
                ErrorClass::Backpressure => {
                    consecutive_overflows += 1;
                    self.overflows.fetch_add(1, Ordering::Relaxed);
                    if consecutive_overflows % self.settings.overflow_probe_threshold.max(1) == 0 {
                        self.probe_status(consecutive_overflows).await?;
                    }
                    stop.sleep(self.settings.overflow_backoff()).await;
                }
                ErrorClass::Transient => {
                    attempts += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    if attempts > self.settings.max_retries {
                        let fault = MachineFault::new(
                            FaultCode::RetriesExhausted,
                            format!("gave up on '{}' after {} retries: {}", command, self.settings.max_retries, error),
                        );
                        return Err(self.escalate(fault));
                    }
                    tracing::warn!(
                        machine = %self.core.name(),
                        attempt = attempts,
                        "retrying '{}' after link error: {}",
                        command,
                        error
                    );
                }
                ErrorClass::Auth | ErrorClass::Fatal => {
                    return Err(self.escalate(MachineFault::from_link(&error)));
                }
            }
        }
    }

    /// Run a control call and convert its reply. A reply of the wrong shape is
    /// a protocol fault.
    pub async fn call<T>(
        &self,
        call: ControlCall,
        convert: fn(Reply) -> Result<T, LinkError>,
    ) -> Result<T, ExecuteError> {
        let reply = self.execute(&Command::Control(call)).await?;
        convert(reply).map_err(|e| self.escalate(MachineFault::from_link(&e)))
    }

    /// Read temperatures, targets, readiness and position into the machine status.
    pub async fn refresh_telemetry(&self) -> Result<(), ExecuteError> {
        let profile = self.core.profile();
        let mut temperatures = Temperatures::for_layout(profile.tool_count, profile.heated_platform);
        for tool in 0..profile.tool_count {
            let reading = HeaterReading {
                current: self.call(ControlCall::ToolTemperature(tool), Reply::into_temperature).await?,
                target: self.call(ControlCall::ToolTargetTemperature(tool), Reply::into_temperature).await?,
                ready: self.call(ControlCall::ToolReady(tool), Reply::into_flag).await?,
            };
            if let Some(slot) = temperatures.reading_mut(Heater::Tool(tool)) {
                *slot = reading;
            }
        }
        if profile.heated_platform {
            let reading = HeaterReading {
                current: self.call(ControlCall::PlatformTemperature, Reply::into_temperature).await?,
                target: self.call(ControlCall::PlatformTargetTemperature, Reply::into_temperature).await?,
                ready: self.call(ControlCall::PlatformReady, Reply::into_flag).await?,
            };
            temperatures.platform = Some(reading);
        }
        self.core.update_temperatures(temperatures);
        let position = self.call(ControlCall::Position, Reply::into_position).await?;
        self.core.set_position(position);
        Ok(())
    }

    /// Diagnostic status read while the device keeps refusing input. Probe
    /// failures are logged only; a reported heater or power shutdown faults
    /// the machine.
    async fn probe_status(&self, overflows: u32) -> Result<(), ExecuteError> {
        tracing::warn!(machine = %self.core.name(), overflows, "device buffer still full, probing status");
        let status = {
            let _guard = self.lock.lock().await;
            self.link.control(&ControlCall::BuildStatus).await
        };
        match status.and_then(Reply::into_status) {
            Ok(status) if status.flags.heat_shutdown || status.flags.power_error => {
                let fault = MachineFault::new(
                    FaultCode::Overheat,
                    format!("device halted while buffer was full: {:?}", status.flags),
                );
                Err(self.escalate(fault))
            }
            Ok(status) => {
                tracing::debug!(machine = %self.core.name(), ?status, "overflow probe");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(machine = %self.core.name(), "overflow probe failed: {}", e);
                Ok(())
            }
        }
    }

    fn escalate(&self, fault: MachineFault) -> ExecuteError {
        if self.stop.is_set() {
            // The connection is already gone; the failure is not the machine's.
            tracing::debug!(machine = %self.core.name(), "ignoring fault after stop: {}", fault);
            return ExecuteError::Stopped;
        }
        if let Some(last) = self.last_command() {
            tracing::error!(machine = %self.core.name(), "last command before fault: {}", last);
        }
        self.core.record_fault(fault.clone());
        ExecuteError::Fatal(fault)
    }
}
