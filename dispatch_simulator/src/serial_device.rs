//! Scriptable legacy serial device.
//!
//! Tracks motion and heater targets from the G-code it accepts, answers
//! control calls from that state, and lets a test inject link failures.

use async_trait::async_trait;
use dispatch_shared::device::{
    BuildStatus, ControlCall, EepromMap, LinkError, Reply, SerialConnector, SerialLink,
};
use dispatch_shared::gcode_utils::{parse_gcode_line, parse_temperature_command, strip_comment};
use dispatch_shared::{Heater, Position};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Temperature within which a heater reports ready.
const READY_WINDOW: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default)]
struct SimHeater {
    current: f64,
    target: f64,
}

impl SimHeater {
    fn ambient() -> Self {
        Self {
            current: 22.0,
            target: 0.0,
        }
    }

    /// Move halfway to the target with a little sensor noise.
    fn sample(&mut self) -> f64 {
        let goal = if self.target > 0.0 { self.target } else { 22.0 };
        let noise: f64 = rand::rng().random_range(-0.2..0.2);
        self.current += (goal - self.current) * 0.5 + noise;
        self.current
    }

    fn ready(&self) -> bool {
        self.target <= 0.0 || (self.target - self.current).abs() <= READY_WINDOW
    }
}

#[derive(Debug)]
struct Injected {
    error: LinkError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

fn take_failure(slot: &mut Option<Injected>) -> Option<LinkError> {
    let (error, exhausted) = {
        let injected = slot.as_mut()?;
        let exhausted = match injected.remaining {
            None => false,
            Some(n) if n <= 1 => true,
            Some(n) => {
                injected.remaining = Some(n - 1);
                false
            }
        };
        (injected.error.clone(), exhausted)
    };
    if exhausted {
        *slot = None;
    }
    Some(error)
}

#[derive(Debug)]
struct SerialState {
    sent: Vec<String>,
    controls: Vec<&'static str>,
    line_attempts: u64,
    control_attempts: u64,
    line_failure: Option<Injected>,
    control_failure: Option<Injected>,
    open_failure: Option<LinkError>,
    opens: u32,
    line_delay: Duration,
    position: Position,
    relative: bool,
    status: BuildStatus,
    finished: bool,
    serial: Option<String>,
    tools: Vec<SimHeater>,
    platform: Option<SimHeater>,
    eeprom: EepromMap,
}

impl SerialState {
    fn accept(&mut self, line: &str) {
        let code = strip_comment(line);
        match code.split_whitespace().next() {
            Some("G90") => self.relative = false,
            Some("G91") => self.relative = true,
            Some("G0") | Some("G1") => {
                if self.relative {
                    let delta = parse_gcode_line(code, &Position::default());
                    self.position.x += delta.x;
                    self.position.y += delta.y;
                    self.position.z += delta.z;
                    self.position.e += delta.e;
                } else {
                    self.position = parse_gcode_line(code, &self.position);
                }
            }
            Some("G28") => {
                self.position.x = 0.0;
                self.position.y = 0.0;
                self.position.z = 0.0;
            }
            _ => {}
        }
        if let Some((heater, celsius)) = parse_temperature_command(code) {
            if let Some(h) = self.heater(heater) {
                h.target = celsius;
            }
        }
    }

    fn heater(&mut self, heater: Heater) -> Option<&mut SimHeater> {
        match heater {
            Heater::Tool(tool) => self.tools.get_mut(tool as usize),
            Heater::Platform => self.platform.as_mut(),
        }
    }

    fn answer(&mut self, call: &ControlCall) -> Result<Reply, LinkError> {
        let missing = |what: &str| LinkError::Unsupported(format!("simulated device has no {}", what));
        let reply = match call {
            ControlCall::BuildStatus => Reply::Status(self.status),
            ControlCall::IsFinished => Reply::Flag(self.finished),
            ControlCall::Abort => Reply::Unit,
            ControlCall::Position => Reply::Position(self.position),
            ControlCall::ToolTemperature(tool) => {
                Reply::Temperature(self.heater(Heater::Tool(*tool)).ok_or_else(|| missing("such tool"))?.sample())
            }
            ControlCall::ToolTargetTemperature(tool) => {
                Reply::Temperature(self.heater(Heater::Tool(*tool)).ok_or_else(|| missing("such tool"))?.target)
            }
            ControlCall::ToolReady(tool) => {
                Reply::Flag(self.heater(Heater::Tool(*tool)).ok_or_else(|| missing("such tool"))?.ready())
            }
            ControlCall::PlatformTemperature => {
                Reply::Temperature(self.heater(Heater::Platform).ok_or_else(|| missing("platform"))?.sample())
            }
            ControlCall::PlatformTargetTemperature => {
                Reply::Temperature(self.heater(Heater::Platform).ok_or_else(|| missing("platform"))?.target)
            }
            ControlCall::PlatformReady => {
                Reply::Flag(self.heater(Heater::Platform).ok_or_else(|| missing("platform"))?.ready())
            }
            ControlCall::SerialNumber => Reply::Text(self.serial.clone().ok_or_else(|| missing("serial number"))?),
            ControlCall::ReadEeprom => Reply::Eeprom(self.eeprom.clone()),
            ControlCall::WriteEeprom(values) => {
                self.eeprom.extend(values.clone());
                Reply::Unit
            }
        };
        Ok(reply)
    }
}

/// In-memory serial device. Clones share the same device.
#[derive(Clone)]
pub struct SimSerialDevice {
    port: String,
    state: Arc<Mutex<SerialState>>,
}

impl SimSerialDevice {
    pub fn new(port: impl Into<String>) -> Self {
        Self::with_layout(port, 1, true)
    }

    pub fn with_layout(port: impl Into<String>, tool_count: u8, heated_platform: bool) -> Self {
        Self {
            port: port.into(),
            state: Arc::new(Mutex::new(SerialState {
                sent: Vec::new(),
                controls: Vec::new(),
                line_attempts: 0,
                control_attempts: 0,
                line_failure: None,
                control_failure: None,
                open_failure: None,
                opens: 0,
                line_delay: Duration::ZERO,
                position: Position::default(),
                relative: false,
                status: BuildStatus::default(),
                finished: true,
                serial: None,
                tools: vec![SimHeater::ambient(); tool_count as usize],
                platform: heated_platform.then(SimHeater::ambient),
                eeprom: EepromMap::new(),
            })),
        }
    }

    /// Lines the device accepted, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Names of the control calls the device answered, in order.
    pub fn control_calls(&self) -> Vec<&'static str> {
        self.state.lock().controls.clone()
    }

    /// Every `send_line` call, failed ones included.
    pub fn line_attempts(&self) -> u64 {
        self.state.lock().line_attempts
    }

    pub fn control_attempts(&self) -> u64 {
        self.state.lock().control_attempts
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    /// Fail the next `times` line sends with `error`; `None` fails every one.
    pub fn fail_lines(&self, error: LinkError, times: Option<u32>) {
        self.state.lock().line_failure = Some(Injected { error, remaining: times });
    }

    pub fn fail_controls(&self, error: LinkError, times: Option<u32>) {
        self.state.lock().control_failure = Some(Injected { error, remaining: times });
    }

    pub fn fail_open(&self, error: Option<LinkError>) {
        self.state.lock().open_failure = error;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.line_failure = None;
        state.control_failure = None;
        state.open_failure = None;
    }

    /// Time the device takes to accept each line.
    pub fn set_line_delay(&self, delay: Duration) {
        self.state.lock().line_delay = delay;
    }

    pub fn position(&self) -> Position {
        self.state.lock().position
    }

    pub fn set_position(&self, position: Position) {
        self.state.lock().position = position;
    }

    pub fn set_status(&self, status: BuildStatus) {
        self.state.lock().status = status;
    }

    pub fn set_finished(&self, finished: bool) {
        self.state.lock().finished = finished;
    }

    pub fn set_serial_number(&self, serial: Option<String>) {
        self.state.lock().serial = serial;
    }

    pub fn eeprom(&self) -> EepromMap {
        self.state.lock().eeprom.clone()
    }

    /// Target currently set on `heater`, if the device has it.
    pub fn target(&self, heater: Heater) -> Option<f64> {
        self.state.lock().heater(heater).map(|h| h.target)
    }
}

#[async_trait]
impl SerialLink for SimSerialDevice {
    fn port(&self) -> &str {
        &self.port
    }

    async fn send_line(&self, line: &str) -> Result<(), LinkError> {
        let delay = {
            let mut state = self.state.lock();
            state.line_attempts += 1;
            if let Some(error) = take_failure(&mut state.line_failure) {
                tracing::debug!(port = %self.port, "injected failure for '{}': {}", line, error);
                return Err(error);
            }
            state.line_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.accept(line);
        state.sent.push(line.to_string());
        Ok(())
    }

    async fn control(&self, call: &ControlCall) -> Result<Reply, LinkError> {
        let mut state = self.state.lock();
        state.control_attempts += 1;
        if let Some(error) = take_failure(&mut state.control_failure) {
            return Err(error);
        }
        let reply = state.answer(call)?;
        state.controls.push(call.name());
        Ok(reply)
    }
}

#[async_trait]
impl SerialConnector for SimSerialDevice {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> Result<Arc<dyn SerialLink>, LinkError> {
        let mut state = self.state.lock();
        if let Some(error) = state.open_failure.clone() {
            return Err(error);
        }
        state.opens += 1;
        state.relative = false;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_absolute_and_relative_moves() {
        let device = SimSerialDevice::new("sim0");
        device.send_line("G1 X10 Y20 Z30 E5").await.unwrap();
        device.send_line("G91").await.unwrap();
        device.send_line("G1 Z2").await.unwrap();
        device.send_line("G90").await.unwrap();
        assert_eq!(device.position(), Position::new(10.0, 20.0, 32.0, 5.0));
        assert_eq!(device.sent_lines().len(), 4);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let device = SimSerialDevice::new("sim0");
        device.fail_lines(LinkError::Timeout, Some(2));
        assert_eq!(device.send_line("G28").await, Err(LinkError::Timeout));
        assert_eq!(device.send_line("G28").await, Err(LinkError::Timeout));
        assert!(device.send_line("G28").await.is_ok());
        assert_eq!(device.line_attempts(), 3);
        assert_eq!(device.sent_lines(), vec!["G28".to_string()]);
    }

    #[tokio::test]
    async fn temperature_commands_set_targets() {
        let device = SimSerialDevice::with_layout("sim0", 2, true);
        device.send_line("M104 T1 S210").await.unwrap();
        device.send_line("M140 S60").await.unwrap();
        assert_eq!(device.target(Heater::Tool(1)), Some(210.0));
        assert_eq!(device.target(Heater::Platform), Some(60.0));
        let reply = device.control(&ControlCall::ToolTargetTemperature(1)).await.unwrap();
        assert_eq!(reply, Reply::Temperature(210.0));
    }
}
