//! Text G-code link over a serial port.
//!
//! One line out, then read until the firmware acknowledges it with `ok`.
//! Structured [`ControlCall`]s are mapped onto query commands and their
//! replies parsed back into [`Reply`] values.

use async_trait::async_trait;
use dispatch_shared::Position;
use dispatch_shared::device::{
    BuildState, BuildStatus, ControlCall, EepromMap, LinkError, Reply, SerialConnector, SerialLink,
};
use serde_json::Value;
use serial2_tokio::SerialPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Degrees from target at which a heater counts as ready.
const READY_TOLERANCE: f64 = 3.0;

/// List serial ports known to the OS.
pub fn available_ports() -> Vec<String> {
    match SerialPort::available_ports() {
        Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
        Err(e) => {
            tracing::warn!("could not enumerate serial ports: {}", e);
            vec![]
        }
    }
}

pub struct GcodeSerialConnector {
    port: String,
    baud: u32,
    timeout: Duration,
}

impl GcodeSerialConnector {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SerialConnector for GcodeSerialConnector {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> Result<Arc<dyn SerialLink>, LinkError> {
        let port = SerialPort::open(&self.port, self.baud)?;
        tracing::info!(port = %self.port, baud = self.baud, "serial port opened");
        Ok(Arc::new(GcodeSerialLink {
            name: self.port.clone(),
            port,
            timeout: self.timeout,
            pending: tokio::sync::Mutex::new(LineAssembler::default()),
        }))
    }
}

pub struct GcodeSerialLink {
    name: String,
    port: SerialPort,
    timeout: Duration,
    pending: tokio::sync::Mutex<LineAssembler>,
}

/// Received bytes not yet split into lines. Decoding waits for the newline so
/// a multi-byte character split across reads stays intact.
#[derive(Debug, Default)]
struct LineAssembler {
    bytes: Vec<u8>,
}

impl LineAssembler {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.bytes.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.bytes.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Response {
    Ok(String),
    KeepAlive,
    Overflow,
    Error(String),
    Data(String),
}

fn classify_response(line: &str) -> Response {
    let lower = line.to_ascii_lowercase();
    if let Some(rest) = line.strip_prefix("ok") {
        return Response::Ok(rest.trim().to_string());
    }
    if lower.contains("busy:") {
        return Response::KeepAlive;
    }
    if lower.contains("buffer full") {
        return Response::Overflow;
    }
    if let Some(message) = line.strip_prefix("Error:").or_else(|| line.strip_prefix("!!")) {
        return Response::Error(message.trim().to_string());
    }
    Response::Data(line.to_string())
}

fn error_for(message: String) -> LinkError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("thermal runaway") || lower.contains("heating failed") || lower.contains("maxtemp") {
        LinkError::Overheat(message)
    } else if lower.contains("unknown command") {
        LinkError::Unsupported(message)
    } else {
        LinkError::Protocol(message)
    }
}

impl GcodeSerialLink {
    /// Send `line` and collect the reply text up to its acknowledgement.
    async fn round_trip(&self, line: &str) -> Result<Vec<String>, LinkError> {
        let mut pending = self.pending.lock().await;
        let mut payload = line.trim().to_string();
        payload.push('\n');
        let bytes = payload.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let n = self.port.write(&bytes[written..]).await?;
            if n == 0 {
                return Err(LinkError::Closed);
            }
            written += n;
        }

        let mut reply = Vec::new();
        let mut deadline = Instant::now() + self.timeout;
        loop {
            while let Some(raw) = pending.next_line() {
                let text = raw.trim();
                if text.is_empty() {
                    continue;
                }
                match classify_response(text) {
                    Response::Ok(rest) => {
                        if !rest.is_empty() {
                            reply.push(rest);
                        }
                        return Ok(reply);
                    }
                    Response::KeepAlive => deadline = Instant::now() + self.timeout,
                    Response::Overflow => return Err(LinkError::BufferOverflow),
                    Response::Error(message) => return Err(error_for(message)),
                    Response::Data(text) => reply.push(text),
                }
            }
            let mut buf = [0u8; 256];
            let n = match tokio::time::timeout_at(deadline, self.port.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    tracing::debug!(port = %self.name, "no acknowledgement for '{}'", line);
                    // A partial reply must not complete the retried command.
                    pending.clear();
                    return Err(LinkError::Timeout);
                }
            };
            if n == 0 {
                return Err(LinkError::Closed);
            }
            pending.extend(&buf[..n]);
        }
    }

    async fn temperatures(&self) -> Result<TemperatureReport, LinkError> {
        let reply = self.round_trip("M105").await?;
        reply
            .iter()
            .find_map(|line| parse_temperature_report(line))
            .ok_or_else(|| LinkError::Protocol(format!("no temperature report in {:?}", reply)))
    }
}

#[async_trait]
impl SerialLink for GcodeSerialLink {
    fn port(&self) -> &str {
        &self.name
    }

    async fn send_line(&self, line: &str) -> Result<(), LinkError> {
        self.round_trip(line).await.map(|_| ())
    }

    async fn control(&self, call: &ControlCall) -> Result<Reply, LinkError> {
        match call {
            ControlCall::ToolTemperature(tool) => {
                let (current, _) = self.temperatures().await?.tool(*tool)?;
                Ok(Reply::Temperature(current))
            }
            ControlCall::ToolTargetTemperature(tool) => {
                let (_, target) = self.temperatures().await?.tool(*tool)?;
                Ok(Reply::Temperature(target))
            }
            ControlCall::ToolReady(tool) => {
                let (current, target) = self.temperatures().await?.tool(*tool)?;
                Ok(Reply::Flag(is_ready(current, target)))
            }
            ControlCall::PlatformTemperature => {
                let (current, _) = self.temperatures().await?.platform()?;
                Ok(Reply::Temperature(current))
            }
            ControlCall::PlatformTargetTemperature => {
                let (_, target) = self.temperatures().await?.platform()?;
                Ok(Reply::Temperature(target))
            }
            ControlCall::PlatformReady => {
                let (current, target) = self.temperatures().await?.platform()?;
                Ok(Reply::Flag(is_ready(current, target)))
            }
            ControlCall::Position => {
                let reply = self.round_trip("M114").await?;
                reply
                    .iter()
                    .find_map(|line| parse_position(line))
                    .map(Reply::Position)
                    .ok_or_else(|| LinkError::Protocol(format!("no position in {:?}", reply)))
            }
            // M400 returns once every queued move has finished.
            ControlCall::IsFinished => self.round_trip("M400").await.map(|_| Reply::Flag(true)),
            ControlCall::Abort => self.round_trip("M410").await.map(|_| Reply::Unit),
            ControlCall::BuildStatus => {
                let reply = self.round_trip("M27").await?;
                Ok(Reply::Status(parse_build_status(&reply)))
            }
            ControlCall::SerialNumber => {
                let reply = self.round_trip("M115").await?;
                reply
                    .iter()
                    .find_map(|line| firmware_field(line, "UUID"))
                    .map(Reply::Text)
                    .ok_or_else(|| LinkError::Unsupported("firmware reports no UUID".to_string()))
            }
            ControlCall::ReadEeprom => {
                let reply = self.round_trip("M503").await?;
                Ok(Reply::Eeprom(parse_eeprom(&reply)))
            }
            ControlCall::WriteEeprom(values) => {
                for line in eeprom_lines(values) {
                    self.round_trip(&line).await?;
                }
                self.round_trip("M500").await.map(|_| Reply::Unit)
            }
        }
    }
}

fn is_ready(current: f64, target: f64) -> bool {
    target <= 0.0 || (target - current).abs() <= READY_TOLERANCE
}

/// Current/target pairs from an `M105` report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureReport {
    pub tools: Vec<Option<(f64, f64)>>,
    pub platform: Option<(f64, f64)>,
}

impl TemperatureReport {
    fn tool(&self, tool: u8) -> Result<(f64, f64), LinkError> {
        self.tools
            .get(tool as usize)
            .copied()
            .flatten()
            .ok_or_else(|| LinkError::Protocol(format!("no reading for tool {}", tool)))
    }

    fn platform(&self) -> Result<(f64, f64), LinkError> {
        self.platform
            .ok_or_else(|| LinkError::Protocol("no platform reading".to_string()))
    }
}

/// Parse `T:201.2 /210.0 B:59.8 /60.0 T0:201.2 /210.0 T1:...`.
pub fn parse_temperature_report(line: &str) -> Option<TemperatureReport> {
    let mut report = TemperatureReport::default();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut found = false;
    for (i, token) in tokens.iter().enumerate() {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        let Ok(current) = value.parse::<f64>() else {
            continue;
        };
        let target = tokens
            .get(i + 1)
            .and_then(|next| next.strip_prefix('/'))
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0);
        let slot = match key {
            "B" => {
                report.platform = Some((current, target));
                found = true;
                continue;
            }
            "T" => 0usize,
            _ => match key.strip_prefix('T').and_then(|n| n.parse::<usize>().ok()) {
                Some(index) => index,
                None => continue,
            },
        };
        if report.tools.len() <= slot {
            report.tools.resize(slot + 1, None);
        }
        report.tools[slot] = Some((current, target));
        found = true;
    }
    found.then_some(report)
}

/// Parse the leading `X: Y: Z: E:` fields of an `M114` report.
pub fn parse_position(line: &str) -> Option<Position> {
    let head = line.split("Count").next().unwrap_or(line);
    let mut fields = [None; 4];
    for token in head.split_whitespace() {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        let index = match key {
            "X" => 0,
            "Y" => 1,
            "Z" => 2,
            "E" => 3,
            _ => continue,
        };
        fields[index] = value.parse::<f64>().ok();
    }
    match fields {
        [Some(x), Some(y), Some(z), e] => Some(Position::new(x, y, z, e.unwrap_or(0.0))),
        _ => None,
    }
}

/// `M27` replies with either `SD printing byte n/m` or `Not SD printing`.
pub fn parse_build_status(reply: &[String]) -> BuildStatus {
    let printing = reply
        .iter()
        .any(|line| line.starts_with("SD printing") || line.starts_with("Printing"));
    BuildStatus {
        build_state: if printing { BuildState::Running } else { BuildState::None },
        ..BuildStatus::default()
    }
}

/// Value of `KEY:` in an `M115` capability line.
pub fn firmware_field(line: &str, key: &str) -> Option<String> {
    let marker = format!("{}:", key);
    let start = line.find(&marker)? + marker.len();
    let value = line[start..].split_whitespace().next()?;
    (!value.is_empty()).then(|| value.to_string())
}

/// Settings from an `M503` dump, keyed `M92.X`.
pub fn parse_eeprom(reply: &[String]) -> EepromMap {
    let mut map = EepromMap::new();
    for line in reply {
        let body = line.strip_prefix("echo:").unwrap_or(line).trim();
        let mut words = body.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        if !command.starts_with('M') || command.len() < 2 {
            continue;
        }
        for word in words {
            let (letter, value) = word.split_at(1);
            if let Ok(number) = value.parse::<f64>() {
                map.insert(format!("{}.{}", command, letter), Value::from(number));
            }
        }
    }
    map
}

/// Inverse of [`parse_eeprom`]: one command per settings group.
pub fn eeprom_lines(values: &EepromMap) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current: Option<&str> = None;
    for (key, value) in values {
        let Some((command, letter)) = key.split_once('.') else {
            tracing::warn!("skipping malformed eeprom key {}", key);
            continue;
        };
        let word = match value {
            Value::Number(n) => format!("{}{}", letter, n),
            other => format!("{}{}", letter, other),
        };
        match (current, lines.last_mut()) {
            (Some(open), Some(line)) if open == command => {
                line.push(' ');
                line.push_str(&word);
            }
            _ => {
                lines.push(format!("{} {}", command, word));
                current = Some(command);
            }
        }
    }
    lines
}
