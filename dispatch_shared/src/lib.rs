// dispatch_shared: shared traits and types for the dispatcher host, simulator, and tests

pub mod api_models;
pub mod config;
pub mod device;
pub mod gcode_utils;
pub mod job;
pub mod job_registry;
pub mod profile;

use serde::{Deserialize, Serialize};
use std::fmt;

// --- Shared telemetry types ---

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A heater addressed by a temperature command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heater {
    Tool(u8),
    Platform,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    pub current: f64,
    pub target: f64,
    pub ready: bool,
}

/// Temperature telemetry for one machine. Eventually consistent with the device.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub tools: Vec<HeaterReading>,
    pub platform: Option<HeaterReading>,
}

impl Temperatures {
    pub fn for_layout(tool_count: u8, heated_platform: bool) -> Self {
        Self {
            tools: vec![HeaterReading::default(); tool_count as usize],
            platform: heated_platform.then(HeaterReading::default),
        }
    }

    pub fn reading_mut(&mut self, heater: Heater) -> Option<&mut HeaterReading> {
        match heater {
            Heater::Tool(index) => self.tools.get_mut(index as usize),
            Heater::Platform => self.platform.as_mut(),
        }
    }

    pub fn set_target(&mut self, heater: Heater, celsius: f64) -> bool {
        match self.reading_mut(heater) {
            Some(reading) if reading.target != celsius => {
                reading.target = celsius;
                true
            }
            _ => false,
        }
    }
}
