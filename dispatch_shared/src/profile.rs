//! Immutable machine capability description.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AxisSizes {
    #[serde(default = "default_x")]
    pub x: f64,
    #[serde(default = "default_y")]
    pub y: f64,
    #[serde(default = "default_z")]
    pub z: f64,
}

impl Default for AxisSizes {
    fn default() -> Self {
        Self {
            x: default_x(),
            y: default_y(),
            z: default_z(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// Filled in from the `[profiles.<name>]` key when loaded from config.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub axes: AxisSizes,
    #[serde(default = "default_tool_count")]
    pub tool_count: u8,
    #[serde(default = "default_heated_platform")]
    pub heated_platform: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            driver: default_driver(),
            axes: AxisSizes::default(),
            tool_count: default_tool_count(),
            heated_platform: default_heated_platform(),
        }
    }
}

impl Profile {
    pub fn clamp_z(&self, z: f64) -> f64 {
        z.min(self.axes.z)
    }
}

fn default_x() -> f64 { 285.0 }
fn default_y() -> f64 { 153.0 }
fn default_z() -> f64 { 155.0 }
fn default_driver() -> String { "gcode".to_string() }
fn default_tool_count() -> u8 { 1 }
fn default_heated_platform() -> bool { true }
