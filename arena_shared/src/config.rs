//! Configuration system.
//!
//! Loads server/client configuration from JSON strings or files. Every field
//! has a default so partial documents are accepted.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::MAX_PLAYERS;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("tick_hz must be positive")]
    ZeroTickRate,
    #[error("max_clients must be within 1..={max}, got {got}")]
    MaxClients { got: usize, max: usize },
    #[error("physics.dt must be a positive number of seconds, got {0}")]
    PhysicsDt(f32),
    #[error("physics.sweep_default_distance must be positive, got {0}")]
    SweepDistance(f32),
}

/// Which loop is allowed to advance the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsMode {
    /// The network tick steps the scene once per tick.
    #[default]
    Tick,
    /// A dedicated thread steps the scene back to back, unpaced; the network
    /// tick only reads snapshots.
    FreeRunning,
}

impl std::str::FromStr for PhysicsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "tick" => Ok(Self::Tick),
            "free_running" | "free-running" => Ok(Self::FreeRunning),
            other => anyhow::bail!("unknown physics mode: {other}"),
        }
    }
}

/// Physics world parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub gravity: [f32; 3],
    /// Simulated seconds per step.
    pub dt: f32,
    /// Dynamic bodies created at scene init.
    pub body_count: u32,
    /// Seed for the initial body layout jitter.
    pub seed: u64,
    /// Sweep length used when a force input carries `distance == 0`.
    pub sweep_default_distance: f32,
    /// Impulse magnitude applied to every body caught by a sweep.
    pub sweep_impulse: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -9.81, 0.0],
            dt: 1.0 / 60.0,
            body_count: 16,
            seed: 0x5eed,
            sweep_default_distance: 2.0,
            sweep_impulse: 0.5,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`. Port 0 picks a free port.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed network tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Connection slots offered by the transport.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub physics_mode: PhysicsMode,
    #[serde(default)]
    pub physics: PhysicsConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_max_clients() -> usize {
    MAX_PLAYERS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            max_clients: default_max_clients(),
            physics_mode: PhysicsMode::default(),
            physics: PhysicsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.max_clients == 0 || self.max_clients > MAX_PLAYERS {
            return Err(ConfigError::MaxClients {
                got: self.max_clients,
                max: MAX_PLAYERS,
            });
        }
        if !(self.physics.dt.is_finite() && self.physics.dt > 0.0) {
            return Err(ConfigError::PhysicsDt(self.physics.dt));
        }
        let sweep = self.physics.sweep_default_distance;
        if !(sweep.is_finite() && sweep > 0.0) {
            return Err(ConfigError::SweepDistance(
                self.physics.sweep_default_distance,
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Rate at which the client streams its pose.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
        }
    }
}
