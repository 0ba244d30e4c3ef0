use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

mod debug;
mod registry;

pub use debug::Debug;
pub use registry::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    listener: Listener,
    #[serde(default)]
    registry: Registry,
    #[serde(default)]
    worker: Worker,
    #[serde(default)]
    debug: Debug,
}

impl Config {
    /// Load the config, terminating the process if it can't be used.
    pub fn new(filename: &str) -> Self {
        match Self::load(filename) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }

    pub fn load(filename: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(filename)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn debug(&self) -> &Debug {
        &self.debug
    }
}

fn default_name() -> String {
    "java_client".into()
}

fn sixty() -> u64 {
    60
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "default_name")]
    name: String,
    /// Shared secret a connecting node must present.
    #[serde(default)]
    cookie: Option<String>,
    /// Seconds between stats log lines.
    #[serde(default = "sixty")]
    interval: u64,
}

impl Default for General {
    fn default() -> Self {
        Self {
            name: default_name(),
            cookie: None,
            interval: sixty(),
        }
    }
}

impl General {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(std::cmp::max(1, self.interval))
    }
}

fn default_address() -> String {
    "127.0.0.1:9470".into()
}

fn default_max_frame_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listener {
    #[serde(default = "default_address")]
    address: String,
    /// Largest frame a connected node may send, in bytes.
    #[serde(default = "default_max_frame_size")]
    max_frame_size: usize,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Listener {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}
