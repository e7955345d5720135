// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to sanitize the committer config! Field: {0}, Error: {1}")]
    ConfigSanitizerFailed(&'static str, String),
    #[error("Error accessing {0}: {1}")]
    IO(String, #[source] std::io::Error),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
}

pub trait PersistableConfig: Serialize + DeserializeOwned {
    /// Load the config from disk at the given path
    fn load_config<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path_string = path.as_ref().display().to_string();
        let mut file =
            File::open(&path).map_err(|e| ConfigError::IO(config_path_string.clone(), e))?;

        let mut file_contents = String::new();
        file.read_to_string(&mut file_contents)
            .map_err(|e| ConfigError::IO(config_path_string, e))?;

        Self::parse_serialized_config(&file_contents)
    }

    /// Save the config to disk at the given output path
    fn save_config<P: AsRef<Path>>(&self, output_file: P) -> Result<(), ConfigError> {
        let output_path_string = output_file.as_ref().display().to_string();
        let serialized_config = serde_yaml::to_vec(&self)
            .map_err(|e| ConfigError::Yaml(output_path_string.clone(), e))?;

        let mut file = File::create(output_file.as_ref())
            .map_err(|e| ConfigError::IO(output_path_string.clone(), e))?;
        file.write_all(&serialized_config)
            .map_err(|e| ConfigError::IO(output_path_string, e))?;

        Ok(())
    }

    /// Parse the config from the serialized string
    fn parse_serialized_config(serialized_config: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(serialized_config)
            .map_err(|e| ConfigError::Yaml("config".to_string(), e))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommitterConfig {
    /// Number of worker threads executing attempts.
    pub num_workers: usize,
    /// Number of response slots in the streaming window.
    pub window_size: usize,
    /// Maximum number of admitted but undelivered commits. Must not exceed
    /// `window_size`; the difference is headroom for redos.
    pub concurrency_limit: usize,
    /// Pin worker i to logical core i, where the platform supports it.
    pub pin_workers_to_cores: bool,
    /// How long a blocking queue pop waits before waking up to check for shutdown.
    pub queue_pop_timeout_ms: u64,
    /// How often a blocked admitter re-checks the window.
    pub admission_poll_interval_ms: u64,
    /// Give up admission after this long. `None` waits until shutdown.
    pub admission_timeout_ms: Option<u64>,
    /// Batch mode only: how many times a failed attempt is redone before its failure
    /// becomes terminal.
    pub max_failure_redos: usize,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            window_size: 256,
            concurrency_limit: 64,
            pin_workers_to_cores: false,
            queue_pop_timeout_ms: 10,
            admission_poll_interval_ms: 10,
            admission_timeout_ms: None,
            max_failure_redos: 3,
        }
    }
}

impl PersistableConfig for CommitterConfig {}

impl CommitterConfig {
    /// Rejects configurations that would break the window invariants at runtime.
    pub fn sanitize(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "num_workers",
                "at least one worker is required".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "window_size",
                "window must hold at least one slot".into(),
            ));
        }
        if self.concurrency_limit == 0 || self.concurrency_limit > self.window_size {
            return Err(ConfigError::ConfigSanitizerFailed(
                "concurrency_limit",
                format!(
                    "must be between 1 and window_size ({}), got {}",
                    self.window_size, self.concurrency_limit
                ),
            ));
        }
        if self.queue_pop_timeout_ms == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "queue_pop_timeout_ms",
                "must be positive".into(),
            ));
        }
        if self.admission_poll_interval_ms == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "admission_poll_interval_ms",
                "must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_pop_timeout_ms)
    }

    pub fn admission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission_poll_interval_ms)
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_ms.map(Duration::from_millis)
    }
}
