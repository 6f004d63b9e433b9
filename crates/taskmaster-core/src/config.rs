use crate::types::ProcessSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("duplicate program name: {0}")]
	DuplicateName(String),
	#[error("program name must not be empty")]
	EmptyName,
	#[error("{0}: command must not be empty")]
	EmptyCommand(String),
	#[error("{0}: instances must be at least 1")]
	NoInstances(String),
	#[error("{name}: umask {umask:o} is out of range")]
	InvalidUmask { name: String, umask: u32 },
	#[error("supervisor.backoff_base_ms must be greater than 0")]
	ZeroBackoff,
	#[error("supervisor.backoff_max_ms ({max}) is below backoff_base_ms ({base})")]
	BackoffRange { base: u64, max: u64 },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub supervisor: SupervisorSection,
	#[serde(default, rename = "program")]
	pub programs: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_log_level")]
	pub log_level: String,
	#[serde(default = "default_shutdown_timeout")]
	pub shutdown_timeout_secs: u64,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			log_level: default_log_level(),
			shutdown_timeout_secs: default_shutdown_timeout(),
		}
	}
}

fn default_log_level() -> String {
	"info".to_string()
}
fn default_shutdown_timeout() -> u64 {
	30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
	#[serde(default = "default_backoff_base")]
	pub backoff_base_ms: u64,
	#[serde(default = "default_backoff_max")]
	pub backoff_max_ms: u64,
	#[serde(default = "default_reap_interval")]
	pub reap_interval_ms: u64,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			backoff_base_ms: default_backoff_base(),
			backoff_max_ms: default_backoff_max(),
			reap_interval_ms: default_reap_interval(),
		}
	}
}

fn default_backoff_base() -> u64 {
	1000
}
fn default_backoff_max() -> u64 {
	30_000
}
fn default_reap_interval() -> u64 {
	1000
}

/// Parses and validates a config document. A bad program rejects the whole file.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
	let config: Config = toml::from_str(content)?;
	validate_supervisor(&config.supervisor)?;
	validate(&config.programs)?;
	Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
		path: path.to_path_buf(),
		source,
	})?;
	parse_config(&content)
}

/// A zero restart delay would respawn crashing programs in a tight loop.
pub fn validate_supervisor(section: &SupervisorSection) -> Result<(), ConfigError> {
	if section.backoff_base_ms == 0 {
		return Err(ConfigError::ZeroBackoff);
	}
	if section.backoff_max_ms < section.backoff_base_ms {
		return Err(ConfigError::BackoffRange {
			base: section.backoff_base_ms,
			max: section.backoff_max_ms,
		});
	}
	Ok(())
}

/// Checks a full program set before any of it is applied.
pub fn validate(programs: &[ProcessSpec]) -> Result<(), ConfigError> {
	let mut seen = HashSet::new();
	for spec in programs {
		if spec.name.trim().is_empty() {
			return Err(ConfigError::EmptyName);
		}
		if !seen.insert(spec.name.as_str()) {
			return Err(ConfigError::DuplicateName(spec.name.clone()));
		}
		if spec.command.trim().is_empty() {
			return Err(ConfigError::EmptyCommand(spec.name.clone()));
		}
		if spec.instances == 0 {
			return Err(ConfigError::NoInstances(spec.name.clone()));
		}
		if let Some(umask) = spec.umask {
			if umask > 0o777 {
				return Err(ConfigError::InvalidUmask {
					name: spec.name.clone(),
					umask,
				});
			}
		}
	}
	Ok(())
}
