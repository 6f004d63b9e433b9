//! Shared types for taskmaster: program definitions, instance status,
//! the control protocol and the daemon configuration file.

pub mod config;
pub mod protocol;
pub mod types;

pub use config::{Config, ConfigError};
pub use protocol::{Request, Response};
pub use types::*;
