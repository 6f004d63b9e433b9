//! Daemon plumbing shared by the taskmaster daemon and its control client:
//! XDG paths, a newline-delimited JSON Unix socket server, a blocking client
//! and PID-file based background management.

pub mod client;
pub mod daemon;
pub mod paths;
pub mod server;

#[cfg(feature = "clap")]
pub mod clap;

pub use client::{ClientError, DaemonClient};
pub use daemon::{Daemon, DaemonError};
pub use paths::DaemonPaths;
