//! Process-control engine: keeps named programs running as configured.
//!
//! The engine ([`Supervisor`]) owns every instance's state machine and never
//! touches the OS directly. Children are created through a [`Launcher`] and
//! their exits arrive as [`ExitEvent`]s from the [`EventMonitor`], so tests can
//! drive the whole lifecycle with a fake launcher and a paused clock.

pub mod backoff;
pub mod error;
mod group;
mod instance;
pub mod launcher;
pub mod monitor;
pub mod output;
pub mod reconcile;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use error::{ControlError, ShutdownError, SpawnError};
pub use launcher::{Launched, Launcher, OsLauncher, OutputPipe};
pub use monitor::{EventMonitor, ExitEvent};
pub use output::OutputCapture;
pub use supervisor::{Supervisor, SupervisorConfig};
