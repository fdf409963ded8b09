//! Runtime core: the supervisor event loop and its supporting pieces.
//!
//! - **supervisor.rs**: public facade; owns the dependency list, snapshot,
//!   quiescence timers, child handle, and PID file; drives the event loop.
//! - **snapshot.rs**: latest decoded value per dependency.
//! - **pid.rs**: PID file create/remove.

mod pid;
mod snapshot;
mod supervisor;

pub use snapshot::Snapshot;
pub use supervisor::{Supervisor, SupervisorOptions};
