//! stratusd — the daemon composing the stratus subsystems.
//!
//! A consuming application builds an [`App`] with its state
//! directory, schema migrations, API extensions, lifecycle hooks, and
//! any additional listeners, then runs it. The [`Daemon`] wires the
//! trust store, endpoint manager, replication engine, database
//! coordinator, REST surface, and heartbeat loop together, and owns
//! the ordered start and stop sequences.

pub mod app;
pub mod daemon;

pub use app::App;
pub use daemon::Daemon;
