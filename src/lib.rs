//!
//! camelback
//! ---------
//! Embedded application server whose applications are discovered from a
//! document database and whose sessions and logged-in users live in a shared
//! cluster grid. Subsystems, leaves first: `fabric`, `session`, `identity`,
//! `deploy`, then the `server` glue.

pub mod config;
pub mod deploy;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod server;
pub mod session;

pub use config::CamelbackConfig;
pub use error::{AppError, AppResult};
pub use server::{run, Engine, Node};
