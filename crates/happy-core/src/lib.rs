//! Ambient stack shared across the session-sync client: configuration,
//! error types, and logging setup. Nothing protocol-specific lives here.

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use tracing_init::init_tracing;
