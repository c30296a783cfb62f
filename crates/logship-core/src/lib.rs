//! logship core
//!
//! Core types, configuration, and traits for the logship log-shipping agent.

pub mod config;
pub mod error;
pub mod event;
pub mod traits;

// Re-export commonly used types
pub use config::Config;
pub use error::{InputError, OutputError, Result, ShipError};
pub use event::{Event, TimestampCache};
pub use traits::{Input, Output};

/// Best-effort hostname of the local machine, used for event enrichment.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
