//! Shared domain types for the beamcode broker: error taxonomy, configuration,
//! and the structured trace toggle.

pub mod config;
pub mod error;
pub mod trace;

pub use config::Config;
pub use error::{Error, Result};
pub use trace::{TraceEvent, TraceLevel, Tracer};
