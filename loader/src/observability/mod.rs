//! Logging setup

pub mod logging;

pub use logging::{init_production_logging, init_simple_logging};
