// Core domain types and collaborator contracts
pub mod core;

// Conditional orders and the monitor that executes them
pub mod execution;

// Time-series store, batch recorder and retention
pub mod database;

pub mod config;
pub mod paper;
pub mod transport;

// Re-export commonly used types for convenience
pub use crate::core::*;
pub use crate::config::Config;
pub use crate::execution::{OrderMonitor, OrderStore};
pub use crate::database::{BatchRecorder, RetentionManager, TimeSeriesDb};
