#![doc = "Common types shared across the DrK probe workspace."]

pub mod config;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod time;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use probe::*;
pub use time::*;
