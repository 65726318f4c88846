//! Configuration types and constants.

pub mod constants;
mod types;

pub use constants::*;
pub use types::{Config, LogFormat, LogLevel};
