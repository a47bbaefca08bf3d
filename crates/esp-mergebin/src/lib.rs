pub mod board;
pub mod config;
pub mod error;
pub mod executor;
pub mod host_env;
pub mod layout;
pub mod log_sanitize;
pub mod merge;
pub mod modules;
pub mod planner;
pub mod project;

pub use error::{Error, Result};
