// src/utils/mod.rs
//! Common utilities: configuration, errors and retry

pub mod config;
pub mod errors;
pub mod retry;

pub use config::RunnerConfig;
pub use errors::{Result, RunnerError};
pub use retry::{retry, RetryPolicy};
