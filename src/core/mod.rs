//! Core support types for devstack.
//!
//! Global configuration and the retry/backoff primitives used for health
//! gating.

mod config;
mod retry;

pub use config::{Config, EngineConfig, GeneralConfig, PortsConfig, PullPolicy};
pub use retry::{retry_async_if, AttemptTimeout, RetryConfig, RetryResult};
