//! Streaming session controller for remote agents.
//!
//! Provides:
//! - `SessionClient` - Handle to the single-owner controller actor
//! - `ClientSettings` / `Timing` - TOML-backed configuration
//! - `RetryQueue`, `ReconnectPolicy`, `TextAssembler`, `Watchdog` - the
//!   controller's building blocks

pub mod assembler;
pub mod client;
pub mod config;
mod controller;
pub mod reconnect;
pub mod retry;
mod timers;
pub mod watchdog;

pub use assembler::TextAssembler;
pub use client::{ClientError, SessionClient};
pub use config::{ClientSettings, ConfigError, Timing, resolve_endpoint};
pub use reconnect::ReconnectPolicy;
pub use retry::{FailureOutcome, PendingMessage, RetryQueue};
pub use watchdog::Watchdog;
