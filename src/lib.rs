//! Request governing core for chat bots
//!
//! Paces every outbound completion or image call through a multi-resource
//! rate limiter, trims conversation history to the model's context window
//! and keeps per-user conversation state.

pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod governor;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod remote;

pub use config::Config;
pub use error::{GovernorError, Result};
pub use governor::{GovernorSettings, ImageOutcome, RequestGovernor, FAILURE_MESSAGE};
