//! Multi-resource admission control
//!
//! A single virtual clock paces every outbound call so that all configured
//! "N units per interval" limits hold at once. Reservations are FIFO in lock
//! acquisition order; sleeping happens outside the lock.

pub mod scheduler;
pub mod volume;

pub use scheduler::{Limiter, LimiterError, Retryable};
pub use volume::{Volume, IMAGES, REQUESTS, TOKENS};
