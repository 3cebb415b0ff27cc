//! Context window management
//!
//! Token counting per model and oldest-first eviction of conversation
//! history so a request fits the model's input window.

pub mod encoder;
pub mod trimmer;

pub use encoder::{EncoderError, EncoderRegistry, TiktokenEncoder, TokenEncoder, WordEncoder};
pub use trimmer::{message_cost, ContextTrimmer, TrimPlan};
