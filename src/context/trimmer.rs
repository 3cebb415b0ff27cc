//! Oldest-prefix eviction to fit a model's input window
//!
//! The budget keeps a 10% margin for estimator error. History is walked
//! newest to oldest; the first message that overflows and everything older
//! is evicted.

use super::encoder::TokenEncoder;
use crate::conversation::{MessageId, StoredMessage};
use tracing::{debug, warn};

/// Envelope tokens around every message
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Tokens charged for the role name
pub const ROLE_TOKENS: usize = 1;
/// Tokens priming the reply, counted once per request
pub const REPLY_PRIMING_TOKENS: usize = 2;
/// Share of the model window the history may occupy
pub const BUDGET_RATIO: f64 = 0.9;

/// Estimated prompt cost of one message
pub fn message_cost(encoder: &dyn TokenEncoder, content: &str) -> usize {
    MESSAGE_OVERHEAD_TOKENS + ROLE_TOKENS + encoder.count(content)
}

/// Result of planning an eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimPlan {
    /// Ids to delete, oldest first
    pub evict: Vec<MessageId>,
    /// Estimated prompt tokens of the kept messages, priming included
    pub kept_tokens: usize,
}

impl TrimPlan {
    pub fn is_noop(&self) -> bool {
        self.evict.is_empty()
    }
}

/// Decides which oldest messages to drop for a token budget
#[derive(Debug, Clone, Copy)]
pub struct ContextTrimmer {
    budget: usize,
}

impl ContextTrimmer {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Budget from an explicit ceiling, else the model's known context size
    pub fn for_model(model: &str, max_context_tokens: Option<usize>) -> Self {
        let budget = max_context_tokens
            .unwrap_or_else(|| tiktoken_rs::model::get_context_size(model));
        Self::new(budget)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Part of the budget usable by history
    pub fn usable_budget(&self) -> usize {
        (self.budget as f64 * BUDGET_RATIO).floor() as usize
    }

    /// Plan the eviction for an ordered history (oldest first)
    pub fn plan(&self, messages: &[StoredMessage], encoder: &dyn TokenEncoder) -> TrimPlan {
        let mut remaining = self.usable_budget() as i64 - REPLY_PRIMING_TOKENS as i64;
        let mut kept_tokens = REPLY_PRIMING_TOKENS;
        let mut cutoff = 0;

        for (index, message) in messages.iter().enumerate().rev() {
            let cost = message_cost(encoder, &message.content);
            remaining -= cost as i64;
            if remaining < 0 {
                cutoff = index + 1;
                if cutoff == messages.len() {
                    warn!(
                        "Message {} alone exceeds the token budget: {} chars, ~{} tokens, budget {}",
                        message.id,
                        message.content.chars().count(),
                        cost,
                        self.usable_budget()
                    );
                }
                break;
            }
            kept_tokens += cost;
        }

        let evict: Vec<MessageId> = messages[..cutoff].iter().map(|m| m.id).collect();
        debug!(
            "Trim plan: {} of {} messages evicted, ~{} tokens kept (budget {})",
            evict.len(),
            messages.len(),
            kept_tokens,
            self.usable_budget()
        );

        TrimPlan { evict, kept_tokens }
    }
}
