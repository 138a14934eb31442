//! Token-budget trimming of conversation history.

use relay_types::ConversationMessage;

/// Default history budget in estimated tokens.
///
/// Deliberately independent of the model's reported context length.
pub const DEFAULT_TOKEN_BUDGET: u32 = 3500;

/// When the trimmer runs relative to the provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimStrategy {
    /// Trim the history (including the new prompt) before calling the provider.
    /// The committed history is trimmed again once the answer is appended.
    PreCall,
    /// Send the full history, trim after the answer is committed.
    #[default]
    PostCall,
}

impl TrimStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreCall => "pre_call",
            Self::PostCall => "post_call",
        }
    }

    /// Parses the config spelling (`pre_call` / `post_call`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pre_call" => Some(Self::PreCall),
            "post_call" => Some(Self::PostCall),
            _ => None,
        }
    }

    #[must_use]
    pub const fn trims_before_call(self) -> bool {
        matches!(self, Self::PreCall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrimOutcome {
    /// Messages removed from the front of the history.
    pub dropped: usize,
    /// Estimated tokens of the surviving history.
    pub remaining_tokens: u64,
}

impl TrimOutcome {
    #[must_use]
    pub const fn trimmed(&self) -> bool {
        self.dropped > 0
    }
}

/// Drop the oldest messages until the history fits `budget`.
///
/// Walks from the newest message backwards accumulating costs; the first
/// message that pushes the running total past `budget` is cut together with
/// everything older. The survivor is always a suffix of the input, and is
/// empty when the newest message alone exceeds the budget.
pub fn trim_to_budget(history: &mut Vec<ConversationMessage>, budget: u32) -> TrimOutcome {
    let budget = u64::from(budget);
    let mut running: u64 = 0;
    let mut keep_from = 0;

    for (index, message) in history.iter().enumerate().rev() {
        let next = running + u64::from(message.token_cost());
        if next > budget {
            keep_from = index + 1;
            break;
        }
        running = next;
    }

    if keep_from > 0 {
        history.drain(..keep_from);
    }

    TrimOutcome {
        dropped: keep_from,
        remaining_tokens: running,
    }
}
