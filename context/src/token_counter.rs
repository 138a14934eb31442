//! Token estimation for conversation messages.
//!
//! Counts are **approximate**. The budget the relay enforces is a fixed
//! constant well below any model's context window, so a few percent of drift
//! against the provider's own tokenizer is harmless.
//!
//! - [`TiktokenEstimator`] encodes with `cl100k_base` (GPT-3.5/GPT-4) or
//!   `o200k_base` (GPT-4o and newer) and adds the per-message framing overhead
//!   OpenAI documents for chat models.
//! - [`HeuristicEstimator`] assumes roughly four characters per token and never
//!   fails. Useful when the BPE tables are unavailable or too slow.

use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

use relay_types::{ModelName, Role};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenEstimationError {
    #[error("tokenizer {0} failed to initialize")]
    EncoderUnavailable(&'static str),
}

/// Pluggable token cost function.
///
/// Implementations must be deterministic: identical `(role, content, model)`
/// inputs always yield the same count. Counts may differ across models.
pub trait TokenEstimator: Send + Sync {
    fn estimate(
        &self,
        role: Role,
        content: &str,
        model: &ModelName,
    ) -> Result<u32, TokenEstimationError>;
}

/// Estimate a message, treating estimator failure as an unaffordable cost.
///
/// A message whose cost cannot be computed is given `u32::MAX` so the trimmer
/// drops it instead of the turn aborting.
pub fn estimate_or_exhaust(
    estimator: &dyn TokenEstimator,
    role: Role,
    content: &str,
    model: &ModelName,
) -> u32 {
    match estimator.estimate(role, content, model) {
        Ok(cost) => cost,
        Err(e) => {
            tracing::warn!(%e, %role, model = %model, "Token estimation failed; message will be trimmed");
            u32::MAX
        }
    }
}

/// The BPE tables are expensive to build, so each encoding is created once
/// and shared across all estimator instances.
static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Cl100k,
    O200k,
}

impl Encoding {
    fn for_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        let o200k = ["gpt-4o", "gpt-4.1", "gpt-4.5", "gpt-5", "o1", "o3", "o4"]
            .iter()
            .any(|prefix| lower.starts_with(prefix));
        if o200k { Self::O200k } else { Self::Cl100k }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Cl100k => "cl100k_base",
            Self::O200k => "o200k_base",
        }
    }

    fn encoder(self) -> Option<&'static CoreBPE> {
        match self {
            Self::Cl100k => CL100K.get_or_init(|| cl100k_base().ok()).as_ref(),
            Self::O200k => O200K.get_or_init(|| o200k_base().ok()).as_ref(),
        }
    }
}

/// Framing tokens added by the chat format around every message.
fn message_overhead(model: &str) -> u32 {
    if model.starts_with("gpt-3.5-turbo") { 4 } else { 3 }
}

/// tiktoken-backed estimator.
///
/// ```
/// use relay_context::{TiktokenEstimator, TokenEstimator};
/// use relay_types::{ModelName, Role};
///
/// let estimator = TiktokenEstimator::new();
/// let cost = estimator
///     .estimate(Role::User, "Hello, world!", &ModelName::default())
///     .unwrap();
/// assert!(cost > 4);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenEstimator;

impl TiktokenEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Counts the BPE tokens in `text` for `model`'s encoding.
    pub fn count_str(&self, text: &str, model: &ModelName) -> Result<u32, TokenEstimationError> {
        let encoding = Encoding::for_model(model.as_str());
        let Some(encoder) = encoding.encoder() else {
            tracing::error!(
                encoding = encoding.name(),
                "Failed to initialize tiktoken encoder"
            );
            return Err(TokenEstimationError::EncoderUnavailable(encoding.name()));
        };
        let len = encoder.encode_ordinary(text).len();
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(
        &self,
        role: Role,
        content: &str,
        model: &ModelName,
    ) -> Result<u32, TokenEstimationError> {
        let content_tokens = self.count_str(content, model)?;
        let role_tokens = self.count_str(role.as_str(), model)?;
        Ok(content_tokens
            .saturating_add(role_tokens)
            .saturating_add(message_overhead(model.as_str())))
    }
}

/// Character-count estimator: `ceil(chars / 4)` plus a fixed overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    const CHARS_PER_TOKEN: usize = 4;
    const MESSAGE_OVERHEAD: u32 = 4;
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(
        &self,
        _role: Role,
        content: &str,
        _model: &ModelName,
    ) -> Result<u32, TokenEstimationError> {
        let chars = content.chars().count();
        let tokens = chars.div_ceil(Self::CHARS_PER_TOKEN);
        Ok(u32::try_from(tokens)
            .unwrap_or(u32::MAX)
            .saturating_add(Self::MESSAGE_OVERHEAD))
    }
}
