//! User-facing error text.

use std::fmt::Write;

use relay_providers::{ProviderError, StreamError};
use relay_types::ModelName;

use crate::TurnError;

const ERROR_BADGE: &str = "[Error]";
const STREAM_ERROR_BADGE: &str = "[Stream error]";
const MAX_DETAIL_CHARS: usize = 200;

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Explains why the provider could not be called.
#[must_use]
pub fn format_provider_error(err: &ProviderError, model: &ModelName) -> String {
    let mut content = String::new();
    content.push_str(ERROR_BADGE);
    content.push_str("\n\n");

    if err.is_auth() {
        let _ = write!(content, "OpenAI authentication failed for model {model}.");
        let config_hint = relay_config::config_path().map_or_else(
            || "~/.relay/config.toml".to_string(),
            |p| p.display().to_string(),
        );
        let _ = write!(
            content,
            "\n\nFix:\n- Set {} (env) or add api_key to {config_hint} under [openai].",
            relay_config::ENV_OPENAI_API_KEY
        );
        if let ProviderError::Http { status, .. } = err {
            let _ = write!(content, "\n\nDetails: {status}");
        }
        return content;
    }

    match err {
        ProviderError::Http { status, message } => {
            let _ = write!(content, "Request failed ({status}).");
            let detail = truncate_with_ellipsis(message, MAX_DETAIL_CHARS);
            if !detail.is_empty() {
                content.push_str("\n\nDetails: ");
                content.push_str(&detail);
            }
        }
        ProviderError::Connection { attempts, .. } => {
            let _ = write!(
                content,
                "Could not reach the model provider after {attempts} attempts. Please try again."
            );
        }
        ProviderError::Request(e) | ProviderError::Build(e) => {
            content.push_str("Request failed.\n\nDetails: ");
            content.push_str(&truncate_with_ellipsis(&e.to_string(), MAX_DETAIL_CHARS));
        }
    }
    content
}

/// Sent after a partial answer when the stream broke.
#[must_use]
pub fn format_stream_error(err: &StreamError) -> String {
    let detail = truncate_with_ellipsis(&err.message, MAX_DETAIL_CHARS);
    let detail = if detail.is_empty() {
        "unknown error"
    } else {
        detail.as_str()
    };
    format!("{STREAM_ERROR_BADGE}\n\nThe answer was interrupted: {detail}")
}

#[must_use]
pub fn format_turn_error(err: &TurnError, model: &ModelName) -> String {
    match err {
        TurnError::ProviderInvocation(e) => format_provider_error(e, model),
        TurnError::Task(_) => format!("{ERROR_BADGE}\n\nSomething went wrong. Please try again."),
    }
}
