//! Chat-model backends that must answer through one forced tool call.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

mod claude;
mod openai;
pub(crate) mod retry;

pub use claude::Claude;
pub use openai::OpenAI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Claude,
}

impl ProviderKind {
    const ALL: [ProviderKind; 2] = [ProviderKind::OpenAI, ProviderKind::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Claude => "claude",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => openai::DEFAULT_MODEL,
            ProviderKind::Claude => claude::DEFAULT_MODEL,
        }
    }

    fn key_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
        }
    }

    fn from_name(name: &str) -> Option<ProviderKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAI),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

impl ProviderSelection {
    pub fn model(&self) -> String {
        self.requested_model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: serde_json::Value,
}

/// A system prompt, one user turn, and the tool the model has to answer with.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub system: String,
    pub user: String,
    pub tool: ToolSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone)]
pub struct ToolReply {
    pub args: serde_json::Value,
    /// Model that actually answered, as reported by the API.
    pub model: String,
    pub usage: Option<TokenUsage>,
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ToolReply>> + Send>>;

pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    fn call_tool(&self, call: ToolCall) -> ProviderFuture;
}

pub fn build_provider(provider: ProviderKind, key: String, model: String) -> Arc<dyn ChatProvider> {
    match provider {
        ProviderKind::OpenAI => Arc::new(OpenAI::new(key).with_model(model)),
        ProviderKind::Claude => Arc::new(Claude::new(key).with_model(model)),
    }
}

/// `model_arg` is `provider`, `provider:model` or absent. Without it the first
/// provider with a key in the environment wins, then OpenAI if only `--key`
/// was given.
pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    let Some(raw) = model_arg.map(str::trim) else {
        return ProviderKind::ALL
            .into_iter()
            .find(|kind| env_value(kind.key_var()).is_some())
            .or(override_key.map(|_| ProviderKind::OpenAI))
            .map(|provider| ProviderSelection {
                provider,
                requested_model: None,
            })
            .ok_or_else(|| {
                anyhow!("no API keys found (checked OPENAI_API_KEY, ANTHROPIC_API_KEY)")
            });
    };
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }
    let (name, model) = raw.split_once(':').unwrap_or((raw, ""));
    let provider = ProviderKind::from_name(name).ok_or_else(|| {
        anyhow!(
            "unable to infer provider from model '{}'. Use provider:model (openai:, claude:)",
            raw
        )
    })?;
    Ok(ProviderSelection {
        provider,
        requested_model: Some(model.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    })
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    override_key
        .map(str::to_string)
        .or_else(|| env_value(provider.key_var()))
        .ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Both APIs wrap failures as `{"error": {"message", "type", ...}}`.
pub(crate) fn api_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        error: ApiError,
    }

    #[derive(Deserialize)]
    struct ApiError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<serde_json::Value>,
    }

    let error = serde_json::from_str::<Envelope>(body).ok()?.error;
    let code = error.code.and_then(|code| match code {
        serde_json::Value::String(code) => Some(code),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    });
    let details = [error.kind, code]
        .into_iter()
        .flatten()
        .filter(|value| !value.trim().is_empty())
        .collect::<Vec<_>>();
    let message = error.message.filter(|message| !message.trim().is_empty());
    match (message, details.is_empty()) {
        (None, true) => None,
        (Some(message), true) => Some(message),
        (message, false) => Some(format!(
            "{} ({})",
            message.as_deref().unwrap_or("unknown error"),
            details.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_model_pairs() {
        let selection = resolve_provider_selection(Some("claude:claude-3-5-haiku-latest"), None).unwrap();
        assert_eq!(selection.provider, ProviderKind::Claude);
        assert_eq!(selection.model(), "claude-3-5-haiku-latest");

        let bare = resolve_provider_selection(Some("OpenAI"), None).unwrap();
        assert_eq!(bare.model(), openai::DEFAULT_MODEL);

        let empty_model = resolve_provider_selection(Some("anthropic: "), None).unwrap();
        assert_eq!(empty_model.requested_model, None);

        assert!(resolve_provider_selection(Some("gpt-4o"), None).is_err());
        assert!(resolve_provider_selection(Some("  "), None).is_err());
    }

    #[test]
    fn explicit_key_wins() {
        assert_eq!(
            resolve_key(ProviderKind::OpenAI, Some("sk-test")).unwrap(),
            "sk-test"
        );
    }

    #[test]
    fn reads_api_error_envelopes() {
        let openai = r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(
            api_error_message(openai).unwrap(),
            "Incorrect API key (invalid_request_error, invalid_api_key)"
        );
        let claude = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(api_error_message(claude).unwrap(), "Overloaded (overloaded_error)");
        assert_eq!(api_error_message(r#"{"error":{"code":null}}"#), None);
        assert_eq!(api_error_message("<html>bad gateway</html>"), None);
    }
}
