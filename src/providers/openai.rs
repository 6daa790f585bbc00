use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;

use super::retry::{RateLimit, send_json};
use super::{ChatProvider, ProviderFuture, ProviderKind, TokenUsage, ToolCall, ToolReply};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat completions with a forced function call. `OPENAI_BASE_URL` points it
/// at any compatible host.
#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    limit: RateLimit,
}

impl OpenAI {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
            limit: RateLimit::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(&self, call: &ToolCall) -> serde_json::Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": call.system},
                {"role": "user", "content": call.user}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": call.tool.name,
                    "description": call.tool.description,
                    "parameters": call.tool.parameters
                }
            }],
            "tool_choice": {"type": "function", "function": {"name": call.tool.name}}
        })
    }
}

impl ChatProvider for OpenAI {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn call_tool(&self, call: ToolCall) -> ProviderFuture {
        let provider = self.clone();
        Box::pin(async move {
            let body = provider.request_body(&call);
            let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
            let text = send_json("OpenAI", provider.limit, || {
                provider
                    .client
                    .post(&url)
                    .bearer_auth(&provider.key)
                    .json(&body)
            })
            .await?;
            parse_reply(&text, &call.tool.name, &provider.model)
        })
    }
}

#[derive(Debug, Deserialize)]
struct Completion {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    tool_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    function: FunctionArgs,
}

#[derive(Debug, Deserialize)]
struct FunctionArgs {
    name: String,
    /// JSON encoded as a string.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn parse_reply(text: &str, tool_name: &str, requested_model: &str) -> Result<ToolReply> {
    let completion: Completion =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let call = completion
        .choices
        .iter()
        .flat_map(|choice| choice.message.tool_calls.iter())
        .find(|call| call.function.name == tool_name)
        .ok_or_else(|| anyhow!("OpenAI returned no '{}' tool call", tool_name))?;
    let args = serde_json::from_str(&call.function.arguments)
        .with_context(|| "failed to parse OpenAI tool arguments")?;
    Ok(ToolReply {
        args,
        model: completion
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| requested_model.to_string()),
        usage: completion.usage.map(|usage| TokenUsage {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolSpec;

    const TOOL_RESPONSE: &str = r#"{
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{
            "message": {
                "tool_calls": [{
                    "function": {
                        "name": "deliver_translations",
                        "arguments": "{\"translations\":[{\"id\":0,\"text\":\"Hello\"}]}"
                    }
                }]
            }
        }],
        "usage": {"prompt_tokens": 120, "completion_tokens": 14, "total_tokens": 134}
    }"#;

    fn call() -> ToolCall {
        ToolCall {
            system: "system".to_string(),
            user: "user".to_string(),
            tool: ToolSpec {
                name: "deliver_translations".to_string(),
                description: "d".to_string(),
                parameters: json!({"type": "object"}),
            },
        }
    }

    #[test]
    fn extracts_tool_arguments() {
        let reply = parse_reply(TOOL_RESPONSE, "deliver_translations", DEFAULT_MODEL).unwrap();
        assert_eq!(reply.args["translations"][0]["text"], "Hello");
        assert_eq!(reply.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(reply.usage, Some(TokenUsage { input: 120, output: 14 }));
    }

    #[test]
    fn missing_tool_call_is_an_error() {
        let err = parse_reply(TOOL_RESPONSE, "something_else", DEFAULT_MODEL).unwrap_err();
        assert!(err.to_string().contains("no 'something_else' tool call"));
        let empty = parse_reply(r#"{"choices":[]}"#, "deliver_translations", DEFAULT_MODEL);
        assert!(empty.is_err());
    }

    #[test]
    fn request_forces_the_tool() {
        let provider = OpenAI::new("key").with_model("gpt-test");
        let body = provider.request_body(&call());
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
        assert_eq!(body["tool_choice"]["function"]["name"], "deliver_translations");
    }
}
