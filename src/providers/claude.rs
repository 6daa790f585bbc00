use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;

use super::retry::{RateLimit, send_json};
use super::{ChatProvider, ProviderFuture, ProviderKind, TokenUsage, ToolCall, ToolReply};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
pub(crate) const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const MAX_TOKENS: u32 = 4096;

/// Anthropic messages API with `tool_choice` pinned to one tool.
#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    url: String,
    client: reqwest::Client,
    limit: RateLimit,
}

impl Claude {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            url: std::env::var("ANTHROPIC_BASE_URL")
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

    fn request_body(&self, call: &ToolCall) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": call.user}]
            }],
            "tools": [{
                "name": call.tool.name,
                "description": call.tool.description,
                "input_schema": call.tool.parameters
            }],
            "tool_choice": {"type": "tool", "name": call.tool.name}
        });
        if !call.system.trim().is_empty() {
            body["system"] = json!(call.system);
        }
        body
    }
}

impl ChatProvider for Claude {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn call_tool(&self, call: ToolCall) -> ProviderFuture {
        let provider = self.clone();
        Box::pin(async move {
            let body = provider.request_body(&call);
            let text = send_json("Claude", provider.limit, || {
                provider
                    .client
                    .post(&provider.url)
                    .header("x-api-key", &provider.key)
                    .header("anthropic-version", API_VERSION)
                    .json(&body)
            })
            .await?;
            parse_reply(&text, &call.tool.name, &provider.model)
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessageReply {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn parse_reply(text: &str, tool_name: &str, requested_model: &str) -> Result<ToolReply> {
    let reply: MessageReply =
        serde_json::from_str(text).with_context(|| "failed to parse Claude response JSON")?;
    let args = reply
        .content
        .into_iter()
        .find_map(|block| match block {
            ContentBlock::ToolUse { name, input } if name == tool_name => Some(input),
            _ => None,
        })
        .ok_or_else(|| anyhow!("Claude returned no '{}' tool_use block", tool_name))?;
    Ok(ToolReply {
        args,
        model: reply
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| requested_model.to_string()),
        usage: reply.usage.map(|usage| TokenUsage {
            input: usage.input_tokens,
            output: usage.output_tokens,
        }),
    })
}
