use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tera::{Context as TeraContext, Tera};
use tracing::debug;

use crate::providers::{ChatProvider, ToolCall, ToolSpec};

use super::{TranslationFuture, TranslationItem, TranslationProvider, TranslationRequest};

pub const TOOL_NAME: &str = "deliver_translations";

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.tera");

/// Translates a chunk with one forced tool call on a chat model.
#[derive(Clone)]
pub struct LlmTranslator {
    provider: Arc<dyn ChatProvider>,
    name: String,
}

impl LlmTranslator {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        let name = format!("{}:{}", provider.kind().as_str(), provider.model());
        Self { provider, name }
    }
}

impl TranslationProvider for LlmTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, request: TranslationRequest) -> TranslationFuture {
        let provider = Arc::clone(&self.provider);
        Box::pin(async move {
            let call = ToolCall {
                system: render_system_prompt(
                    &request.source_language,
                    &request.target_language,
                    request.texts.len(),
                )?,
                user: render_user_input(&request.texts)?,
                tool: tool_spec(),
            };
            let reply = provider.call_tool(call).await?;
            if let Some(usage) = reply.usage {
                debug!(
                    "{} used {} input / {} output tokens",
                    reply.model, usage.input, usage.output
                );
            }
            parse_tool_args(reply.args, &request.target_language)
        })
    }
}

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Return one translation per input item, keyed by the item id.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "target_language": {"type": "string"},
                "translations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "text": {"type": "string"}
                        },
                        "required": ["id", "text"]
                    }
                }
            },
            "required": ["target_language", "translations"]
        }),
    }
}

pub fn render_system_prompt(source_lang: &str, target_lang: &str, item_count: usize) -> Result<String> {
    let mut context = TeraContext::new();
    let source_lang = if source_lang.trim().is_empty() {
        "auto"
    } else {
        source_lang.trim()
    };
    context.insert("source_lang", source_lang);
    context.insert("target_lang", target_lang.trim());
    context.insert("tool_name", TOOL_NAME);
    context.insert("item_count", &item_count);
    Tera::one_off(SYSTEM_PROMPT_TEMPLATE, &context, false)
        .with_context(|| "failed to render system prompt")
}

fn render_user_input(texts: &[String]) -> Result<String> {
    let items = texts
        .iter()
        .enumerate()
        .map(|(id, text)| json!({"id": id, "text": text}))
        .collect::<Vec<_>>();
    serde_json::to_string(&json!({ "items": items }))
        .with_context(|| "failed to encode translation items")
}

#[derive(Debug, Deserialize)]
struct ToolArgs {
    #[serde(default)]
    target_language: Option<String>,
    translations: Vec<ToolItem>,
}

#[derive(Debug, Deserialize)]
struct ToolItem {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    text: String,
}

fn parse_tool_args(value: serde_json::Value, expected_target: &str) -> Result<Vec<TranslationItem>> {
    let args: ToolArgs =
        serde_json::from_value(value).with_context(|| "tool response has an unexpected shape")?;
    if let Some(target) = args.target_language.as_deref()
        && !target.trim().is_empty()
        && !target.trim().eq_ignore_ascii_case(expected_target.trim())
    {
        return Err(anyhow!(
            "tool response target_language mismatch (expected '{}', got '{}')",
            expected_target,
            target
        ));
    }
    Ok(args
        .translations
        .into_iter()
        .map(|item| TranslationItem {
            index: item.id.and_then(|id| usize::try_from(id).ok()),
            text: item.text,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderFuture, ProviderKind, ToolReply};
    use std::sync::Mutex;

    struct EchoModel {
        seen: Mutex<Vec<ToolCall>>,
    }

    impl ChatProvider for EchoModel {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Claude
        }

        fn model(&self) -> &str {
            "echo-1"
        }

        fn call_tool(&self, call: ToolCall) -> ProviderFuture {
            self.seen.lock().unwrap().push(call);
            Box::pin(async {
                Ok(ToolReply {
                    args: json!({
                        "target_language": "en",
                        "translations": [{"id": 1, "text": "B"}, {"id": 0, "text": "A"}]
                    }),
                    model: "echo-1".to_string(),
                    usage: None,
                })
            })
        }
    }

    #[tokio::test]
    async fn translator_sends_one_forced_tool_call() {
        let model = Arc::new(EchoModel {
            seen: Mutex::new(Vec::new()),
        });
        let translator = LlmTranslator::new(model.clone());
        assert_eq!(translator.name(), "claude:echo-1");

        let items = translator
            .translate(TranslationRequest {
                texts: vec!["あ".to_string(), "い".to_string()],
                source_language: "ja".to_string(),
                target_language: "en".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(items[0].index, Some(1));
        assert_eq!(items[1].text, "A");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tool.name, TOOL_NAME);
        assert!(seen[0].system.contains("Target language: en"));
        assert!(seen[0].user.contains(r#""id":1"#));
    }

    #[test]
    fn parses_indexed_items() {
        let items = parse_tool_args(
            json!({
                "target_language": "EN",
                "translations": [
                    {"id": 1, "text": "Wait!"},
                    {"id": -3, "text": "bad id"},
                    {"text": "no id"}
                ]
            }),
            "en",
        )
        .unwrap();
        assert_eq!(items[0].index, Some(1));
        assert_eq!(items[1].index, None);
        assert_eq!(items[2].index, None);
        assert_eq!(items[2].text, "no id");
    }

    #[test]
    fn rejects_wrong_target_language() {
        let err = parse_tool_args(
            json!({"target_language": "fr", "translations": []}),
            "en",
        )
        .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn user_input_lists_items_with_ids() {
        let input = render_user_input(&["こんにちは".to_string(), "待って".to_string()]).unwrap();
        insta::assert_snapshot!(input, @r#"{"items":[{"id":0,"text":"こんにちは"},{"id":1,"text":"待って"}]}"#);
    }

    #[test]
    fn system_prompt_names_languages_and_tool() {
        let prompt = render_system_prompt("ja", "en", 3).unwrap();
        assert!(prompt.contains("Source language: ja"));
        assert!(prompt.contains("Target language: en"));
        assert!(prompt.contains("`deliver_translations`"));
        assert!(prompt.contains("the 3 translation(s)"));
    }
}
