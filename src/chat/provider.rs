//! Provider detection, token estimation and request payload shaping

use serde_json::{Map, Value, json};

use super::history::Turn;
use crate::config::{ApiType, ChatConfig};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const DEEPSEEK_DEFAULT_BASE: &str = "https://api.deepseek.com";

/// Upper bound SiliconFlow accepts for `max_tokens`
const SILICONFLOW_MAX_TOKENS: usize = 512;

/// Payload family a provider expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    BigModel,
    DeepSeek,
    Volcengine,
    SiliconFlow,
    Qianfan,
    /// Any other OpenAI-compatible endpoint
    Generic,
}

impl ProviderKind {
    /// Detect from api type, model id and base URL
    #[must_use]
    pub fn detect(api_type: ApiType, model: &str, api_base: &str) -> Self {
        match api_type {
            ApiType::OpenAi => Self::OpenAi,
            ApiType::BigModel => Self::BigModel,
            ApiType::Custom => {
                if model == "deepseek-chat" {
                    Self::DeepSeek
                } else if model.contains("ark-model")
                    || model.contains("DeepSeek")
                    || api_base.contains("volces.com")
                {
                    Self::Volcengine
                } else if model.contains("QwQ-32B") || model.contains("Qwen/") {
                    Self::SiliconFlow
                } else if model.starts_with("ernie-") {
                    Self::Qianfan
                } else {
                    Self::Generic
                }
            }
        }
    }

    /// Whether the provider is asked for a streamed response
    #[must_use]
    pub const fn streams(self) -> bool {
        !matches!(self, Self::SiliconFlow)
    }
}

/// Characters per estimated token for a model
#[must_use]
pub fn chars_per_token(api_type: ApiType, model: &str) -> usize {
    let dense = model == "deepseek-chat"
        || model.contains("ark-model")
        || model.contains("QwQ-32B")
        || model.starts_with("ernie-")
        || api_type == ApiType::BigModel
        || model == "glm-4-flash"
        || model == "ai-virtual-mate";

    if dense {
        2
    } else if model.starts_with("gpt-") || model == "text-davinci-002-render-sha" {
        4
    } else {
        3
    }
}

/// Estimated tokens used by a message list
#[must_use]
pub fn estimate_tokens<'a>(
    api_type: ApiType,
    model: &str,
    turns: impl IntoIterator<Item = &'a Turn>,
) -> usize {
    let chars: usize = turns.into_iter().map(Turn::char_len).sum();
    chars / chars_per_token(api_type, model)
}

/// Fully shaped chat-completion request
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub kind: ProviderKind,
    pub url: String,
    pub body: Value,
    pub stream: bool,
}

/// Volcengine model aliases to deployable ids
fn volcengine_model(model: &str) -> &str {
    match model {
        "DeepSeek-R1" | "deepseek-r1" => "deepseek-r1-250120",
        "DeepSeek-V3" | "deepseek-v3" => "deepseek-v3-250324",
        "ark-model" => "doubao-1.5-pro-32k-250115",
        other => other,
    }
}

/// Build the request for `messages` with `remaining` tokens left in the budget
#[must_use]
pub fn build_request(config: &ChatConfig, messages: &[Turn], remaining: usize) -> RequestPlan {
    let kind = ProviderKind::detect(config.api_type, &config.model, &config.api_base);
    let remaining = remaining.max(1);
    let base = config.api_base.trim_end_matches('/');

    let mut fields = Map::new();
    fields.insert("model".into(), json!(config.model));
    fields.insert("messages".into(), json!(messages));
    fields.insert("stream".into(), json!(kind.streams()));
    fields.insert("temperature".into(), json!(config.temperature));
    fields.insert("top_p".into(), json!(config.top_p));

    let url = match kind {
        ProviderKind::OpenAi => {
            fields.insert("presence_penalty".into(), json!(config.presence_penalty));
            fields.insert("frequency_penalty".into(), json!(config.frequency_penalty));
            fields.insert("n".into(), json!(1));
            fields.insert("user".into(), json!("user"));
            fields.insert("max_tokens".into(), json!(remaining));
            let base = if base.is_empty() { OPENAI_DEFAULT_BASE } else { base };
            format!("{base}/chat/completions")
        }
        ProviderKind::BigModel => format!("{base}/chat/completions"),
        ProviderKind::DeepSeek => {
            fields.insert("max_tokens".into(), json!(remaining));
            let base = base.strip_suffix("/v1").unwrap_or(base);
            let base = if base.is_empty() { DEEPSEEK_DEFAULT_BASE } else { base };
            format!("{base}/chat/completions")
        }
        ProviderKind::Volcengine => {
            fields.insert("model".into(), json!(volcengine_model(&config.model)));
            fields.insert("max_tokens".into(), json!(remaining));
            format!("{base}/chat/completions")
        }
        ProviderKind::SiliconFlow => {
            fields.insert(
                "max_tokens".into(),
                json!(remaining.min(SILICONFLOW_MAX_TOKENS)),
            );
            fields.insert("frequency_penalty".into(), json!(0.5));
            fields.insert("top_k".into(), json!(50));
            fields.insert("response_format".into(), json!({ "type": "text" }));
            format!("{base}/chat/completions")
        }
        ProviderKind::Qianfan => {
            if config.model == "ernie-3.5" {
                fields.insert("model".into(), json!("ernie-3.5-8k"));
            }
            fields.insert("max_completion_tokens".into(), json!(remaining));
            format!("{base}/chat/completions")
        }
        ProviderKind::Generic => {
            fields.insert("max_tokens".into(), json!(remaining));
            format!("{base}/chat/completions")
        }
    };

    RequestPlan {
        kind,
        url,
        stream: kind.streams(),
        body: Value::Object(fields),
    }
}
