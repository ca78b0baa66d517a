//! Built-in chat provider presets

use std::fmt;
use std::str::FromStr;

/// Wire family of a chat-completion provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiType {
    /// `OpenAI` proper
    OpenAi,
    /// Zhipu `BigModel`
    BigModel,
    /// Any other OpenAI-compatible endpoint
    #[default]
    Custom,
}

impl FromStr for ApiType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "bigmodel" => Self::BigModel,
            _ => Self::Custom,
        })
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::BigModel => write!(f, "bigmodel"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// A named provider preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub api_type: ApiType,
    pub api_base: &'static str,
    pub model: &'static str,
}

const PRESETS: &[Preset] = &[
    Preset {
        name: "openai",
        api_type: ApiType::OpenAi,
        api_base: "https://api.openai.com/v1",
        model: "gpt-3.5-turbo",
    },
    Preset {
        name: "bigmodel",
        api_type: ApiType::BigModel,
        api_base: "https://open.bigmodel.cn/api/paas/v4",
        model: "glm-4-flash",
    },
    Preset {
        name: "deepseek",
        api_type: ApiType::Custom,
        api_base: "https://api.deepseek.com/v1",
        model: "deepseek-chat",
    },
    Preset {
        name: "moonshot",
        api_type: ApiType::Custom,
        api_base: "https://api.moonshot.cn/v1",
        model: "moonshot-v1-8k",
    },
    Preset {
        name: "qwen",
        api_type: ApiType::Custom,
        api_base: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        model: "qwen-turbo",
    },
    Preset {
        name: "claude",
        api_type: ApiType::Custom,
        api_base: "https://api.anthropic.com/v1",
        model: "claude-3-haiku-20240307",
    },
    Preset {
        name: "volcengine",
        api_type: ApiType::Custom,
        api_base: "https://api.volcengine.com/v1",
        model: "doubao-pro",
    },
    Preset {
        name: "siliconflow",
        api_type: ApiType::Custom,
        api_base: "https://api.siliconflow.cn/v1",
        model: "silicon-copilot-pro",
    },
    Preset {
        name: "qianfan",
        api_type: ApiType::Custom,
        api_base: "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat",
        model: "ernie-bot-4",
    },
];

/// Look up a preset by name (case-insensitive)
#[must_use]
pub fn preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// All known preset names
pub fn preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.name)
}
