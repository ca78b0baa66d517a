//! Configuration management for mibridge
//!
//! Values are layered env > TOML file > defaults, the same way for every section.

pub mod file;
pub mod presets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

pub use presets::{ApiType, Preset};

use crate::{Error, Result};

/// Hard ceiling for the chat token budget
pub const MAX_TOKEN_BUDGET: usize = 4000;

/// Default chat trigger keywords
pub const DEFAULT_CHAT_KEYWORDS: &[&str] = &["请", "帮我", "问一下", "AI"];

/// mibridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Cloud account
    pub account: AccountConfig,

    /// Device selection
    pub devices: DeviceConfig,

    /// Poll loop tuning
    pub poll: PollConfig,

    /// Chat-completion provider
    pub chat: ChatConfig,

    /// Home-automation bridge
    pub home_assistant: HomeAssistantConfig,

    /// Remote endpoints
    pub endpoints: Endpoints,
}

/// Cloud account configuration
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account login
    pub user: String,

    /// Account password
    pub password: SecretString,

    /// Credential record path (`~/.<user>.mi.token` by default)
    pub token_path: PathBuf,
}

/// Device selection configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Preferred hardware model for the primary device
    pub hardware: String,

    /// Selection string, `None` means the first device only
    pub selection: Option<String>,
}

/// Poll loop configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Sleep between ticks
    pub interval: Duration,

    /// Deadline of the conversation HTTP request itself, not of any relogin
    pub fetch_timeout: Duration,

    /// Records requested per fetch
    pub record_limit: u32,
}

/// Chat-completion configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Runtime default for the AI toggle
    pub enabled: bool,
    pub api_type: ApiType,
    pub api_base: String,
    pub api_key: SecretString,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    /// Token budget for the whole conversation
    pub max_tokens: usize,
    pub system_prompt: String,
    /// Style hint appended to every question
    pub style_prompt: String,
    /// Trigger keywords
    pub keywords: Vec<String>,
    /// Hard deadline for one answer
    pub timeout: Duration,
}

/// Home-automation bridge configuration
#[derive(Debug, Clone, Default)]
pub struct HomeAssistantConfig {
    pub url: Option<String>,
    pub token: Option<SecretString>,
    pub text_entity_id: Option<String>,
    pub voice_agent_id: Option<String>,
    pub language: String,
    /// Keywords routing to the conversation agent
    pub voice_keywords: Vec<String>,
    /// Keywords routing to the text entity
    pub text_keywords: Vec<String>,
}

impl HomeAssistantConfig {
    /// Whether enough is configured to make calls
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.url.is_some() && self.token.is_some()
    }
}

/// Remote endpoints
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Account service base (`.../pass`)
    pub account_base: String,

    /// Device-cloud API base
    pub mina_base: String,

    /// Conversation history endpoint polled for new queries
    pub conversation_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            account_base: "https://account.xiaomi.com/pass".to_string(),
            mina_base: "https://api2.mina.mi.com".to_string(),
            conversation_url: "https://userprofile.mina.mi.com/device_profile/v2/conversation"
                .to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(
        fc: file::BridgeConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let user = env("MI_USER").or(fc.account.user).unwrap_or_default();
        let password = env("MI_PASS").or(fc.account.password).unwrap_or_default();
        let token_path = env("MIBRIDGE_TOKEN_PATH")
            .or(fc.account.token_path)
            .map_or_else(|| default_token_path(&user), PathBuf::from);

        let account = AccountConfig {
            user,
            password: SecretString::from(password),
            token_path,
        };

        let devices = DeviceConfig {
            hardware: fc.devices.hardware.unwrap_or_else(|| "LX06".to_string()),
            selection: env("MIBRIDGE_DEVICES").or(fc.devices.selection),
        };

        let poll = PollConfig {
            interval: Duration::from_millis(fc.poll.interval_ms.unwrap_or(50)),
            fetch_timeout: Duration::from_millis(fc.poll.fetch_timeout_ms.unwrap_or(3000)),
            record_limit: fc.poll.record_limit.unwrap_or(5),
        };

        // A preset name in api_type fills in base URL and model when those are empty
        let api_type_raw = env("MIBRIDGE_API_TYPE")
            .or(fc.chat.api_type)
            .unwrap_or_else(|| "custom".to_string());
        let preset = presets::preset(&api_type_raw);
        let api_type = preset.map_or_else(
            || api_type_raw.parse().unwrap_or_default(),
            |p| p.api_type,
        );
        let api_base = env("MIBRIDGE_API_BASE")
            .or(fc.chat.api_base)
            .filter(|s| !s.is_empty())
            .or_else(|| preset.map(|p| p.api_base.to_string()))
            .unwrap_or_default();
        let model = env("MIBRIDGE_MODEL")
            .or(fc.chat.model)
            .filter(|s| !s.is_empty())
            .or_else(|| preset.map(|p| p.model.to_string()))
            .unwrap_or_default();

        let max_tokens = fc.chat.max_tokens.unwrap_or(3000);
        if max_tokens > MAX_TOKEN_BUDGET {
            return Err(Error::Config(format!(
                "chat.max_tokens {max_tokens} exceeds {MAX_TOKEN_BUDGET}"
            )));
        }

        let chat = ChatConfig {
            enabled: fc.chat.enabled.unwrap_or(true),
            api_type,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: SecretString::from(
                env("MIBRIDGE_API_KEY")
                    .or(fc.chat.api_key)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            ),
            model,
            temperature: fc.chat.temperature.unwrap_or(0.5),
            top_p: fc.chat.top_p.unwrap_or(1.0),
            presence_penalty: fc.chat.presence_penalty.unwrap_or(0.0),
            frequency_penalty: fc.chat.frequency_penalty.unwrap_or(0.0),
            max_tokens,
            system_prompt: fc.chat.system_prompt.unwrap_or_else(|| {
                "You are ChatGPT, a large language model trained by OpenAI. Respond conversationally"
                    .to_string()
            }),
            style_prompt: fc.chat.prompt.unwrap_or_else(|| {
                "请用自然、友好的语气回答，像朋友一样交流，避免过于机械的回复".to_string()
            }),
            keywords: fc.chat.keywords.unwrap_or_else(|| {
                DEFAULT_CHAT_KEYWORDS.iter().map(ToString::to_string).collect()
            }),
            timeout: Duration::from_secs(fc.chat.timeout_secs.unwrap_or(30)),
        };

        let ha = fc.home_assistant;
        let home_assistant = HomeAssistantConfig {
            url: env("HA_URL")
                .or(ha.url)
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches('/').to_string()),
            token: env("HA_TOKEN")
                .or(ha.token)
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            text_entity_id: ha.text_entity_id.filter(|s| !s.is_empty()),
            voice_agent_id: ha.voice_agent_id.filter(|s| !s.is_empty()),
            language: ha.language.unwrap_or_else(|| "zh-CN".to_string()),
            voice_keywords: ha
                .voice_keywords
                .unwrap_or_else(|| vec!["小周".into(), "小洲".into(), "小舟".into()]),
            text_keywords: ha.text_keywords.unwrap_or_else(|| vec!["小爱".into()]),
        };

        let defaults = Endpoints::default();
        let endpoints = Endpoints {
            account_base: fc.endpoints.account_base.unwrap_or(defaults.account_base),
            mina_base: fc.endpoints.mina_base.unwrap_or(defaults.mina_base),
            conversation_url: fc
                .endpoints
                .conversation_url
                .unwrap_or(defaults.conversation_url),
        };

        Ok(Self {
            account,
            devices,
            poll,
            chat,
            home_assistant,
            endpoints,
        })
    }

    /// Ensure account credentials are present
    ///
    /// # Errors
    ///
    /// Returns error if user or password is empty
    pub fn require_account(&self) -> Result<()> {
        use secrecy::ExposeSecret;

        if self.account.user.is_empty() || self.account.password.expose_secret().is_empty() {
            return Err(Error::Config(
                "account user and password are required (MI_USER / MI_PASS)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default credential record path: `~/.<user>.mi.token`
fn default_token_path(user: &str) -> PathBuf {
    let file_name = format!(".{user}.mi.token");
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from(&file_name), |d| d.home_dir().join(&file_name))
}
