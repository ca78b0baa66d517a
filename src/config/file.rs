//! TOML configuration file loading
//!
//! Supports `~/.config/mibridge/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfigFile {
    /// Cloud account credentials
    #[serde(default)]
    pub account: AccountFileConfig,

    /// Speaker device selection
    #[serde(default)]
    pub devices: DevicesFileConfig,

    /// Poll loop tuning
    #[serde(default)]
    pub poll: PollFileConfig,

    /// Chat-completion provider
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// Home-automation bridge
    #[serde(default)]
    pub home_assistant: HomeAssistantFileConfig,

    /// Endpoint overrides
    #[serde(default)]
    pub endpoints: EndpointsFileConfig,
}

/// Cloud account section
#[derive(Debug, Default, Deserialize)]
pub struct AccountFileConfig {
    /// Account login (phone number or email)
    pub user: Option<String>,
    pub password: Option<String>,
    /// Credential record location
    pub token_path: Option<String>,
}

/// Device selection section
#[derive(Debug, Default, Deserialize)]
pub struct DevicesFileConfig {
    /// Preferred hardware model (e.g. "LX06")
    pub hardware: Option<String>,

    /// Selection string: "all" or 1-based indices like "1,3"
    pub selection: Option<String>,
}

/// Poll loop section
#[derive(Debug, Default, Deserialize)]
pub struct PollFileConfig {
    pub interval_ms: Option<u64>,
    pub fetch_timeout_ms: Option<u64>,
    pub record_limit: Option<u32>,
}

/// Chat provider section
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// Answer AI-triggered queries at all
    pub enabled: Option<bool>,
    /// Provider family ("openai", "bigmodel", "custom") or preset name
    pub api_type: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    /// Token budget for the whole conversation
    pub max_tokens: Option<usize>,
    pub system_prompt: Option<String>,
    /// Style hint appended to every question
    pub prompt: Option<String>,
    /// Trigger keywords for chat routing
    pub keywords: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
}

/// Home-automation section
#[derive(Debug, Default, Deserialize)]
pub struct HomeAssistantFileConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub text_entity_id: Option<String>,
    pub voice_agent_id: Option<String>,
    pub language: Option<String>,
    /// Keywords routing to the conversation agent
    pub voice_keywords: Option<Vec<String>>,
    /// Keywords routing to the text entity
    pub text_keywords: Option<Vec<String>>,
}

/// Endpoint overrides, mostly useful for testing against a local server
#[derive(Debug, Default, Deserialize)]
pub struct EndpointsFileConfig {
    pub account_base: Option<String>,
    pub mina_base: Option<String>,
    pub conversation_url: Option<String>,
}

/// Load the TOML config file from `path`, or from the standard path when `None`
///
/// Returns `BridgeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> BridgeConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return BridgeConfigFile::default();
    };

    if !path.exists() {
        return BridgeConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                BridgeConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            BridgeConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is invalid
pub fn parse_config(content: &str) -> crate::Result<BridgeConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/mibridge/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("mibridge").join("config.toml"))
}
