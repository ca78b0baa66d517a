//! Home-automation bridge client
//!
//! Two bearer-authenticated REST calls: a text command written into a text
//! entity, and a voice command handed to a conversation agent.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::HomeAssistantConfig;
use crate::speech::retry::{self, RetryPolicy};
use crate::{Error, Result};

/// Spoken when a home-automation call fails
pub const FALLBACK_MESSAGE: &str = "抱歉，HomeAssistant处理出错，请稍后再试。";

/// Returned when the conversation agent answers in an unknown shape
const UNEXPECTED_SHAPE: &str = "处理成功，但返回格式不符合预期";

/// Placeholder in entity state that stands for the spoken command
const COMMAND_PLACEHOLDER: &str = "{lv=stt}";

const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const VOICE_TIMEOUT: Duration = Duration::from_secs(20);

/// Home-automation backend
#[async_trait]
pub trait HomeAutomation: Send + Sync {
    /// Write `command` into the configured text entity
    async fn text_command(&self, command: &str) -> Result<String>;

    /// Hand `text` to the configured conversation agent
    async fn voice_command(&self, text: &str) -> Result<String>;
}

/// Client for a Home Assistant instance
pub struct HomeAssistantClient {
    client: reqwest::Client,
    url: String,
    token: SecretString,
    text_entity_id: Option<String>,
    voice_agent_id: Option<String>,
    language: String,
    policy: RetryPolicy,
}

impl HomeAssistantClient {
    /// Create a client, `None` when url or token is missing
    #[must_use]
    pub fn from_config(config: &HomeAssistantConfig, client: reqwest::Client) -> Option<Self> {
        let url = config.url.clone()?;
        let token = config.token.clone()?;

        Some(Self {
            client,
            url,
            token,
            text_entity_id: config.text_entity_id.clone(),
            voice_agent_id: config.voice_agent_id.clone(),
            language: config.language.clone(),
            policy: RetryPolicy::home_automation(),
        })
    }

    /// Replace the transport retry policy
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn post(&self, path: &str, body: &serde_json::Value, timeout: Duration) -> Result<String> {
        let url = format!("{}{path}", self.url);

        retry::retry(&self.policy, Error::is_transient, || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(self.token.expose_secret())
                .json(body)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, Error>(response.text().await?)
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct EntityState {
    state: Option<String>,
}

#[async_trait]
impl HomeAutomation for HomeAssistantClient {
    async fn text_command(&self, command: &str) -> Result<String> {
        let entity_id = self
            .text_entity_id
            .as_deref()
            .ok_or_else(|| Error::Config("home_assistant.text_entity_id is not set".to_string()))?;

        tracing::debug!(entity_id, command, "sending text command");
        let body = self
            .post(
                "/api/services/text/set_value",
                &json!({ "entity_id": entity_id, "value": command }),
                TEXT_TIMEOUT,
            )
            .await?;

        let states: Vec<EntityState> = serde_json::from_str(&body)
            .map_err(|e| Error::HomeAutomation(format!("unexpected text service body: {e}")))?;

        Ok(states.first().map_or_else(
            || "指令已执行".to_string(),
            |s| {
                let state = s.state.as_deref().unwrap_or("操作完成");
                format!("执行成功：{state}").replace(COMMAND_PLACEHOLDER, command)
            },
        ))
    }

    async fn voice_command(&self, text: &str) -> Result<String> {
        let agent_id = self
            .voice_agent_id
            .as_deref()
            .ok_or_else(|| Error::Config("home_assistant.voice_agent_id is not set".to_string()))?;

        tracing::debug!(agent_id, text, "sending voice command");
        let body = self
            .post(
                "/api/conversation/process",
                &json!({ "agent_id": agent_id, "text": text, "language": self.language }),
                VOICE_TIMEOUT,
            )
            .await?;

        let value: serde_json::Value = serde_json::from_str(&body)?;
        Ok(value
            .pointer("/response/speech/plain/speech")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| UNEXPECTED_SHAPE.to_string(), ToString::to_string))
    }
}
