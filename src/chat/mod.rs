//! Streaming chat-completion client
//!
//! One call at a time per conversation: the history lock is held for the
//! whole call. The HTTP exchange runs on a spawned worker that the caller
//! joins under a hard deadline; on expiry the worker is told to stop, given
//! a short grace period, then aborted.

pub mod history;
pub mod normalize;
pub mod provider;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

pub use history::{ConversationHistory, Role, Turn};
pub use stream::StreamState;

use crate::config::ChatConfig;
use crate::{Error, Result};
use provider::RequestPlan;
use stream::Accumulator;

/// Spoken when the answer does not arrive in time
pub const TIMEOUT_MESSAGE: &str = "抱歉，AI回答超时，请稍后再试。";

/// Spoken when the provider call fails
pub const ERROR_MESSAGE: &str = "抱歉，AI回答出错，请稍后再试。";

/// Prepended once the conversation already has a prior turn
const CONTEXT_PREAMBLE: &str = "请根据我们之前的对话回答以下问题。\n";

/// How long a cancelled worker gets to notice before it is aborted
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Anything that can answer a chat question
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Answer `question`, falling back to a fixed apology on timeout or error
    async fn answer(&self, question: &str) -> String;

    /// Forget the conversation
    async fn reset(&self);
}

/// Chat-completion client with a bounded conversation window
pub struct StreamingChatClient {
    client: reqwest::Client,
    config: ChatConfig,
    history: Mutex<ConversationHistory>,
}

impl StreamingChatClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns `Config` if the system prompt alone exceeds the token budget
    pub fn new(config: ChatConfig, client: reqwest::Client) -> Result<Self> {
        let system = Turn::new(Role::System, config.system_prompt.clone());
        let used = provider::estimate_tokens(config.api_type, &config.model, [&system]);
        if used > config.max_tokens {
            return Err(Error::Config(format!(
                "system prompt uses ~{used} tokens, budget is {}",
                config.max_tokens
            )));
        }

        if config.api_key.expose_secret().is_empty() {
            tracing::warn!("chat api key is empty, requests will likely be rejected");
        }

        Ok(Self {
            client,
            config,
            history: Mutex::new(ConversationHistory::default()),
        })
    }

    /// Number of turns currently remembered
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Ask a question and wait for the full answer
    ///
    /// The user turn is only kept if an answer arrives.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` past the deadline, `Chat` on provider failure
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut history = self.history.lock().await;

        let mut prompt = String::new();
        if !history.is_empty() {
            prompt.push_str(CONTEXT_PREAMBLE);
        }
        prompt.push_str(question);
        if !self.config.style_prompt.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.config.style_prompt);
        }

        history.push(Turn::new(Role::User, prompt));

        let system = Turn::new(Role::System, self.config.system_prompt.clone());
        let (api_type, model, budget) = (
            self.config.api_type,
            self.config.model.as_str(),
            self.config.max_tokens,
        );
        history.truncate_until(|h| {
            provider::estimate_tokens(api_type, model, std::iter::once(&system).chain(h.iter()))
                <= budget
        });

        let messages: Vec<Turn> = std::iter::once(system).chain(history.iter().cloned()).collect();
        let used = provider::estimate_tokens(api_type, model, &messages);
        let plan = provider::build_request(&self.config, &messages, budget.saturating_sub(used));
        tracing::debug!(
            provider = ?plan.kind,
            url = %plan.url,
            turns = messages.len(),
            est_tokens = used,
            "sending chat request"
        );

        match self.run_worker(plan).await {
            Ok(raw) => {
                let answer = normalize::normalize(&raw);
                if answer.is_empty() {
                    history.rollback(Role::User);
                    return Err(Error::Chat("provider returned an empty answer".to_string()));
                }
                history.push(Turn::new(Role::Assistant, answer.clone()));
                Ok(answer)
            }
            Err(e) => {
                history.rollback(Role::User);
                Err(e)
            }
        }
    }

    /// Spawn the request worker and join it under the deadline
    async fn run_worker(&self, plan: RequestPlan) -> Result<String> {
        let state = Arc::new(StreamState::new());
        let mut worker = tokio::spawn(request_completion(
            self.client.clone(),
            self.config.api_key.clone(),
            plan,
            Arc::clone(&state),
        ));

        match tokio::time::timeout(self.config.timeout, &mut worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Chat(format!("chat worker failed: {e}"))),
            Err(_) => {
                state.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut worker).await.is_err() {
                    worker.abort();
                }
                tracing::warn!(
                    timeout_secs = self.config.timeout.as_secs(),
                    partial_chars = state.snapshot().chars().count(),
                    "chat answer timed out"
                );
                Err(Error::Timeout(format!(
                    "no answer within {}s",
                    self.config.timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl ChatBackend for StreamingChatClient {
    async fn answer(&self, question: &str) -> String {
        match self.ask(question).await {
            Ok(answer) => answer,
            Err(Error::Timeout(_)) => TIMEOUT_MESSAGE.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "chat request failed");
                ERROR_MESSAGE.to_string()
            }
        }
    }

    async fn reset(&self) {
        self.history.lock().await.clear();
        tracing::info!("conversation reset");
    }
}

/// Worker body: send the request and accumulate the answer into `state`
async fn request_completion(
    client: reqwest::Client,
    api_key: SecretString,
    plan: RequestPlan,
    state: Arc<StreamState>,
) -> Result<String> {
    let response = client
        .post(&plan.url)
        .bearer_auth(api_key.expose_secret().trim())
        .json(&plan.body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(provider_error(status, &body));
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if !plan.stream || is_json {
        let mut acc = Accumulator::new(&state);
        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedResponse(format!("completion body: {e}")))?;
        let text = stream::completion_text(&value)
            .ok_or_else(|| Error::MalformedResponse("completion without content".to_string()))?;
        acc.push(&text);
        return Ok(acc.finish());
    }

    stream::read_stream(response.bytes_stream(), &state).await
}

/// Describe a non-success provider response
fn provider_error(status: reqwest::StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").cloned())
        .map(|err| {
            let field = |k: &str| {
                err.get(k)
                    .map(|v| v.as_str().map_or_else(|| v.to_string(), ToString::to_string))
                    .unwrap_or_default()
            };
            format!(
                "{} (code: {}, type: {})",
                field("message"),
                field("code"),
                field("type")
            )
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    Error::Chat(format!("HTTP {status}: {detail}"))
}
