//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mibridge::chat::ChatBackend;
use mibridge::cloud::Device;
use mibridge::config::file::BridgeConfigFile;
use mibridge::home::HomeAutomation;
use mibridge::poll::{ConversationRecord, ConversationSource};
use mibridge::speech::{RetryPolicy, SpeechDispatcher, SpeechSink};
use mibridge::{Config, Error, IntentRouter, Result};
use tokio::sync::Mutex;

/// Configuration with defaults only
#[must_use]
pub fn test_config() -> Config {
    Config::from_sources(BridgeConfigFile::default(), |_| None).expect("default config")
}

/// A speaker with the given id
#[must_use]
pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("speaker-{id}"),
        hardware: "LX06".to_string(),
        capabilities: serde_json::Map::new(),
    }
}

/// Router with small keyword sets for every rule
#[must_use]
pub fn test_router() -> IntentRouter {
    IntentRouter::new(
        vec!["小周".to_string()],
        vec!["小爱".to_string()],
        vec!["请".to_string(), "帮我".to_string()],
    )
}

/// Conversation source returning whatever record was last set per device
#[derive(Default)]
pub struct MockSource {
    records: Mutex<HashMap<String, ConversationRecord>>,
    failing: Mutex<HashMap<String, fn() -> Error>>,
}

impl MockSource {
    pub async fn set(&self, device_id: &str, timestamp: i64, query: &str, reply: &str) {
        self.records.lock().await.insert(
            device_id.to_string(),
            ConversationRecord {
                timestamp,
                query: query.to_string(),
                reply: reply.to_string(),
            },
        );
    }

    pub async fn fail_with(&self, device_id: &str, err: fn() -> Error) {
        self.failing.lock().await.insert(device_id.to_string(), err);
    }
}

#[async_trait]
impl ConversationSource for MockSource {
    async fn latest(&self, device: &Device) -> Result<Option<ConversationRecord>> {
        if let Some(err) = self.failing.lock().await.get(&device.id) {
            return Err(err());
        }
        Ok(self.records.lock().await.get(&device.id).cloned())
    }
}

/// One call made on [`MockSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spoken {
    pub device_id: String,
    pub text: String,
    pub quiet: bool,
}

/// Speech sink recording every call, with scripted per-device failures
#[derive(Default)]
pub struct MockSink {
    calls: Mutex<Vec<Spoken>>,
    failures: Mutex<Vec<(String, Error)>>,
}

impl MockSink {
    /// Fail the next call to `device_id` with `err`
    pub async fn fail_next(&self, device_id: &str, err: Error) {
        self.failures.lock().await.push((device_id.to_string(), err));
    }

    pub async fn calls(&self) -> Vec<Spoken> {
        self.calls.lock().await.clone()
    }

    /// Non-quiet utterances only
    pub async fn spoken(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| !c.quiet)
            .map(|c| (c.device_id.clone(), c.text.clone()))
            .collect()
    }

    async fn record(&self, device_id: &str, text: &str, quiet: bool) -> Result<()> {
        self.calls.lock().await.push(Spoken {
            device_id: device_id.to_string(),
            text: text.to_string(),
            quiet,
        });

        let mut failures = self.failures.lock().await;
        match failures.iter().position(|(d, _)| d == device_id) {
            Some(i) => Err(failures.remove(i).1),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SpeechSink for MockSink {
    async fn speak(&self, device_id: &str, text: &str) -> Result<()> {
        self.record(device_id, text, false).await
    }

    async fn speak_quiet(&self, device_id: &str, text: &str) -> Result<()> {
        self.record(device_id, text, true).await
    }
}

/// Chat backend answering `chat:<question>`
#[derive(Default)]
pub struct MockChat {
    questions: Mutex<Vec<String>>,
}

impl MockChat {
    pub async fn questions(&self) -> Vec<String> {
        self.questions.lock().await.clone()
    }
}

#[async_trait]
impl ChatBackend for MockChat {
    async fn answer(&self, question: &str) -> String {
        self.questions.lock().await.push(question.to_string());
        format!("chat:{question}")
    }

    async fn reset(&self) {
        self.questions.lock().await.clear();
    }
}

/// Home-automation backend recording commands
#[derive(Default)]
pub struct MockHome {
    pub text_commands: Mutex<Vec<String>>,
    pub voice_commands: Mutex<Vec<String>>,
    pub failing: bool,
}

#[async_trait]
impl HomeAutomation for MockHome {
    async fn text_command(&self, command: &str) -> Result<String> {
        self.text_commands.lock().await.push(command.to_string());
        if self.failing {
            return Err(Error::HomeAutomation("bridge down".into()));
        }
        Ok(format!("执行成功：{command}"))
    }

    async fn voice_command(&self, text: &str) -> Result<String> {
        self.voice_commands.lock().await.push(text.to_string());
        if self.failing {
            return Err(Error::HomeAutomation("bridge down".into()));
        }
        Ok(format!("好的，{text}"))
    }
}

/// Dispatcher over `sink` with millisecond retry delays
#[must_use]
pub fn fast_dispatcher(sink: &Arc<MockSink>) -> SpeechDispatcher {
    SpeechDispatcher::new(Arc::clone(sink) as Arc<dyn SpeechSink>)
        .with_policy(RetryPolicy::device_busy().with_base_delay(Duration::from_millis(1)))
        .with_settle(Duration::ZERO)
}
