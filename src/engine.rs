//! Engine - the poll, route and speak loop
//!
//! One task drives everything: each tick fetches all selected devices
//! concurrently, then handles the new queries one after another. A chat
//! call therefore holds up the rest of the tick until it answers or times
//! out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

use crate::chat::{ChatBackend, ERROR_MESSAGE};
use crate::cloud::Device;
use crate::config::{Config, DeviceConfig};
use crate::home::{FALLBACK_MESSAGE, HomeAutomation};
use crate::intent::{Intent, IntentRouter};
use crate::poll::{ConversationSource, NewQuery, PollEngine};
use crate::speech::SpeechDispatcher;
use crate::{Error, Result};

/// Runtime switches shared by the engine and the console
#[derive(Debug, Clone)]
pub struct EngineState {
    /// Whether chat keywords route to the chat backend
    pub ai_enabled: bool,
    /// Whether ticks process device input at all
    pub auto_process: bool,
    /// Devices polled and spoken to, in selection order
    pub selected: Vec<Device>,
    /// Cleared to stop the engine
    pub running: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            auto_process: true,
            selected: Vec::new(),
            running: true,
        }
    }
}

/// Engine state behind a shared lock
pub type SharedState = Arc<RwLock<EngineState>>;

/// What happened to one new query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub intent: Intent,
    /// Spoken answer, `None` for passthrough
    pub answer: Option<String>,
    /// Whether any device accepted the answer
    pub delivered: bool,
}

/// The polling-and-dispatch engine
pub struct Engine {
    state: SharedState,
    router: IntentRouter,
    poller: PollEngine,
    speech: Arc<SpeechDispatcher>,
    chat: Option<Arc<dyn ChatBackend>>,
    home: Option<Arc<dyn HomeAutomation>>,
    interval: Duration,
    primed: HashSet<String>,
}

impl Engine {
    /// Create an engine polling `source` and speaking through `speech`
    #[must_use]
    pub fn new(
        source: Arc<dyn ConversationSource>,
        speech: Arc<SpeechDispatcher>,
        router: IntentRouter,
        config: &Config,
    ) -> Self {
        let state = EngineState {
            ai_enabled: config.chat.enabled,
            ..EngineState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            router,
            poller: PollEngine::new(source),
            speech,
            chat: None,
            home: None,
            interval: config.poll.interval,
            primed: HashSet::new(),
        }
    }

    /// Route chat-triggered queries to `chat`
    #[must_use]
    pub fn with_chat(mut self, chat: Arc<dyn ChatBackend>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Route home-automation queries to `home`
    #[must_use]
    pub fn with_home(mut self, home: Arc<dyn HomeAutomation>) -> Self {
        self.home = Some(home);
        self
    }

    /// Handle to the shared state
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Poller, for inspecting watermarks
    #[must_use]
    pub const fn poller(&self) -> &PollEngine {
        &self.poller
    }

    /// Select devices and prime their watermarks
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` for an empty device list, or a fatal fetch error
    pub async fn start(&mut self, devices: &[Device], config: &DeviceConfig) -> Result<()> {
        let primary = primary_device(devices, &config.hardware).ok_or(Error::NoDevicesFound)?;
        tracing::info!(
            device = %primary.display_name(),
            hardware = %primary.hardware,
            "primary device"
        );

        let selected = resolve_selection(devices, config.selection.as_deref(), primary);
        tracing::info!(
            devices = %names(&selected),
            count = selected.len(),
            "selected devices"
        );
        self.state.write().await.selected = selected;

        self.prime_new().await
    }

    /// Run until shutdown is requested or the state stops running
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised by a tick
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        tracing::info!(interval = ?self.interval, "engine running");

        loop {
            let (running, auto_process) = {
                let state = self.state.read().await;
                (state.running, state.auto_process)
            };
            if !running {
                break;
            }

            if auto_process {
                match self.tick().await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!(error = %e, "tick failed"),
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        self.state.write().await.running = false;
        Ok(())
    }

    /// Poll once and handle every new query in device order
    ///
    /// # Errors
    ///
    /// Returns only fatal poll errors
    pub async fn tick(&mut self) -> Result<Vec<Dispatch>> {
        self.prime_new().await?;

        let selected = self.state.read().await.selected.clone();
        let queries = self.poller.tick(&selected).await?;

        let mut dispatched = Vec::with_capacity(queries.len());
        for query in queries {
            dispatched.push(self.handle_query(&query, &selected).await);
        }
        Ok(dispatched)
    }

    /// Classify one query, call its backend and speak the answer
    pub async fn handle_query(&self, query: &NewQuery, selected: &[Device]) -> Dispatch {
        let routed = {
            let state = self.state.read().await;
            self.router.route(&query.query, &state)
        };
        tracing::info!(
            device = %query.device.display_name(),
            query = %query.query,
            intent = ?routed.intent,
            "new query"
        );

        if routed.intent.interrupts_device() {
            self.speech.interrupt(&query.device).await;
        }

        let answer = match routed.intent {
            Intent::Passthrough => {
                if query.reply.is_empty() {
                    tracing::info!(device = %query.device.display_name(), "device gave no reply");
                } else {
                    tracing::info!(device = %query.device.display_name(), reply = %query.reply, "device reply");
                }
                return Dispatch {
                    intent: routed.intent,
                    answer: None,
                    delivered: false,
                };
            }
            Intent::HomeAutomationVoice | Intent::HomeAutomationText => {
                self.ask_home(routed.intent, &routed.cleaned).await
            }
            Intent::ChatAi => self.ask_chat(&routed.cleaned).await,
        };

        tracing::info!(device = %query.device.display_name(), answer = %answer, "answer");
        let delivered = self
            .speech
            .speak_with_failover(&query.device, selected, &answer)
            .await;

        Dispatch {
            intent: routed.intent,
            answer: Some(answer),
            delivered,
        }
    }

    async fn ask_home(&self, intent: Intent, command: &str) -> String {
        let Some(home) = &self.home else {
            tracing::warn!("home automation query without a configured bridge");
            return FALLBACK_MESSAGE.to_string();
        };

        let result = if intent == Intent::HomeAutomationVoice {
            home.voice_command(command).await
        } else {
            home.text_command(command).await
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "home automation call failed");
            FALLBACK_MESSAGE.to_string()
        })
    }

    async fn ask_chat(&self, question: &str) -> String {
        match &self.chat {
            Some(chat) => chat.answer(question).await,
            None => {
                tracing::warn!("chat query without a configured backend");
                ERROR_MESSAGE.to_string()
            }
        }
    }

    /// Prime watermarks for selected devices not seen before
    async fn prime_new(&mut self) -> Result<()> {
        let fresh: Vec<Device> = self
            .state
            .read()
            .await
            .selected
            .iter()
            .filter(|d| !self.primed.contains(&d.id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        self.poller.prime(&fresh).await?;
        self.primed.extend(fresh.into_iter().map(|d| d.id));
        Ok(())
    }
}

/// Device with the preferred hardware model, else the first device
#[must_use]
pub fn primary_device<'a>(devices: &'a [Device], hardware: &str) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.hardware == hardware)
        .or_else(|| {
            if !devices.is_empty() {
                tracing::info!(hardware, "preferred hardware not found, using first device");
            }
            devices.first()
        })
}

/// Parse `"all"` or 1-based `"1,3"` into device indices
///
/// Out-of-range numbers are dropped. Returns `None` on a malformed list or
/// when nothing valid remains.
#[must_use]
pub fn parse_selection(selection: &str, count: usize) -> Option<Vec<usize>> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case("all") {
        return (count > 0).then(|| (0..count).collect());
    }

    let mut indices = Vec::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let n: usize = part.parse().ok()?;
        if (1..=count).contains(&n) && !indices.contains(&(n - 1)) {
            indices.push(n - 1);
        }
    }
    (!indices.is_empty()).then_some(indices)
}

/// Selected devices for `selection`, falling back to `primary`
#[must_use]
pub fn resolve_selection(devices: &[Device], selection: Option<&str>, primary: &Device) -> Vec<Device> {
    let Some(selection) = selection else {
        return vec![primary.clone()];
    };

    parse_selection(selection, devices.len()).map_or_else(
        || {
            tracing::warn!(selection, "no valid devices selected, using primary device");
            vec![primary.clone()]
        },
        |indices| indices.into_iter().map(|i| devices[i].clone()).collect(),
    )
}

/// Comma-separated display names
#[must_use]
pub fn names(devices: &[Device]) -> String {
    devices
        .iter()
        .map(Device::display_name)
        .collect::<Vec<_>>()
        .join(", ")
}
