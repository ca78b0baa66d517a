//! Interactive command console (`mibridge run` reads stdin)
//!
//! Lines are either commands, with English and Chinese aliases, or typed
//! queries that are spoken on every selected device.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::Result;
use crate::chat::ChatBackend;
use crate::cloud::Device;
use crate::engine::{SharedState, names, parse_selection};
use crate::intent::{Intent, IntentRouter};
use crate::speech::SpeechDispatcher;

const HELP: &str = "\
commands:
  select/选择设备 [1,3|all]  choose devices (no argument lists them)
  on/开启ai                  enable AI answers
  off/关闭ai                 disable AI answers
  start/开始                 resume processing device input
  stop/停止                  pause processing device input
  status/状态                show current state
  help/帮助                  show this help
  exit/退出                  quit
anything else is spoken on the selected devices";

/// One console input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show or change the device selection
    Select(Option<String>),
    AiOn,
    AiOff,
    Start,
    Stop,
    Status,
    Help,
    Exit,
    /// Anything else
    Query(String),
    Empty,
}

impl Command {
    /// Parse a line; command words are case-insensitive
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        let word = word.to_lowercase();
        if matches!(word.as_str(), "select" | "选择设备") {
            return Self::Select(arg);
        }
        // Only `select` takes an argument
        if arg.is_some() {
            return Self::Query(line.to_string());
        }

        match word.as_str() {
            "on" | "开启ai" => Self::AiOn,
            "off" | "关闭ai" => Self::AiOff,
            "start" | "开始" => Self::Start,
            "stop" | "停止" => Self::Stop,
            "status" | "状态" => Self::Status,
            "help" | "帮助" => Self::Help,
            "exit" | "quit" | "退出" => Self::Exit,
            _ => Self::Query(line.to_string()),
        }
    }
}

/// Whether the console keeps reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Console bound to a running engine's shared state
pub struct Console {
    state: SharedState,
    devices: Vec<Device>,
    router: IntentRouter,
    speech: Arc<SpeechDispatcher>,
    chat: Option<Arc<dyn ChatBackend>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl Console {
    #[must_use]
    pub fn new(
        state: SharedState,
        devices: Vec<Device>,
        router: IntentRouter,
        speech: Arc<SpeechDispatcher>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            state,
            devices,
            router,
            speech,
            chat: None,
            shutdown_tx,
        }
    }

    /// Answer AI-triggered typed queries with `chat`
    #[must_use]
    pub fn with_chat(mut self, chat: Arc<dyn ChatBackend>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Read stdin until `exit` or end of input
    ///
    /// # Errors
    ///
    /// Returns error if stdin cannot be read
    pub async fn run(self) -> Result<()> {
        println!("{HELP}\n");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let (flow, output) = self.execute(Command::parse(&line)).await;
            if !output.is_empty() {
                println!("{output}");
            }
            if flow == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    /// Apply one command and return the text to show
    pub async fn execute(&self, command: Command) -> (Flow, String) {
        let output = match command {
            Command::Empty => String::new(),
            Command::Select(None) => self.device_menu().await,
            Command::Select(Some(selection)) => self.select(&selection).await,
            Command::AiOn => {
                self.state.write().await.ai_enabled = true;
                tracing::info!("AI answers enabled");
                "AI answers on".to_string()
            }
            Command::AiOff => {
                self.state.write().await.ai_enabled = false;
                tracing::info!("AI answers disabled");
                "AI answers off".to_string()
            }
            Command::Start => {
                self.state.write().await.auto_process = true;
                "processing device input".to_string()
            }
            Command::Stop => {
                self.state.write().await.auto_process = false;
                "stopped processing device input".to_string()
            }
            Command::Status => self.status().await,
            Command::Help => HELP.to_string(),
            Command::Exit => {
                self.state.write().await.running = false;
                let _ = self.shutdown_tx.try_send(());
                return (Flow::Exit, "exiting".to_string());
            }
            Command::Query(text) => self.typed_query(&text).await,
        };
        (Flow::Continue, output)
    }

    async fn device_menu(&self) -> String {
        let state = self.state.read().await;
        let mut menu = String::new();
        for (i, device) in self.devices.iter().enumerate() {
            let mark = if state.selected.iter().any(|d| d.id == device.id) {
                'x'
            } else {
                ' '
            };
            let _ = writeln!(
                menu,
                "[{mark}] {}. {} ({})",
                i + 1,
                device.display_name(),
                device.hardware
            );
        }
        menu.push_str("usage: select 1,3 | select all");
        menu
    }

    async fn select(&self, selection: &str) -> String {
        let Some(indices) = parse_selection(selection, self.devices.len()) else {
            return format!("no valid devices in {selection:?}, selection unchanged");
        };

        let selected: Vec<Device> = indices.into_iter().map(|i| self.devices[i].clone()).collect();
        let listed = names(&selected);
        tracing::info!(devices = %listed, "selection changed");
        self.state.write().await.selected = selected;
        format!("selected: {listed}")
    }

    async fn status(&self) -> String {
        let state = self.state.read().await;
        let on_off = |b: bool| if b { "on" } else { "off" };
        format!(
            "AI answers: {}\nprocessing: {}\nselected: {}",
            on_off(state.ai_enabled),
            on_off(state.auto_process),
            names(&state.selected)
        )
    }

    /// AI-triggered lines are answered by chat, anything else is spoken as typed
    async fn typed_query(&self, text: &str) -> String {
        let (routed, selected) = {
            let state = self.state.read().await;
            (self.router.route(text, &state), state.selected.clone())
        };
        if selected.is_empty() {
            return "no devices selected, use `select` first".to_string();
        }

        let utterance = match (&self.chat, routed.intent) {
            (Some(chat), Intent::ChatAi) => chat.answer(&routed.cleaned).await,
            _ => text.to_string(),
        };

        let delivered = self.speech.speak_all(&selected, &utterance).await;
        format!("{utterance}\n(spoken on {delivered}/{} devices)", selected.len())
    }
}
