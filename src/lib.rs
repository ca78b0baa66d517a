//! mibridge - bridge smart-speaker voice queries to chat and home-automation backends
//!
//! This library provides the core of the bridge:
//! - Cloud session handling with transparent re-authentication
//! - Watermark-gated polling of each speaker's conversation history
//! - Keyword-based intent routing
//! - A streaming chat-completion client with a hard deadline
//! - Speech dispatch with bounded retry and device failover
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Speaker devices                     │
//! └──────────────┬──────────────────────▲───────────────┘
//!          poll  │                      │ speak
//! ┌──────────────▼──────────────────────┴───────────────┐
//! │   PollEngine  →  IntentRouter  →  SpeechDispatcher   │
//! │                SessionManager (every call)           │
//! └──────────────┬──────────────────────┬───────────────┘
//!                │                      │
//! ┌──────────────▼────────┐   ┌─────────▼───────────────┐
//! │  Chat completions     │   │  Home Assistant         │
//! └───────────────────────┘   └─────────────────────────┘
//! ```

pub mod chat;
pub mod cloud;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod home;
pub mod intent;
pub mod poll;
pub mod speech;

pub use chat::{ChatBackend, StreamingChatClient};
pub use cloud::{Device, MinaService, SessionManager};
pub use config::Config;
pub use console::Console;
pub use engine::{Engine, EngineState};
pub use error::{Error, Result};
pub use home::{HomeAssistantClient, HomeAutomation};
pub use intent::{Intent, IntentRouter};
pub use poll::{ConversationSource, PollEngine};
pub use speech::{SpeechDispatcher, SpeechSink};
