//! Device-cloud service: device list, speech, playback and conversation fetch

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};

use super::account::SessionManager;
use super::types::{CloudRequest, Device};
use crate::poll::ConversationSource;
use crate::poll::extract::{ConversationRecord, latest_record};
use crate::speech::SpeechSink;
use crate::{Error, Result};

/// Service id the device cloud is scoped to
pub const SERVICE_ID: &str = "micoapi";

const MINA_USER_AGENT: &str = "MiHome/6.0.103 (com.xiaomi.mihome; build:6.0.103.1; iOS 14.4.0) Alamofire/6.0.103 MICO/iOSApp/appStore/6.0.103";

/// Typed access to the speaker device cloud
pub struct MinaService {
    session: Arc<SessionManager>,
    base: String,
    conversation_url: String,
    hardware: String,
    fetch_timeout: Duration,
    record_limit: u32,
}

impl MinaService {
    #[must_use]
    pub fn new(session: Arc<SessionManager>, config: &crate::config::Config) -> Self {
        Self {
            session,
            base: config.endpoints.mina_base.trim_end_matches('/').to_string(),
            conversation_url: config.endpoints.conversation_url.clone(),
            hardware: config.devices.hardware.clone(),
            fetch_timeout: config.poll.fetch_timeout,
            record_limit: config.poll.record_limit,
        }
    }

    /// Session manager backing this service
    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Devices registered to the account
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the list cannot be decoded
    pub async fn device_list(&self) -> Result<Vec<Device>> {
        let url = format!(
            "{}/admin/v2/device_list?master=0&requestId={}",
            self.base,
            request_id()
        );
        let request = CloudRequest::get(url).header("User-Agent", MINA_USER_AGENT);
        let resp = self.session.call(SERVICE_ID, &request).await?;

        let data = resp
            .get("data")
            .cloned()
            .ok_or_else(|| Error::MalformedResponse("device list without data".to_string()))?;
        let devices: Vec<Device> = serde_json::from_value(data)?;
        tracing::debug!(count = devices.len(), "fetched device list");
        Ok(devices)
    }

    /// Speak `text` on a device
    ///
    /// # Errors
    ///
    /// Returns `DeviceBusy` when the device did not answer, or any call error
    pub async fn text_to_speech(&self, device_id: &str, text: &str) -> Result<()> {
        self.ubus(device_id, "text_to_speech", "mibrain", json!({ "text": text }), false)
            .await
            .map(|_| ())
    }

    /// Speak `text` with trace-only logging
    ///
    /// # Errors
    ///
    /// Same as [`Self::text_to_speech`]
    pub async fn text_to_speech_quiet(&self, device_id: &str, text: &str) -> Result<()> {
        self.ubus(device_id, "text_to_speech", "mibrain", json!({ "text": text }), true)
            .await
            .map(|_| ())
    }

    /// Set playback volume (0-100)
    ///
    /// # Errors
    ///
    /// Returns error if the level is out of range or the call fails
    pub async fn player_set_volume(&self, device_id: &str, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(Error::Config(format!("volume {volume} is above 100")));
        }
        self.ubus(
            device_id,
            "player_set_volume",
            "mediaplayer",
            json!({ "volume": volume, "media": "app_ios" }),
            false,
        )
        .await
        .map(|_| ())
    }

    /// Pause playback
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn player_pause(&self, device_id: &str) -> Result<()> {
        self.play_operation(device_id, "pause").await
    }

    /// Resume playback
    ///
    /// # Errors
    ///
    /// Returns error if the call fails
    pub async fn player_play(&self, device_id: &str) -> Result<()> {
        self.play_operation(device_id, "play").await
    }

    async fn play_operation(&self, device_id: &str, action: &str) -> Result<()> {
        self.ubus(
            device_id,
            "player_play_operation",
            "mediaplayer",
            json!({ "action": action, "media": "app_ios" }),
            false,
        )
        .await
        .map(|_| ())
    }

    /// Raw conversation envelope for a device
    ///
    /// # Errors
    ///
    /// Returns error on timeout, non-200 or undecodable body
    pub async fn fetch_conversation(&self, device: &Device) -> Result<Value> {
        let hardware = if device.hardware.is_empty() {
            &self.hardware
        } else {
            &device.hardware
        };
        let url = format!(
            "{}?source=dialogu&hardware={hardware}&timestamp={}&limit={}",
            self.conversation_url,
            chrono::Utc::now().timestamp_millis(),
            self.record_limit
        );

        let request = CloudRequest::get(url)
            .cookie("deviceId", &device.id)
            .timeout(self.fetch_timeout)
            .for_device(&device.id)
            .quiet();

        self.session.call(SERVICE_ID, &request).await
    }

    async fn ubus(
        &self,
        device_id: &str,
        method: &str,
        path: &str,
        message: Value,
        quiet: bool,
    ) -> Result<Value> {
        let form = vec![
            ("deviceId".to_string(), device_id.to_string()),
            ("message".to_string(), message.to_string()),
            ("method".to_string(), method.to_string()),
            ("path".to_string(), path.to_string()),
            ("requestId".to_string(), request_id()),
        ];

        let mut request = CloudRequest::post_form(format!("{}/remote/ubus", self.base), form)
            .header("User-Agent", MINA_USER_AGENT)
            .for_device(device_id);
        if quiet {
            request = request.quiet();
        } else {
            tracing::debug!(device = %device_id, method, "ubus request");
        }

        self.session.call(SERVICE_ID, &request).await
    }
}

#[async_trait]
impl SpeechSink for MinaService {
    async fn speak(&self, device_id: &str, text: &str) -> Result<()> {
        self.text_to_speech(device_id, text).await
    }

    async fn speak_quiet(&self, device_id: &str, text: &str) -> Result<()> {
        self.text_to_speech_quiet(device_id, text).await
    }
}

#[async_trait]
impl ConversationSource for MinaService {
    async fn latest(&self, device: &Device) -> Result<Option<ConversationRecord>> {
        let envelope = self.fetch_conversation(device).await?;
        latest_record(&envelope)
    }
}

/// `app_ios_` followed by 30 random alphanumerics
fn request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect();
    format!("app_ios_{suffix}")
}
