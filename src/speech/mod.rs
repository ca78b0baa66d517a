//! Speech dispatch with bounded retry and device failover

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use retry::RetryPolicy;

use crate::cloud::Device;
use crate::{Error, Result};

/// Utterance used to cut off the device's own reply
pub const INTERRUPT_UTTERANCE: &str = ".";

/// Pause after the interrupt so the device settles before the next call
const INTERRUPT_SETTLE: Duration = Duration::from_millis(100);

/// Something that can make a device speak
#[async_trait]
pub trait SpeechSink: Send + Sync {
    /// Speak `text` on a device
    async fn speak(&self, device_id: &str, text: &str) -> Result<()>;

    /// Speak on the least verbose call path
    async fn speak_quiet(&self, device_id: &str, text: &str) -> Result<()>;
}

/// Routes utterances to devices
pub struct SpeechDispatcher {
    sink: Arc<dyn SpeechSink>,
    policy: RetryPolicy,
    interrupt_policy: RetryPolicy,
    settle: Duration,
}

impl SpeechDispatcher {
    #[must_use]
    pub fn new(sink: Arc<dyn SpeechSink>) -> Self {
        Self {
            sink,
            policy: RetryPolicy::device_busy(),
            interrupt_policy: RetryPolicy::interrupt(),
            settle: INTERRUPT_SETTLE,
        }
    }

    /// Replace the targeted-send retry policy
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the post-interrupt pause
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Speak on one device, retrying only while it reports busy
    pub async fn speak_to(&self, device: &Device, text: &str) -> bool {
        let result = retry::retry(&self.policy, Error::is_device_busy, || {
            self.sink.speak(&device.id, text)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(device = %device.display_name(), "spoke reply");
                true
            }
            Err(e) => {
                tracing::warn!(device = %device.display_name(), error = %e, "speech failed");
                false
            }
        }
    }

    /// Speak once on the first device, in selection order, that accepts
    ///
    /// Busy devices are skipped rather than retried.
    pub async fn broadcast(&self, devices: &[Device], text: &str) -> bool {
        for device in devices {
            match self.sink.speak(&device.id, text).await {
                Ok(()) => {
                    tracing::debug!(device = %device.display_name(), "broadcast delivered");
                    return true;
                }
                Err(e) if e.is_device_busy() => {
                    tracing::info!(device = %device.display_name(), "device busy, trying next");
                }
                Err(e) => {
                    tracing::warn!(device = %device.display_name(), error = %e, "broadcast send failed");
                }
            }
        }
        false
    }

    /// Targeted send when `target` is given, broadcast over `selected` otherwise
    pub async fn speak(&self, text: &str, target: Option<&Device>, selected: &[Device]) -> bool {
        match target {
            Some(device) => self.speak_to(device, text).await,
            None => self.broadcast(selected, text).await,
        }
    }

    /// Speak on `origin`, falling back to the other selected devices in order
    pub async fn speak_with_failover(&self, origin: &Device, selected: &[Device], text: &str) -> bool {
        if self.speak_to(origin, text).await {
            return true;
        }

        for device in selected.iter().filter(|d| d.id != origin.id) {
            tracing::info!(from = %origin.display_name(), to = %device.display_name(), "failing over");
            if self.speak_to(device, text).await {
                return true;
            }
        }

        tracing::warn!(device = %origin.display_name(), "reply could not be delivered to any device");
        false
    }

    /// Speak on every device, returning how many accepted
    pub async fn speak_all(&self, devices: &[Device], text: &str) -> usize {
        let mut delivered = 0;
        for device in devices {
            if self.speak_to(device, text).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Cut off whatever the device is saying
    pub async fn interrupt(&self, device: &Device) -> bool {
        let result = retry::retry(&self.interrupt_policy, Error::is_device_busy, || {
            self.sink.speak_quiet(&device.id, INTERRUPT_UTTERANCE)
        })
        .await;

        tokio::time::sleep(self.settle).await;

        if let Err(e) = &result {
            tracing::trace!(device = %device.display_name(), error = %e, "interrupt failed");
        }
        result.is_ok()
    }
}
