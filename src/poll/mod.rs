//! Conversation polling
//!
//! Each tick fetches the latest record of every selected device in parallel,
//! joins all fetches, then filters the results through the per-device
//! watermarks. Fetch failures only cost that device its turn for the tick.
//! Request deadlines belong to the source, so a relogin triggered by a fetch
//! is never cut short by the poll.

pub mod extract;
pub mod watermark;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

pub use extract::ConversationRecord;
pub use watermark::Watermarks;

use crate::Result;
use crate::cloud::Device;

/// Source of the latest conversation record for a device
#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Most recent record, `None` when the device has no history
    async fn latest(&self, device: &Device) -> Result<Option<ConversationRecord>>;
}

/// A query that passed the watermark and is ready for routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuery {
    pub device: Device,
    pub query: String,
    /// Device's own reply, possibly empty
    pub reply: String,
    pub timestamp: i64,
}

/// Watermark-gated poller over a [`ConversationSource`]
pub struct PollEngine {
    source: Arc<dyn ConversationSource>,
    watermarks: Watermarks,
}

impl PollEngine {
    #[must_use]
    pub fn new(source: Arc<dyn ConversationSource>) -> Self {
        Self {
            source,
            watermarks: Watermarks::default(),
        }
    }

    /// Current watermark for a device
    #[must_use]
    pub fn watermark(&self, device_id: &str) -> i64 {
        self.watermarks.get(device_id)
    }

    /// Move each device's watermark to its current latest record
    ///
    /// Records that existed before startup are never dispatched.
    ///
    /// # Errors
    ///
    /// Returns only fatal errors (see [`crate::Error::is_fatal`])
    pub async fn prime(&mut self, devices: &[Device]) -> Result<()> {
        let records = self.fetch_all(devices).await?;
        for (device, record) in devices.iter().zip(records) {
            if let Some(record) = record {
                self.watermarks.advance(&device.id, record.timestamp);
                tracing::debug!(device = %device.display_name(), timestamp = record.timestamp, "primed watermark");
            }
        }
        Ok(())
    }

    /// Fetch every device once and return the queries that are new
    ///
    /// Results are in the order of `devices`.
    ///
    /// # Errors
    ///
    /// Returns only fatal errors (see [`crate::Error::is_fatal`])
    pub async fn tick(&mut self, devices: &[Device]) -> Result<Vec<NewQuery>> {
        let records = self.fetch_all(devices).await?;

        Ok(devices
            .iter()
            .zip(records)
            .filter_map(|(device, record)| self.accept(device, record?))
            .collect())
    }

    /// Apply the watermark rule to one fetched record
    fn accept(&mut self, device: &Device, record: ConversationRecord) -> Option<NewQuery> {
        if !self.watermarks.advance(&device.id, record.timestamp) {
            return None;
        }

        // Watermark already moved: empty turns are dropped for good
        if record.query.is_empty() {
            tracing::debug!(device = %device.display_name(), "skipping record without query");
            return None;
        }

        Some(NewQuery {
            device: device.clone(),
            query: record.query,
            reply: record.reply,
            timestamp: record.timestamp,
        })
    }

    async fn fetch_all(&self, devices: &[Device]) -> Result<Vec<Option<ConversationRecord>>> {
        let results = join_all(devices.iter().map(|d| self.fetch_one(d))).await;
        results.into_iter().collect()
    }

    async fn fetch_one(&self, device: &Device) -> Result<Option<ConversationRecord>> {
        match self.source.latest(device).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(device = %device.display_name(), error = %e, "poll fetch failed");
                Ok(None)
            }
        }
    }
}
