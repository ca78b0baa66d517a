//! Cloud session token set and its on-disk credential record

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;

/// Per-service credentials: `(ssecurity, serviceToken)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceToken(pub String, pub String);

impl ServiceToken {
    /// Signing secret returned by the handshake
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// Cookie value presented to the service
    #[must_use]
    pub fn token(&self) -> &str {
        &self.1
    }
}

/// Authentication state for the device cloud
///
/// Serialized in the same shape as the credential record: fixed identity
/// fields plus one `<serviceId>: [secret, token]` entry per service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Random client fingerprint presented to the account service
    #[serde(rename = "deviceId")]
    pub device_fingerprint: String,

    #[serde(
        rename = "userId",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_number"
    )]
    pub user_id: Option<String>,

    #[serde(rename = "passToken", default, skip_serializing_if = "Option::is_none")]
    pub pass_token: Option<String>,

    /// Service tokens keyed by service id
    #[serde(flatten)]
    pub services: HashMap<String, ServiceToken>,
}

impl Session {
    /// Fresh unauthenticated session with a random fingerprint
    #[must_use]
    pub fn new() -> Self {
        Self {
            device_fingerprint: random_fingerprint(),
            ..Self::default()
        }
    }

    /// Token for a service, if logged in to it
    #[must_use]
    pub fn service(&self, service_id: &str) -> Option<&ServiceToken> {
        self.services.get(service_id)
    }

    /// Whether `call` can be made for `service_id` without logging in
    #[must_use]
    pub fn is_authenticated(&self, service_id: &str) -> bool {
        self.user_id.is_some() && self.services.contains_key(service_id)
    }
}

/// Random 16-character uppercase alphanumeric fingerprint
fn random_fingerprint() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

/// The account service returns `userId` as a number, older records store a string
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Single-file credential record
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; unreadable records are logged and ignored
    #[must_use]
    pub fn load(&self) -> Option<Session> {
        if !self.path.is_file() {
            return None;
        }

        match std::fs::read_to_string(&self.path)
            .map_err(crate::Error::from)
            .and_then(|s| serde_json::from_str::<Session>(&s).map_err(crate::Error::from))
        {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to load credential record");
                None
            }
        }
    }

    /// Persist the session
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(session)?)?;
        tracing::debug!(path = %self.path.display(), "credential record saved");
        Ok(())
    }

    /// Remove the record so the next run performs a clean login
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed
    pub fn delete(&self) -> Result<()> {
        if self.path.is_file() {
            std::fs::remove_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "credential record deleted");
        }
        Ok(())
    }
}
