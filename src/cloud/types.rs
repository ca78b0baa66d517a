//! Device-cloud wire types and response classification

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Envelope code signalling an invalidated login
const CODE_SESSION_INVALID: i64 = 3;

/// Envelope code for "device control channel did not respond"
const CODE_DEVICE_BUSY: i64 = 3012;

/// Message text the cloud uses for the same condition
const DEVICE_BUSY_MARKER: &str = "ROM端未响应";

/// A speaker device registered to the account
///
/// Snapshot taken at startup; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Cloud device identifier
    #[serde(rename = "deviceID")]
    pub id: String,

    /// User-assigned name
    #[serde(default)]
    pub name: String,

    /// Hardware model (e.g. "LX06")
    #[serde(default)]
    pub hardware: String,

    /// Capability flags reported by the cloud
    #[serde(default)]
    pub capabilities: serde_json::Map<String, Value>,
}

impl Device {
    /// Name for logs and console output
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// One outbound request to the device cloud
///
/// Session cookies are attached by the session manager; only request-specific
/// cookies belong here.
#[derive(Debug, Clone)]
pub struct CloudRequest {
    pub method: Method,
    pub url: String,
    pub form: Option<Vec<(String, String)>>,
    pub headers: Vec<(&'static str, String)>,
    pub cookies: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Device the request targets, used to attribute busy errors
    pub device_id: Option<String>,
    /// Log at trace instead of debug
    pub quiet: bool,
}

impl CloudRequest {
    /// Build a GET request
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url.into(), None)
    }

    /// Build a form-encoded POST request
    #[must_use]
    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self::new(Method::POST, url.into(), Some(form))
    }

    const fn new(method: Method, url: String, form: Option<Vec<(String, String)>>) -> Self {
        Self {
            method,
            url,
            form,
            headers: Vec::new(),
            cookies: Vec::new(),
            timeout: None,
            device_id: None,
            quiet: false,
        }
    }

    #[must_use]
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub const fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Whether a raw body carries cookie or identity error markers
#[must_use]
pub fn has_identity_marker(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("cookie") || lower.contains("userid")
}

/// Classify a raw device-cloud response into a value or a typed error
///
/// This is the single place where auth and device-busy conditions are
/// recognised; callers match on the returned `Error` variant.
///
/// # Errors
///
/// Returns `SessionExpired`, `DeviceBusy`, `Cloud` or `MalformedResponse`
pub fn classify_response(status: u16, body: &str, device_id: Option<&str>) -> Result<Value> {
    if status == 401 {
        return Err(Error::SessionExpired(format!("HTTP 401: {body}")));
    }

    let parsed = serde_json::from_str::<Value>(body);

    if status != 200 {
        if has_identity_marker(body) {
            return Err(Error::SessionExpired(format!("HTTP {status}: {body}")));
        }
        if let Ok(v) = &parsed {
            if let Some(err) = envelope_error(v, body, device_id) {
                return Err(err);
            }
        }
        return Err(Error::Cloud {
            code: i64::from(status),
            message: body.to_string(),
        });
    }

    let value = match parsed {
        Ok(v) => v,
        Err(e) => {
            if has_identity_marker(body) {
                return Err(Error::SessionExpired(body.to_string()));
            }
            return Err(Error::MalformedResponse(e.to_string()));
        }
    };

    match envelope_error(&value, body, device_id) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

/// Map a non-zero envelope code to an error, `None` when the envelope is fine
fn envelope_error(value: &Value, body: &str, device_id: Option<&str>) -> Option<Error> {
    let code = value.get("code").and_then(Value::as_i64)?;
    if code == 0 {
        return None;
    }

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if code == CODE_SESSION_INVALID || message.to_lowercase().contains("auth") {
        return Some(Error::SessionExpired(format!("code {code}: {message}")));
    }

    if code == CODE_DEVICE_BUSY || body.contains(DEVICE_BUSY_MARKER) {
        return Some(Error::DeviceBusy {
            device_id: device_id.unwrap_or_default().to_string(),
        });
    }

    Some(Error::Cloud { code, message })
}
