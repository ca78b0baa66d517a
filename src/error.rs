//! Error types for the mibridge engine

use thiserror::Error;

/// Result type alias for mibridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging speakers to backends
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Account requires an interactive challenge (captcha) before login
    #[error("login challenge required: sign in manually at https://account.xiaomi.com, then restart")]
    AuthChallenge,

    /// Account handshake failed
    #[error("auth error: {0}")]
    Auth(String),

    /// Cloud session was rejected and needs a fresh login
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Device control channel did not answer in time
    #[error("device {device_id} is busy")]
    DeviceBusy {
        /// Device that reported the condition
        device_id: String,
    },

    /// Request exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// A response could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The account has no speaker devices
    #[error("no devices found for this account")]
    NoDevicesFound,

    /// Device cloud answered with a non-zero code
    #[error("cloud error {code}: {message}")]
    Cloud {
        /// Code from the response envelope
        code: i64,
        /// Message from the response envelope
        message: String,
    },

    /// Chat-completion provider error
    #[error("chat error: {0}")]
    Chat(String),

    /// Home-automation bridge error
    #[error("home automation error: {0}")]
    HomeAutomation(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error should clear the session and trigger a re-login
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Whether the failure is the named transient device-busy condition
    #[must_use]
    pub const fn is_device_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }

    /// Whether the error is a transport-level failure worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::DeviceBusy { .. } => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Whether the whole process should stop
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthChallenge | Self::NoDevicesFound)
    }
}
