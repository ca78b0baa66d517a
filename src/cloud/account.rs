//! Account handshake and auth-aware request wrapper

use std::time::Duration;

use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, RwLock};

use super::session::{ServiceToken, Session, TokenStore};
use super::types::{CloudRequest, classify_response};
use crate::{Error, Result};

/// Total attempts `call` makes before giving up on authentication
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Prefix the account service puts in front of every JSON body
const RESPONSE_PREFIX: &str = "&&&START&&&";

/// Code returned when the account requires a captcha
const CODE_MACHINE_CHALLENGE: i64 = 87001;

const ACCOUNT_USER_AGENT: &str =
    "APP/com.xiaomi.mihome APPV/6.0.103 iosPassportSDK/3.9.0 iOS/14.4 miHSTS";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Owns the cloud token set and wraps every device-cloud call
///
/// The session is single-writer: logins are serialized behind `login_lock`
/// and a successful login replaces the whole session at once.
pub struct SessionManager {
    client: reqwest::Client,
    user: String,
    password: SecretString,
    account_base: String,
    store: Option<TokenStore>,
    session: RwLock<Option<Session>>,
    login_lock: Mutex<()>,
}

impl SessionManager {
    /// Create a manager, loading any persisted credential record
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        user: impl Into<String>,
        password: SecretString,
        account_base: impl Into<String>,
        store: Option<TokenStore>,
    ) -> Self {
        let session = store.as_ref().and_then(TokenStore::load);
        if session.is_some() {
            tracing::debug!("loaded persisted cloud session");
        }

        Self {
            client,
            user: user.into(),
            password,
            account_base: account_base.into().trim_end_matches('/').to_string(),
            store,
            session: RwLock::new(session),
            login_lock: Mutex::new(()),
        }
    }

    /// Build from loaded configuration
    #[must_use]
    pub fn from_config(config: &crate::config::Config, client: reqwest::Client) -> Self {
        Self::new(
            client,
            config.account.user.clone(),
            config.account.password.clone(),
            config.endpoints.account_base.clone(),
            Some(TokenStore::new(config.account.token_path.clone())),
        )
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Log in to `service_id` unless a valid token is already held
    ///
    /// # Errors
    ///
    /// Returns `AuthChallenge` when a captcha is required (the credential
    /// record is deleted), `Auth` for any other handshake failure
    pub async fn authenticate(&self, service_id: &str) -> Result<Session> {
        let _guard = self.login_lock.lock().await;

        // Another caller may have logged in while this one waited
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_authenticated(service_id) {
                return Ok(session.clone());
            }
        }

        let mut session = self
            .session
            .read()
            .await
            .clone()
            .unwrap_or_else(Session::new);

        match self.login(&mut session, service_id).await {
            Ok(()) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&session) {
                        tracing::warn!(error = %e, "failed to persist credential record");
                    }
                }
                *self.session.write().await = Some(session.clone());
                tracing::info!(user = %self.user, service = service_id, "cloud login succeeded");
                Ok(session)
            }
            Err(e) => {
                *self.session.write().await = None;
                if matches!(e, Error::AuthChallenge) {
                    if let Some(store) = &self.store {
                        if let Err(err) = store.delete() {
                            tracing::warn!(error = %err, "failed to delete credential record");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the session so the next call logs in again
    pub async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    /// Delete the persisted credential record and forget the session
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be removed
    pub async fn logout(&self) -> Result<()> {
        self.invalidate().await;
        if let Some(store) = &self.store {
            store.delete()?;
        }
        Ok(())
    }

    /// Send a request to a device-cloud service, logging in first if needed
    ///
    /// Session rejections clear the session and retry with a fresh login,
    /// bounded to [`MAX_AUTH_ATTEMPTS`] attempts in total.
    ///
    /// # Errors
    ///
    /// Returns `AuthChallenge` immediately, `Auth` once the attempts are
    /// exhausted, and any non-auth error from the request unchanged
    pub async fn call(&self, service_id: &str, request: &CloudRequest) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let session = match self.credentials(service_id).await {
                Some(s) => s,
                None => match self.authenticate(service_id).await {
                    Ok(s) => s,
                    Err(Error::AuthChallenge) => return Err(Error::AuthChallenge),
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "cloud login failed");
                        last_error = e.to_string();
                        continue;
                    }
                },
            };

            match self.send(&session, service_id, request).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() => {
                    tracing::warn!(
                        attempt,
                        max = MAX_AUTH_ATTEMPTS,
                        error = %e,
                        "cloud session rejected, logging in again"
                    );
                    self.invalidate().await;
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Auth(format!(
            "giving up after {MAX_AUTH_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Current session if it holds a token for `service_id`
    async fn credentials(&self, service_id: &str) -> Option<Session> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_authenticated(service_id))
            .cloned()
    }

    async fn send(&self, session: &Session, service_id: &str, request: &CloudRequest) -> Result<Value> {
        let user_id = session.user_id.as_deref().unwrap_or_default();
        let token = session.service(service_id).map(ServiceToken::token).unwrap_or_default();

        let mut cookie = format!("userId={user_id}; serviceToken={token}");
        for (name, value) in &request.cookies {
            cookie.push_str(&format!("; {name}={value}"));
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header(reqwest::header::COOKIE, cookie)
            .timeout(request.timeout.unwrap_or(DEFAULT_TIMEOUT));
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        if request.quiet {
            tracing::trace!(method = %request.method, url = %request.url, "cloud request");
        } else {
            tracing::debug!(method = %request.method, url = %request.url, "cloud request");
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        classify_response(status, &body, request.device_id.as_deref())
    }

    /// Two-step handshake followed by the service token exchange
    async fn login(&self, session: &mut Session, service_id: &str) -> Result<()> {
        if self.user.is_empty() || self.password.expose_secret().is_empty() {
            return Err(Error::Auth("account user or password missing".to_string()));
        }

        tracing::debug!(service = service_id, "starting cloud login");
        let mut resp = self
            .account_request(session, &format!("serviceLogin?sid={service_id}&_json=true"), None)
            .await?;

        if response_code(&resp) != 0 {
            let field = |key: &str| resp.get(key).map(value_to_string).unwrap_or_default();
            let form = vec![
                ("_json".to_string(), "true".to_string()),
                ("qs".to_string(), field("qs")),
                ("sid".to_string(), field("sid")),
                ("_sign".to_string(), field("_sign")),
                ("callback".to_string(), field("callback")),
                ("user".to_string(), self.user.clone()),
                ("hash".to_string(), password_hash(self.password.expose_secret())),
            ];

            resp = self
                .account_request(session, "serviceLoginAuth2", Some(&form))
                .await?;

            let code = response_code(&resp);
            if code != 0 {
                if code == CODE_MACHINE_CHALLENGE
                    && resp.get("type").and_then(Value::as_str) == Some("manMachine")
                {
                    tracing::error!(
                        "login requires a captcha: sign in once at https://account.xiaomi.com, then restart"
                    );
                    return Err(Error::AuthChallenge);
                }
                let desc = resp
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::Auth(format!("login failed with code {code}: {desc}")));
            }
        }

        let required = |key: &str| {
            resp.get(key)
                .map(value_to_string)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::Auth(format!("login response missing {key}")))
        };

        session.user_id = Some(required("userId")?);
        session.pass_token = Some(required("passToken")?);
        let location = required("location")?;
        let nonce = required("nonce")?;
        let ssecurity = required("ssecurity")?;

        let token = self.service_token(&location, &nonce, &ssecurity).await?;
        session
            .services
            .insert(service_id.to_string(), ServiceToken(ssecurity, token));

        Ok(())
    }

    /// Request against the account service, stripping the body prefix
    async fn account_request(
        &self,
        session: &Session,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Value> {
        let url = format!("{}/{path}", self.account_base);

        let mut cookie = format!("sdkVersion=3.9; deviceId={}", session.device_fingerprint);
        if let (Some(user_id), Some(pass_token)) = (&session.user_id, &session.pass_token) {
            cookie.push_str(&format!("; userId={user_id}; passToken={pass_token}"));
        }

        let builder = match form {
            Some(form) => self.client.post(&url).form(form),
            None => self.client.get(&url),
        };

        let response = builder
            .header(reqwest::header::USER_AGENT, ACCOUNT_USER_AGENT)
            .header(reqwest::header::COOKIE, cookie)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Auth(format!("{path} returned HTTP {status}")));
        }

        let json = body
            .strip_prefix(RESPONSE_PREFIX)
            .ok_or_else(|| Error::MalformedResponse(format!("{path}: unexpected account body")))?;
        let value = serde_json::from_str(json)?;
        tracing::trace!(path, "account response decoded");
        Ok(value)
    }

    /// Exchange location/nonce/secret for the service token cookie
    async fn service_token(&self, location: &str, nonce: &str, ssecurity: &str) -> Result<String> {
        let url = format!(
            "{location}&clientSign={}",
            urlencoding::encode(&client_sign(nonce, ssecurity))
        );

        let response = self.client.get(&url).timeout(DEFAULT_TIMEOUT).send().await?;

        let token = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookie| {
                let pair = cookie.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                (name.trim() == "serviceToken").then(|| value.trim().to_string())
            })
            .filter(|t| !t.is_empty());

        match token {
            Some(t) => Ok(t),
            None => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Auth(format!("serviceToken missing from response: {body}")))
            }
        }
    }
}

/// Uppercase hex MD5 of the password
fn password_hash(password: &str) -> String {
    hex::encode_upper(md5::Md5::digest(password.as_bytes()))
}

/// Base64 SHA-1 signature over `nonce=<nonce>&<ssecurity>`
fn client_sign(nonce: &str, ssecurity: &str) -> String {
    let digest = Sha1::digest(format!("nonce={nonce}&{ssecurity}").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn response_code(value: &Value) -> i64 {
    value.get("code").and_then(Value::as_i64).unwrap_or(-1)
}

/// Render a JSON scalar as a plain string (numbers keep their digits)
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn password_hash_is_uppercase_md5() {
        assert_eq!(password_hash("password"), "5F4DCC3B5AA765D61D8327DEB882CF99");
    }

    #[test]
    fn client_sign_is_base64_sha1() {
        let sign = client_sign("1", "abc");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&sign)
            .unwrap();
        assert_eq!(decoded.len(), 20);
        assert_eq!(decoded, Sha1::digest(b"nonce=1&abc").to_vec());
    }

    #[test]
    fn numbers_render_without_quotes() {
        assert_eq!(value_to_string(&serde_json::json!(12345)), "12345");
        assert_eq!(value_to_string(&serde_json::json!("abc")), "abc");
        assert_eq!(value_to_string(&Value::Null), "");
    }
}
