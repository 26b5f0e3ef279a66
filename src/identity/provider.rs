use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::principal::Principal;
use crate::error::{AppError, AppResult};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Remote credential store behind the login service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` means the credentials were rejected.
    async fn login(&self, username: &str, password: &str) -> AppResult<Option<Principal>>;
    /// `Ok(None)` means the token is no longer accepted.
    async fn validate(&self, token: &str) -> AppResult<Option<Principal>>;
    /// Reachability check used at startup.
    async fn probe(&self) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct CouchDbSettings {
    pub authentication_url: Url,
    pub session_url: Url,
    pub cookie_name: String,
    pub token_header: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserCtx {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    #[serde(default)]
    user_ctx: UserCtx,
}

/// Credential store speaking the document database's `_session` protocol.
pub struct CouchDbAuthenticator {
    settings: CouchDbSettings,
    client: reqwest::Client,
}

impl CouchDbAuthenticator {
    pub fn new(settings: CouchDbSettings) -> AppResult<Self> {
        // No cookie jar: tokens belong to end users, not to this client.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .build()
            .map_err(|e| AppError::config(format!("credential store client: {}", e)))?;
        Ok(Self { settings, client })
    }

    /// Send once, retry once after a short backoff on transport errors and 5xx.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> AppResult<reqwest::Response> {
        let mut last = String::new();
        for attempt in 0..2 {
            if attempt > 0 { tokio::time::sleep(RETRY_BACKOFF).await; }
            match build().send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last = format!("HTTP {}", resp.status());
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last = e.to_string();
                }
            }
            debug!(target: "login", attempt = attempt, error = %last, "credential store call failed");
        }
        Err(AppError::backend(last))
    }

    fn token_from(&self, resp: &reqwest::Response) -> Option<String> {
        for val in resp.headers().get_all(reqwest::header::SET_COOKIE).iter() {
            let Ok(s) = val.to_str() else { continue; };
            let nv = s.split(';').next().unwrap_or("").trim();
            if let Some((k, v)) = nv.split_once('=') {
                if k == self.settings.cookie_name && !v.is_empty() { return Some(v.to_string()); }
            }
        }
        resp.headers()
            .get(self.settings.token_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    }
}

#[async_trait]
impl CredentialStore for CouchDbAuthenticator {
    async fn login(&self, username: &str, password: &str) -> AppResult<Option<Principal>> {
        let url = self.settings.authentication_url.clone();
        let resp = self.send(|| self.client.post(url.clone()).form(&[("name", username), ("password", password)])).await?;
        let status = resp.status();
        if !status.is_success() {
            debug!(target: "login", user = %username, status = %status, "login rejected");
            return Ok(None);
        }
        let Some(token) = self.token_from(&resp) else {
            warn!(target: "login", user = %username, "login accepted without an auth token");
            return Ok(None);
        };
        let body: LoginBody = resp.json().await.map_err(|e| AppError::backend(format!("login body: {}", e)))?;
        if !body.ok { return Ok(None); }
        Ok(Some(Principal {
            user_id: body.name.unwrap_or_else(|| username.to_string()),
            roles: body.roles,
            token,
            issued_ms: 0,
        }))
    }

    async fn validate(&self, token: &str) -> AppResult<Option<Principal>> {
        let url = self.settings.session_url.clone();
        let cookie = format!("{}={}", self.settings.cookie_name, token);
        let resp = self.send(|| self.client.get(url.clone()).header(reqwest::header::COOKIE, cookie.as_str())).await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            other => return Err(AppError::backend(format!("session check: HTTP {}", other))),
        }
        let body: SessionBody = resp.json().await.map_err(|e| AppError::backend(format!("session body: {}", e)))?;
        // 200 with a null user is an anonymous session.
        Ok(body.user_ctx.name.map(|name| Principal { user_id: name, roles: body.user_ctx.roles, token: token.to_string(), issued_ms: 0 }))
    }

    async fn probe(&self) -> AppResult<()> {
        let url = self.settings.session_url.clone();
        self.send(|| self.client.get(url.clone())).await.map(|_| ())
    }
}
