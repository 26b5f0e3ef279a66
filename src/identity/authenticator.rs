use std::sync::Arc;

use axum::http::Method;
use tracing::{debug, warn};

use super::login_service::LoginService;
use super::principal::Principal;
use super::request_context::AuthRequest;
use crate::deploy::AppDescriptor;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct SsoSettings {
    pub cookie_name: String,
    pub token_header: String,
    /// Login endpoint, relative to the context path.
    pub login_path: String,
    pub post_login_url: String,
}

impl Default for SsoSettings {
    fn default() -> Self {
        Self {
            cookie_name: "AuthSession".to_string(),
            token_header: "X-Auth-Token".to_string(),
            login_path: "/login".to_string(),
            post_login_url: "/".to_string(),
        }
    }
}

/// Whether a context lets anonymous requests through (`options.auth`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    Optional,
}

impl AuthMode {
    pub fn from_options(app: &AppDescriptor) -> Self {
        match app.options.get("auth").map(|s| s.as_str()) {
            Some("optional") | Some("none") => AuthMode::Optional,
            _ => AuthMode::Required,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    /// Proceed, with the caller's principal if one was established.
    Admit(Option<Principal>),
    LoggedIn { principal: Principal, set_cookie: String, location: String },
    LoggedOut { set_cookie: String, location: String },
    /// 401.
    Challenge,
    RedirectToLogin(String),
    /// 503: the credential store or the fabric could not be reached.
    Unavailable,
}

/// Request-level SSO handler for one context. Holds no per-request state;
/// everything it knows lives in `activeUsers` and the login service.
pub struct SsoAuthenticator {
    context_path: String,
    mode: AuthMode,
    settings: SsoSettings,
    login: Arc<LoginService>,
}

impl SsoAuthenticator {
    pub fn new(context_path: &str, mode: AuthMode, settings: SsoSettings, login: Arc<LoginService>) -> Self {
        Self { context_path: context_path.trim_end_matches('/').to_string(), mode, settings, login }
    }

    pub fn mode(&self) -> AuthMode { self.mode }

    pub fn login_service(&self) -> &Arc<LoginService> { &self.login }

    fn login_location(&self) -> String { format!("{}{}", self.context_path, self.settings.login_path) }

    fn logout_path(&self) -> String { format!("{}/logout", self.settings.login_path.trim_end_matches('/')) }

    fn token(&self, req: &AuthRequest) -> Option<String> {
        req.cookie(&self.settings.cookie_name).or_else(|| req.header(&self.settings.token_header).map(|s| s.to_string()))
    }

    fn cookie(&self, value: &str, secure: bool, clear: bool) -> String {
        let mut c = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", self.settings.cookie_name, value);
        if clear { c.push_str("; Max-Age=0"); }
        if secure { c.push_str("; Secure"); }
        c
    }

    fn deny(&self, req: &AuthRequest) -> AuthDecision {
        if req.wants_challenge() { AuthDecision::Challenge } else { AuthDecision::RedirectToLogin(self.login_location()) }
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> AuthDecision {
        match self.decide(req).await {
            Ok(d) => d,
            Err(e @ (AppError::AuthBackendUnavailable(_) | AppError::FabricUnavailable(_))) => {
                warn!(target: "login", context = %self.context_path, error = %e, "authentication unavailable");
                AuthDecision::Unavailable
            }
            Err(e) => {
                warn!(target: "login", context = %self.context_path, error = %e, "authentication failed");
                self.deny(req)
            }
        }
    }

    async fn decide(&self, req: &AuthRequest) -> AppResult<AuthDecision> {
        if req.method == Method::POST && req.path == self.logout_path() {
            if let Some(token) = self.token(req) { self.login.logout_token(&token).await?; }
            return Ok(AuthDecision::LoggedOut { set_cookie: self.cookie("", req.secure, true), location: self.login_location() });
        }
        if req.path == self.settings.login_path && req.method == Method::POST {
            return self.form_login(req).await;
        }

        let principal = match self.token(req) {
            Some(token) => self.principal_for(&token).await?,
            None => None,
        };
        if principal.is_some() || self.mode == AuthMode::Optional || req.path == self.settings.login_path {
            return Ok(AuthDecision::Admit(principal));
        }
        Ok(self.deny(req))
    }

    async fn principal_for(&self, token: &str) -> AppResult<Option<Principal>> {
        if let Some(p) = self.login.resolve(token).await? { return Ok(Some(p)); }
        debug!(target: "login", context = %self.context_path, "unknown token, validating");
        self.login.validate_token(token).await
    }

    async fn form_login(&self, req: &AuthRequest) -> AppResult<AuthDecision> {
        let name = req.form_field("name").or_else(|| req.form_field("username"));
        let password = req.form_field("password");
        let (Some(name), Some(password)) = (name, password) else { return Ok(self.deny(req)); };
        match self.login.login(&name, &password).await? {
            Some(principal) => {
                let location = req
                    .form_field("next")
                    .filter(|n| n.starts_with('/') && !n.starts_with("//"))
                    .unwrap_or_else(|| self.settings.post_login_url.clone());
                let set_cookie = self.cookie(&principal.token, req.secure, false);
                Ok(AuthDecision::LoggedIn { principal, set_cookie, location })
            }
            None => Ok(self.deny(req)),
        }
    }
}

/// Builds one authenticator per context; all of them share the login service.
#[derive(Clone)]
pub struct AuthenticatorFactory {
    login: Arc<LoginService>,
    settings: SsoSettings,
}

impl AuthenticatorFactory {
    pub fn new(login: Arc<LoginService>, settings: SsoSettings) -> Self { Self { login, settings } }

    pub fn build(&self, app: &AppDescriptor) -> Arc<SsoAuthenticator> {
        Arc::new(SsoAuthenticator::new(&app.context_path, AuthMode::from_options(app), self.settings.clone(), self.login.clone()))
    }
}
