use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::principal::Principal;
use super::provider::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::fabric::{ClusterFabric, DistMap, ACTIVE_USERS_MAP};
use crate::session::{now_ms, SessionListener, SessionRecord};

#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub realm: String,
    /// Memo lifetime for validation results; also the `activeUsers` entry TTL.
    pub validation_ttl: Duration,
    /// Upper bound on one credential store round trip, retries included.
    pub request_timeout: Duration,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self { realm: "couchdb_realm".to_string(), validation_ttl: Duration::from_secs(60), request_timeout: Duration::from_secs(3) }
    }
}

struct Memo {
    principal: Option<Principal>,
    checked: Instant,
}

/// Binds a realm to a credential store and keeps `activeUsers` current.
pub struct LoginService {
    settings: LoginSettings,
    store: Arc<dyn CredentialStore>,
    active: DistMap<Principal>,
    memo: RwLock<HashMap<String, Memo>>,
}

impl LoginService {
    pub fn new(fabric: &ClusterFabric, store: Arc<dyn CredentialStore>, settings: LoginSettings) -> Self {
        Self { settings, store, active: fabric.map(ACTIVE_USERS_MAP), memo: RwLock::new(HashMap::new()) }
    }

    pub fn realm(&self) -> &str { &self.settings.realm }

    pub fn active_users(&self) -> &DistMap<Principal> { &self.active }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        // Dropping the future on timeout cancels the outgoing call.
        match tokio::time::timeout(self.settings.request_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(AppError::backend(format!("{} timed out after {:?}", what, self.settings.request_timeout))),
        }
    }

    fn memo_get(&self, token: &str) -> Option<Option<Principal>> {
        let memo = self.memo.read();
        memo.get(token).filter(|m| m.checked.elapsed() < self.settings.validation_ttl).map(|m| m.principal.clone())
    }

    fn memo_put(&self, token: &str, principal: Option<Principal>) {
        let mut memo = self.memo.write();
        let ttl = self.settings.validation_ttl;
        memo.retain(|_, m| m.checked.elapsed() < ttl);
        memo.insert(token.to_string(), Memo { principal, checked: Instant::now() });
    }

    async fn admit(&self, mut principal: Principal) -> AppResult<Principal> {
        principal.issued_ms = now_ms();
        self.active.put_with_ttl(&principal.token, &principal, self.settings.validation_ttl).await?;
        self.memo_put(&principal.token, Some(principal.clone()));
        Ok(principal)
    }

    /// `Ok(None)` on bad credentials; `AuthBackendUnavailable` if the store cannot be reached.
    pub async fn login(&self, username: &str, password: &str) -> AppResult<Option<Principal>> {
        match self.bounded("login", self.store.login(username, password)).await? {
            Some(p) => {
                let p = self.admit(p).await?;
                info!(target: "login", realm = %self.settings.realm, user = %p.user_id, "login succeeded");
                Ok(Some(p))
            }
            None => {
                info!(target: "login", realm = %self.settings.realm, user = %username, "login denied");
                Ok(None)
            }
        }
    }

    pub async fn validate(&self, principal: &Principal) -> AppResult<bool> {
        Ok(self.validate_token(&principal.token).await?.is_some())
    }

    /// Ask the store whether `token` is still accepted, through the memo.
    /// A remembered acceptance only counts while `activeUsers` still holds the
    /// token; once another node logged it out, the store is asked again.
    /// A store outage leaves `activeUsers` untouched.
    pub async fn validate_token(&self, token: &str) -> AppResult<Option<Principal>> {
        match self.memo_get(token) {
            Some(None) => return Ok(None),
            Some(Some(p)) => {
                if self.active.get(token).await?.is_some() { return Ok(Some(p)); }
                debug!(target: "login", "memoized token no longer active, revalidating");
                self.memo.write().remove(token);
            }
            None => {}
        }
        match self.bounded("validate", self.store.validate(token)).await {
            Ok(Some(p)) => Ok(Some(self.admit(p).await?)),
            Ok(None) => {
                self.memo_put(token, None);
                if self.active.remove(token).await?.is_some() {
                    info!(target: "login", "dropped expired token from active users");
                }
                Ok(None)
            }
            Err(e) => {
                warn!(target: "login", error = %e, "token validation unavailable");
                Err(e)
            }
        }
    }

    /// Principal cached cluster-wide for `token`, if any.
    pub async fn resolve(&self, token: &str) -> AppResult<Option<Principal>> {
        self.active.get(token).await
    }

    pub async fn logout(&self, principal: &Principal) -> AppResult<()> { self.logout_token(&principal.token).await }

    pub async fn logout_token(&self, token: &str) -> AppResult<()> {
        self.memo.write().remove(token);
        if let Some(p) = self.active.remove(token).await? {
            info!(target: "login", realm = %self.settings.realm, user = %p.user_id, "logged out");
        }
        Ok(())
    }

    pub async fn probe(&self) -> AppResult<()> { self.bounded("probe", self.store.probe()).await }

    pub fn drop_memo(&self) {
        let n = {
            let mut memo = self.memo.write();
            let n = memo.len();
            memo.clear();
            n
        };
        debug!(target: "login", entries = n, "validation memo dropped");
    }
}

#[async_trait]
impl SessionListener for LoginService {
    async fn session_invalidated(&self, record: &SessionRecord) {
        let Some(token) = record.auth_token() else { return; };
        if let Err(e) = self.logout_token(token).await {
            warn!(target: "login", session = %record.id, "could not drop active user: {}", e);
        }
    }
}
