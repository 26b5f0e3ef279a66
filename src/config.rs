//!
//! camelback configuration
//! -----------------------
//! JSON configuration document (camelCase keys) with environment overrides.
//! Absent keys take their defaults; only URLs, ports and the thread pool size
//! are checked.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::deploy::{ProviderSettings, DEFAULT_MAX_ARTIFACT_BYTES};
use crate::error::{AppError, AppResult};
use crate::fabric::FabricConfig;
use crate::identity::{CouchDbSettings, LoginSettings, SsoSettings};
use crate::session::SessionSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CamelbackConfig {
    pub port: u16,
    pub secure_port: Option<u16>,
    pub bind_address: String,
    pub thread_pool_size: usize,
    /// Path of the fabric configuration document.
    pub hazelcast_config: Option<PathBuf>,
    pub login_config: LoginConfig,
    pub deployer_config: DeployerConfig,
    pub session_config: SessionConfig,
    pub ssl_config: SslConfig,
}

impl Default for CamelbackConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            secure_port: None,
            bind_address: "0.0.0.0".to_string(),
            thread_pool_size: 16,
            hazelcast_config: None,
            login_config: LoginConfig::default(),
            deployer_config: DeployerConfig::default(),
            session_config: SessionConfig::default(),
            ssl_config: SslConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginConfig {
    pub authentication_url: String,
    /// Defaults to `authenticationUrl`.
    pub session_url: Option<String>,
    pub cookie_name: String,
    pub token_header: String,
    pub login_path: String,
    pub post_login_url: String,
    pub validation_ttl_secs: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub startup_probe: bool,
    pub realm: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            authentication_url: String::new(),
            session_url: None,
            cookie_name: "AuthSession".to_string(),
            token_header: "X-Auth-Token".to_string(),
            login_path: "/login".to_string(),
            post_login_url: "/".to_string(),
            validation_ttl_secs: 60,
            request_timeout_ms: 3_000,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 3_000,
            startup_probe: false,
            realm: "couchdb_realm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployerConfig {
    pub database_url: String,
    pub view: String,
    /// Milliseconds.
    pub poll_interval: u64,
    pub artifact_dir: Option<PathBuf>,
    pub max_artifact_bytes: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub drain_grace_secs: u64,
    pub max_start_failures: u32,
    pub workers: usize,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            view: String::new(),
            poll_interval: 5_000,
            artifact_dir: None,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 3_000,
            drain_grace_secs: 30,
            max_start_failures: 5,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub url_parameter: String,
    /// Zero disables expiry.
    pub max_inactive_secs: u64,
    pub scavenge_interval_secs: u64,
    pub tombstone_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "camelback_session".to_string(),
            url_parameter: "sessionid".to_string(),
            max_inactive_secs: 1_800,
            scavenge_interval_secs: 60,
            tombstone_ttl_secs: 3_600,
        }
    }
}

/// TLS material. Reported at startup only; HTTPS is terminated elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub keystore: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub keystore_password: Option<String>,
    #[serde(skip_serializing)]
    pub key_manager_password: Option<String>,
    pub truststore: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub truststore_password: Option<String>,
}

impl SslConfig {
    pub fn enabled(&self) -> bool { self.keystore.is_some() }
}

fn parse_url(what: &str, raw: &str) -> AppResult<Url> {
    if raw.trim().is_empty() {
        return Err(AppError::config(format!("{} is required", what)));
    }
    Url::parse(raw).map_err(|e| AppError::config(format!("{} '{}': {}", what, raw, e)))
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: String) -> AppResult<T> {
    raw.trim().parse::<T>().map_err(|_| AppError::config(format!("{}: cannot parse '{}'", name, raw)))
}

impl CamelbackConfig {
    pub fn from_json(text: &str) -> AppResult<Self> {
        serde_json::from_str(text).map_err(|e| AppError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text).map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `CAMELBACK_*` environment variables.
    pub fn apply_env(&mut self) -> AppResult<()> { self.apply_overrides(|k| std::env::var(k).ok()) }

    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) -> AppResult<()> {
        if let Some(v) = lookup("CAMELBACK_PORT") { self.port = parse_env("CAMELBACK_PORT", v)?; }
        if let Some(v) = lookup("CAMELBACK_SECURE_PORT") { self.secure_port = Some(parse_env("CAMELBACK_SECURE_PORT", v)?); }
        if let Some(v) = lookup("CAMELBACK_THREADS") { self.thread_pool_size = parse_env("CAMELBACK_THREADS", v)?; }
        if let Some(v) = lookup("CAMELBACK_DATABASE_URL") { self.deployer_config.database_url = v; }
        if let Some(v) = lookup("CAMELBACK_AUTH_URL") { self.login_config.authentication_url = v; }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.port == 0 { return Err(AppError::config("port must be non-zero")); }
        if self.secure_port == Some(0) { return Err(AppError::config("securePort must be non-zero")); }
        if self.thread_pool_size == 0 { return Err(AppError::config("threadPoolSize must be at least 1")); }
        parse_url("loginConfig.authenticationUrl", &self.login_config.authentication_url)?;
        if let Some(s) = &self.login_config.session_url { parse_url("loginConfig.sessionUrl", s)?; }
        parse_url("deployerConfig.databaseUrl", &self.deployer_config.database_url)?;
        if self.deployer_config.view.trim().is_empty() {
            return Err(AppError::config("deployerConfig.view is required"));
        }
        Ok(())
    }

    /// The fabric document named by `hazelcastConfig`, or the defaults.
    pub fn fabric_config(&self) -> AppResult<FabricConfig> {
        match &self.hazelcast_config {
            Some(p) => FabricConfig::load(p),
            None => Ok(FabricConfig::default()),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.deployer_config.artifact_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("camelback-artifacts"))
    }

    pub fn database_url(&self) -> AppResult<Url> { parse_url("deployerConfig.databaseUrl", &self.deployer_config.database_url) }

    pub fn couchdb_settings(&self) -> AppResult<CouchDbSettings> {
        let lc = &self.login_config;
        let authentication_url = parse_url("loginConfig.authenticationUrl", &lc.authentication_url)?;
        let session_url = match &lc.session_url {
            Some(s) => parse_url("loginConfig.sessionUrl", s)?,
            None => authentication_url.clone(),
        };
        Ok(CouchDbSettings {
            authentication_url,
            session_url,
            cookie_name: lc.cookie_name.clone(),
            token_header: lc.token_header.clone(),
            connect_timeout: Duration::from_millis(lc.connect_timeout_ms),
            read_timeout: Duration::from_millis(lc.read_timeout_ms),
        })
    }

    pub fn login_settings(&self) -> LoginSettings {
        LoginSettings {
            realm: self.login_config.realm.clone(),
            validation_ttl: Duration::from_secs(self.login_config.validation_ttl_secs),
            request_timeout: Duration::from_millis(self.login_config.request_timeout_ms),
        }
    }

    pub fn sso_settings(&self) -> SsoSettings {
        SsoSettings {
            cookie_name: self.login_config.cookie_name.clone(),
            token_header: self.login_config.token_header.clone(),
            login_path: self.login_config.login_path.clone(),
            post_login_url: self.login_config.post_login_url.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_inactive: Duration::from_secs(self.session_config.max_inactive_secs),
            scavenge_interval: Duration::from_secs(self.session_config.scavenge_interval_secs.max(1)),
        }
    }

    pub fn tombstone_ttl(&self) -> Duration { Duration::from_secs(self.session_config.tombstone_ttl_secs) }

    pub fn provider_settings(&self) -> ProviderSettings {
        let dc = &self.deployer_config;
        ProviderSettings {
            poll_interval: Duration::from_millis(dc.poll_interval.max(1)),
            drain_grace: Duration::from_secs(dc.drain_grace_secs),
            max_start_failures: dc.max_start_failures.max(1),
            workers: dc.workers.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"{
        "loginConfig": { "authenticationUrl": "http://127.0.0.1:5984/_session" },
        "deployerConfig": { "databaseUrl": "http://127.0.0.1:5984/apps", "view": "_design/apps/_view/deployments" }
    }"#;

    #[test]
    fn absent_keys_take_defaults() {
        let c = CamelbackConfig::from_json(MINIMAL).unwrap();
        c.validate().unwrap();
        assert_eq!(c.port, 8080);
        assert_eq!(c.bind_address, "0.0.0.0");
        assert_eq!(c.deployer_config.poll_interval, 5_000);
        assert_eq!(c.deployer_config.max_artifact_bytes, 256 * 1024 * 1024);
        assert_eq!(c.session_config.cookie_name, "camelback_session");
        assert_eq!(c.login_settings().validation_ttl, Duration::from_secs(60));
        let couch = c.couchdb_settings().unwrap();
        assert_eq!(couch.session_url, couch.authentication_url);
        assert_eq!(couch.connect_timeout, Duration::from_secs(1));
        assert!(!c.ssl_config.enabled());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut c = CamelbackConfig::from_json(MINIMAL).unwrap();
        let env: HashMap<&str, &str> =
            [("CAMELBACK_PORT", "9090"), ("CAMELBACK_THREADS", "2"), ("CAMELBACK_AUTH_URL", "http://auth.local/_session")].into_iter().collect();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.port, 9090);
        assert_eq!(c.thread_pool_size, 2);
        assert_eq!(c.login_config.authentication_url, "http://auth.local/_session");
        assert_eq!(c.deployer_config.database_url, "http://127.0.0.1:5984/apps");

        let err = c.apply_overrides(|k| (k == "CAMELBACK_PORT").then(|| "eighty".to_string())).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut c = CamelbackConfig::from_json(MINIMAL).unwrap();
        c.thread_pool_size = 0;
        assert!(matches!(c.validate(), Err(AppError::ConfigInvalid(_))));

        let mut c = CamelbackConfig::from_json(MINIMAL).unwrap();
        c.login_config.authentication_url = "not a url".into();
        assert!(matches!(c.validate(), Err(AppError::ConfigInvalid(_))));

        let c = CamelbackConfig::from_json("{}").unwrap();
        assert!(c.validate().is_err());
        assert!(CamelbackConfig::from_json("{\"port\": \"x\"}").is_err());
    }

    #[test]
    fn ssl_passwords_are_not_echoed() {
        let mut c = CamelbackConfig::from_json(MINIMAL).unwrap();
        c.ssl_config.keystore = Some(PathBuf::from("/etc/camelback/keystore.p12"));
        c.ssl_config.keystore_password = Some("hunter2".into());
        let shown = serde_json::to_string(&c).unwrap();
        assert!(shown.contains("keystore.p12"));
        assert!(!shown.contains("hunter2"));
        assert!(c.ssl_config.enabled());
    }

    #[test]
    fn fabric_document_is_loaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.json");
        std::fs::write(&path, r#"{"clusterName":"prod","operationTimeoutMs":250}"#).unwrap();
        let mut c = CamelbackConfig::from_json(MINIMAL).unwrap();
        c.hazelcast_config = Some(path);
        let f = c.fabric_config().unwrap();
        assert_eq!(f.cluster_name, "prod");
        assert_eq!(f.operation_timeout(), Duration::from_millis(250));

        c.hazelcast_config = Some(dir.path().join("missing.json"));
        assert!(matches!(c.fabric_config(), Err(AppError::ConfigInvalid(_))));
    }
}
