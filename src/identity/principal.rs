use serde::{Deserialize, Serialize};

/// An authenticated identity as cached in `activeUsers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Opaque auth token issued by the credential store.
    pub token: String,
    /// Epoch millis of the login or validation that produced this entry.
    #[serde(default)]
    pub issued_ms: i64,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool { self.roles.iter().any(|r| r == role) }
}
