use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Lifecycle of a session. The API assigns `queueing` on creation; every
/// other transition is made by the worker holding the session's lock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    #[default]
    Queueing,
    Provisioning,
    Starting,
    Running,
    Deleting,
    Deleted,
    Failed,
}

impl SessionState {
    /// Terminal states are never left by the engine; only the API may
    /// requeue by creating a new session row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Deleted | SessionState::Failed)
    }
}

/// Frozen snapshot of the owning application's launch parameters, taken by
/// the API at session creation. Provisioning decisions depend only on this,
/// never on the live application row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProvisioningConfig {
    pub cluster: Option<String>,
    pub image: String,
    /// Memory request and limit, e.g. `1Gi`.
    pub memory_limit: String,
    /// Whitespace-separated `K=V` entries; malformed tokens are skipped.
    #[serde(default)]
    pub environment_vars: String,
    /// Argument template; `{session_id}` is substituted at render time.
    #[serde(default)]
    pub args: Option<String>,
    pub port: i32,
    pub volume_mount_path: String,
    #[serde(default)]
    pub endpoint_protocol: Option<String>,
}

/// Mutable per-session driver output, published once the workload is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionData {
    pub namespace: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub access: String,
}

/// One running instance of an application for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub user_id: String,
    #[serde(default)]
    pub user_pseudonym: String,
    pub application_id: String,
    pub state: SessionState,
    #[serde(default)]
    pub to_be_deleted: bool,
    #[serde(default)]
    pub log_fetch_pending: bool,
    /// Seconds of lifetime remaining, computed by the API.
    #[serde(default)]
    pub lifetime_left: i64,
    /// Zero means no limit.
    #[serde(default)]
    pub maximum_lifetime: i64,
    pub provisioning_config: ProvisioningConfig,
    #[serde(default)]
    pub session_data: Option<SessionData>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprovisioned_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A session with a lifetime limit that has run out.
    pub fn has_expired(&self) -> bool {
        self.maximum_lifetime > 0 && self.lifetime_left == 0
    }

    /// Deprovisioning applies to flagged and expired sessions alike, even
    /// ones still `queueing` or `starting` (partial state may need cleanup).
    pub fn needs_deprovisioning(&self) -> bool {
        self.to_be_deleted || self.has_expired()
    }
}

/// Partial update for PATCH `/application_sessions/{id}`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_data: Option<SessionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_be_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_fetch_pending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprovisioned_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn state(state: SessionState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}
