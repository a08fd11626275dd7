//! Typed client for the control-plane REST API.
//!
//! Workers authenticate with service-account credentials, receive a JWT and
//! present it as HTTP Basic auth (token as username, empty password) on every
//! call. All requests carry short timeouts so a stuck control plane trips the
//! per-loop watchdog instead of hanging a request forever.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use models::{Alert, CustomImage, CustomImagePatch, Lock, Session, SessionLogRecord, SessionPatch, Task, TaskState};

mod token;

/// Log in again when the current token has less than this left.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(900);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("login failed with status {status}")]
    LoginFailed { status: StatusCode },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{operation} failed with status {status}: {message}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

struct AuthState {
    basic_header: String,
    expires_at: Option<i64>,
}

/// Client for one control plane, shared by every controller in the worker.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ext_id: String,
    password: String,
    auth: RwLock<Option<AuthState>>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        ext_id: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ext_id: ext_id.into(),
            password: password.into(),
            auth: RwLock::new(None),
        })
    }

    pub async fn login(&self) -> Result<(), ApiError> {
        debug!(ext_id = %self.ext_id, "logging in");
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&json!({"ext_id": self.ext_id, "password": self.password}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::LoginFailed {
                status: resp.status(),
            });
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }
        let body: LoginResponse = resp.json().await?;
        let basic_header = format!("Basic {}", STANDARD.encode(format!("{}:", body.token)));
        let expires_at = token::unverified_expiry(&body.token);
        *self.auth.write().await = Some(AuthState {
            basic_header,
            expires_at,
        });
        Ok(())
    }

    /// Logs in if there is no token or the current one is about to expire.
    /// Called once per worker loop iteration.
    pub async fn ensure_session(&self) -> Result<(), ApiError> {
        let needs_login = match self.auth.read().await.as_ref() {
            None => true,
            Some(auth) => match auth.expires_at {
                Some(exp) => exp - Utc::now().timestamp() < TOKEN_REFRESH_MARGIN.as_secs() as i64,
                None => false,
            },
        };
        if needs_login {
            info!(ext_id = %self.ext_id, "session token missing or expiring, logging in");
            self.login().await?;
        }
        Ok(())
    }

    async fn auth_header(&self) -> Result<String, ApiError> {
        match self.auth.read().await.as_ref() {
            Some(auth) => Ok(auth.basic_header.clone()),
            None => Err(ApiError::NotLoggedIn),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    // --- sessions ---------------------------------------------------------

    /// Non-deleted sessions, newest first, capped at `limit`.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>, ApiError> {
        let resp = self
            .http
            .get(self.url("application_sessions"))
            .query(&[("limit", limit)])
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        Ok(expect_ok(resp, "list sessions").await?.json().await?)
    }

    /// `None` when the session is gone, which a lock holder treats as
    /// processed elsewhere.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, ApiError> {
        let resp = self
            .http
            .get(self.url(&format!("application_sessions/{id}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(expect_ok(resp, "get session").await?.json().await?))
    }

    pub async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<(), ApiError> {
        let resp = self
            .http
            .patch(self.url(&format!("application_sessions/{id}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(patch)
            .send()
            .await?;
        expect_ok(resp, "patch session").await?;
        Ok(())
    }

    pub async fn add_session_log(
        &self,
        id: &str,
        record: &SessionLogRecord,
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .patch(self.url(&format!("application_sessions/{id}/logs")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(&json!({"log_record": record}))
            .send()
            .await?;
        expect_ok(resp, "add session log").await?;
        Ok(())
    }

    // --- locks ------------------------------------------------------------

    pub async fn list_locks(&self) -> Result<Vec<Lock>, ApiError> {
        let resp = self
            .http
            .get(self.url("locks"))
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        Ok(expect_ok(resp, "list locks").await?.json().await?)
    }

    /// Atomic acquire. `false` means another owner holds the lock.
    pub async fn obtain_lock(&self, id: &str, owner: &str) -> Result<bool, ApiError> {
        let resp = self
            .http
            .put(self.url(&format!("locks/{id}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(&json!({"owner": owner}))
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let message = resp.text().await.unwrap_or_default();
                Err(ApiError::UnexpectedStatus {
                    operation: "obtain lock",
                    status,
                    message,
                })
            }
        }
    }

    /// Owner-scoped release. A missing lock counts as released.
    pub async fn release_lock(&self, id: &str, owner: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .delete(self.url(&format!("locks/{id}")))
            .query(&[("owner", owner)])
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_ok(resp, "release lock").await?;
        Ok(())
    }

    // --- alerts -----------------------------------------------------------

    pub async fn post_alerts(&self, alerts: &[Alert]) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.url("alerts"))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(alerts)
            .send()
            .await?;
        expect_ok(resp, "post alerts").await?;
        Ok(())
    }

    /// Archives the open alerts for one target and source.
    pub async fn reset_alerts(&self, target: &str, source: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.url(&format!("alert_reset/{target}/{source}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        expect_ok(resp, "reset alerts").await?;
        Ok(())
    }

    // --- custom images ----------------------------------------------------

    pub async fn list_unfinished_custom_images(&self) -> Result<Vec<CustomImage>, ApiError> {
        let resp = self
            .http
            .get(self.url("custom_images"))
            .query(&[("unfinished", "1")])
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        Ok(expect_ok(resp, "list custom images").await?.json().await?)
    }

    /// Prioritised work list (building before new), capped at `limit`.
    pub async fn list_custom_images(&self, limit: usize) -> Result<Vec<CustomImage>, ApiError> {
        let resp = self
            .http
            .get(self.url("custom_images"))
            .query(&[("limit", limit)])
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        Ok(expect_ok(resp, "list custom images").await?.json().await?)
    }

    pub async fn patch_custom_image(
        &self,
        id: &str,
        patch: &CustomImagePatch,
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .patch(self.url(&format!("custom_images/{id}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(patch)
            .send()
            .await?;
        expect_ok(resp, "patch custom image").await?;
        Ok(())
    }

    // --- tasks ------------------------------------------------------------

    pub async fn list_unfinished_tasks(&self) -> Result<Vec<Task>, ApiError> {
        let resp = self
            .http
            .get(self.url("tasks"))
            .query(&[("unfinished", "1")])
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await?;
        Ok(expect_ok(resp, "list tasks").await?.json().await?)
    }

    pub async fn update_task_state(&self, id: &str, state: TaskState) -> Result<(), ApiError> {
        let resp = self
            .http
            .patch(self.url(&format!("tasks/{id}")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(&json!({"state": state}))
            .send()
            .await?;
        expect_ok(resp, "update task").await?;
        Ok(())
    }

    pub async fn add_task_results(&self, id: &str, results: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .put(self.url(&format!("tasks/{id}/results")))
            .header(AUTHORIZATION, self.auth_header().await?)
            .json(&json!({"results": results}))
            .send()
            .await?;
        expect_ok(resp, "add task results").await?;
        Ok(())
    }
}

/// Passes successful responses through; failures are turned into a typed
/// error carrying the status and whatever message the server sent.
async fn expect_ok(
    resp: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ApiError::UnexpectedStatus {
        operation,
        status,
        message,
    })
}
