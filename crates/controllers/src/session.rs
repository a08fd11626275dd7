//! Session reconciliation. Stateless: every pass lists candidate sessions
//! from the API, takes per-session locks and advances each locked session
//! one step through its lifecycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use api_client::ApiClient;
use drivers::{Driver, DriverRegistry, Readiness};
use models::{Session, SessionLogRecord, SessionPatch, SessionState};

use crate::{ControllerError, Pacing};

const SESSION_LIST_LIMIT: usize = 50;

/// Running logs are uploaded tail-first, capped at 32 KiB.
const RUNNING_LOG_LIMIT: usize = 32 * 1024;

pub struct SessionController {
    worker_id: String,
    client: Arc<ApiClient>,
    registry: Arc<DriverRegistry>,
    pacing: Pacing,
}

impl SessionController {
    pub fn new(worker_id: String, client: Arc<ApiClient>, registry: Arc<DriverRegistry>) -> Self {
        Self {
            worker_id,
            client,
            registry,
            pacing: Pacing::from_env("SESSION_CONTROLLER", 2, 5),
        }
    }

    pub async fn process(&mut self) -> Result<(), ControllerError> {
        if !self.pacing.due() {
            return Ok(());
        }
        self.pacing.schedule_next();

        let sessions = self.client.list_sessions(SESSION_LIST_LIMIT).await?;
        let candidates: Vec<&Session> = sessions.iter().filter(|s| needs_attention(s)).collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let locks = self.client.list_locks().await?;
        let held_elsewhere: HashSet<&str> = locks
            .iter()
            .filter(|lock| lock.owner != self.worker_id)
            .map(|lock| lock.id.as_str())
            .collect();
        // locks left behind by a crashed instance of this worker id
        for lock in locks.iter().filter(|lock| lock.owner == self.worker_id) {
            warn!(lock = %lock.id, "releasing leftover lock");
            self.client.release_lock(&lock.id, &self.worker_id).await?;
        }

        for session in candidates {
            if held_elsewhere.contains(session.id.as_str()) {
                debug!(session = %session.name, "locked by another worker, skipping");
                continue;
            }
            if !self.client.obtain_lock(&session.id, &self.worker_id).await? {
                debug!(session = %session.name, "lost the lock race, skipping");
                continue;
            }
            let result = self.process_locked(session).await;
            if let Err(err) = &result {
                warn!(session = %session.name, error = %err, "session processing failed");
            }
            self.client.release_lock(&session.id, &self.worker_id).await?;
        }
        Ok(())
    }

    /// One lifecycle step for a session this worker holds the lock for.
    /// The session is refetched first: the listing may be stale by now.
    async fn process_locked(&self, candidate: &Session) -> Result<(), ControllerError> {
        let Some(mut session) = self.client.get_session(&candidate.id).await? else {
            info!(session = %candidate.name, "session gone, processed elsewhere");
            return Ok(());
        };
        if session.state != candidate.state {
            info!(
                session = %session.name,
                state = %session.state,
                "state changed since listing, skipping"
            );
            return Ok(());
        }

        // expiry is expressed through the same flag users delete with
        if session.state == SessionState::Running
            && session.has_expired()
            && !session.to_be_deleted
        {
            info!(session = %session.name, "maximum lifetime exceeded, marking for deletion");
            self.client
                .patch_session(
                    &session.id,
                    &SessionPatch {
                        to_be_deleted: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            session.to_be_deleted = true;
        }

        let Some(cluster_name) = session.provisioning_config.cluster.clone() else {
            warn!(session = %session.name, "no cluster in provisioning config");
            return Ok(());
        };
        let driver = self.registry.driver_for(&cluster_name).await?;

        if session.needs_deprovisioning() {
            if session.state != SessionState::Deleted {
                self.deprovision(&*driver, &session).await?;
            }
            return Ok(());
        }

        match session.state {
            SessionState::Queueing => self.provision(&*driver, &session).await,
            SessionState::Starting => self.check_readiness(&*driver, &session).await,
            SessionState::Running if session.log_fetch_pending => {
                self.fetch_running_logs(&*driver, &session).await
            }
            _ => Ok(()),
        }
    }

    async fn provision(&self, driver: &dyn Driver, session: &Session) -> Result<(), ControllerError> {
        info!(session = %session.name, "provisioning");
        self.client
            .add_session_log(&session.id, &SessionLogRecord::provisioning("created"))
            .await?;
        self.client
            .patch_session(&session.id, &SessionPatch::state(SessionState::Provisioning))
            .await?;
        match driver.provision(session).await {
            Ok(next_state) => {
                self.client
                    .patch_session(&session.id, &SessionPatch::state(next_state))
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.fail_session(session, &err.to_string()).await;
                Err(err.into())
            }
        }
    }

    async fn check_readiness(
        &self,
        driver: &dyn Driver,
        session: &Session,
    ) -> Result<(), ControllerError> {
        match driver.check_readiness(session).await {
            Ok(Readiness::Ready(session_data)) => {
                info!(session = %session.name, "session ready");
                self.client
                    .patch_session(
                        &session.id,
                        &SessionPatch {
                            state: Some(SessionState::Running),
                            session_data: Some(session_data),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.client
                    .add_session_log(&session.id, &SessionLogRecord::provisioning("ready"))
                    .await?;
                Ok(())
            }
            Ok(Readiness::Pending { event }) => {
                if let Some(event) = event {
                    self.client
                        .add_session_log(
                            &session.id,
                            &SessionLogRecord {
                                message: event.message,
                                timestamp: event.timestamp,
                                log_type: models::LogType::Provisioning,
                                log_level: models::LogLevel::Info,
                            },
                        )
                        .await?;
                }
                Ok(())
            }
            Err(err) => {
                self.fail_session(session, &err.to_string()).await;
                Err(err.into())
            }
        }
    }

    async fn deprovision(
        &self,
        driver: &dyn Driver,
        session: &Session,
    ) -> Result<(), ControllerError> {
        info!(session = %session.name, "deprovisioning");
        self.client
            .patch_session(&session.id, &SessionPatch::state(SessionState::Deleting))
            .await?;
        match driver.deprovision(session).await {
            Ok(()) => {
                self.client
                    .patch_session(
                        &session.id,
                        &SessionPatch {
                            state: Some(SessionState::Deleted),
                            deprovisioned_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.fail_session(session, &err.to_string()).await;
                Err(err.into())
            }
        }
    }

    /// Uploads the tail of the workload's own logs. A driver failure here
    /// does not fail the session, the next flagged fetch simply retries.
    async fn fetch_running_logs(
        &self,
        driver: &dyn Driver,
        session: &Session,
    ) -> Result<(), ControllerError> {
        if let Some(logs) = driver.fetch_running_logs(session).await? {
            self.client
                .add_session_log(
                    &session.id,
                    &SessionLogRecord::running(log_tail(&logs, RUNNING_LOG_LIMIT)),
                )
                .await?;
        }
        self.client
            .patch_session(
                &session.id,
                &SessionPatch {
                    log_fetch_pending: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Marks the session failed with an error-level log line. Best effort:
    /// the underlying driver error is what gets reported upwards.
    async fn fail_session(&self, session: &Session, message: &str) {
        warn!(session = %session.name, error = %message, "marking session failed");
        if let Err(err) = self
            .client
            .add_session_log(&session.id, &SessionLogRecord::provisioning_error(message))
            .await
        {
            warn!(session = %session.name, error = %err, "could not record failure log");
        }
        if let Err(err) = self
            .client
            .patch_session(&session.id, &SessionPatch::state(SessionState::Failed))
            .await
        {
            warn!(session = %session.name, error = %err, "could not patch session to failed");
        }
    }
}

fn needs_attention(session: &Session) -> bool {
    if session.needs_deprovisioning() {
        return session.state != SessionState::Deleted;
    }
    match session.state {
        SessionState::Queueing | SessionState::Starting => true,
        SessionState::Running => session.log_fetch_pending,
        _ => false,
    }
}

/// Final `limit` bytes of `logs`, aligned to a character boundary.
fn log_tail(logs: &str, limit: usize) -> &str {
    if logs.len() <= limit {
        return logs;
    }
    let mut start = logs.len() - limit;
    while !logs.is_char_boundary(start) {
        start += 1;
    }
    &logs[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(state: SessionState) -> Session {
        serde_json::from_value(serde_json::json!({
            "id": "s-1",
            "name": "pb-xyz",
            "user_id": "u-1",
            "application_id": "a-1",
            "state": state,
            "provisioning_config": {
                "cluster": "dummy",
                "image": "img",
                "memory_limit": "1Gi",
                "port": 8888,
                "volume_mount_path": "/home/jovyan/work"
            }
        }))
        .unwrap()
    }

    #[test]
    fn queueing_and_starting_sessions_need_attention() {
        assert!(needs_attention(&session(SessionState::Queueing)));
        assert!(needs_attention(&session(SessionState::Starting)));
        assert!(!needs_attention(&session(SessionState::Provisioning)));
        assert!(!needs_attention(&session(SessionState::Running)));
    }

    #[test]
    fn running_sessions_need_attention_only_for_log_fetches() {
        let mut s = session(SessionState::Running);
        s.log_fetch_pending = true;
        assert!(needs_attention(&s));
    }

    #[test]
    fn flagged_sessions_need_attention_in_any_non_deleted_state() {
        for state in [
            SessionState::Queueing,
            SessionState::Running,
            SessionState::Failed,
        ] {
            let mut s = session(state);
            s.to_be_deleted = true;
            assert!(needs_attention(&s));
        }
        let mut s = session(SessionState::Deleted);
        s.to_be_deleted = true;
        assert!(!needs_attention(&s));
    }

    #[test]
    fn log_tail_respects_char_boundaries() {
        assert_eq!(log_tail("abcdef", 10), "abcdef");
        assert_eq!(log_tail("abcdef", 3), "def");
        // 'ä' is two bytes; a cut inside it moves forward past it
        assert_eq!(log_tail("aäb", 2), "b");
    }
}
