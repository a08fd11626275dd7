use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogType {
    Provisioning,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One line in a session's log, uploaded via
/// PATCH `/application_sessions/{id}/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogRecord {
    pub message: String,
    /// Unix epoch seconds.
    pub timestamp: f64,
    pub log_type: LogType,
    pub log_level: LogLevel,
}

impl SessionLogRecord {
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::new(message, LogType::Provisioning, LogLevel::Info)
    }

    pub fn provisioning_error(message: impl Into<String>) -> Self {
        Self::new(message, LogType::Provisioning, LogLevel::Error)
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self::new(message, LogType::Running, LogLevel::Info)
    }

    fn new(message: impl Into<String>, log_type: LogType, log_level: LogLevel) -> Self {
        Self {
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            log_type,
            log_level,
        }
    }
}
