use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertStatus {
    Ok,
    Firing,
}

/// One monitoring observation for a cluster, posted in batches to
/// POST `/alerts`. `target` is the cluster name, `source` the monitoring
/// system that produced the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub target: String,
    pub source: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub data: Value,
}

impl Alert {
    pub fn firing(target: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            status: AlertStatus::Firing,
            data,
        }
    }

    /// The heartbeat record appended to every non-empty batch so the API can
    /// tell "no problems" apart from "no data".
    pub fn ok(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            status: AlertStatus::Ok,
            data: Value::Null,
        }
    }
}
