use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

/// Deferred work kinds the control plane may queue. Unknown kinds are left
/// untouched for whatever process does recognise them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    WorkspaceVolumeBackup,
    WorkspaceVolumeRestore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    New,
    Processing,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub results: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_snake_case_names() {
        assert_eq!(
            serde_json::to_value(TaskKind::WorkspaceVolumeBackup).unwrap(),
            serde_json::json!("workspace_volume_backup")
        );
        assert_eq!(
            "workspace_volume_restore".parse::<TaskKind>().unwrap(),
            TaskKind::WorkspaceVolumeRestore
        );
    }
}
