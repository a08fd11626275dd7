use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named advisory lock held in the control plane. Obtaining one is an
/// atomic PUT; a 409 means another worker owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}
