//! Value objects exchanged with the control-plane API.
//!
//! The control plane owns the durable state; workers receive these as JSON
//! and patch them back through the typed API client. Nothing in this crate
//! performs I/O.

mod alert;
mod custom_image;
mod lock;
mod log_record;
mod session;
mod task;

pub use alert::{Alert, AlertStatus};
pub use custom_image::{
    CustomImage, CustomImagePatch, CustomImageState, ImageContent, ImageContentKind,
    ImageDefinition,
};
pub use lock::Lock;
pub use log_record::{LogLevel, LogType, SessionLogRecord};
pub use session::{
    Endpoint, ProvisioningConfig, Session, SessionData, SessionPatch, SessionState,
};
pub use task::{Task, TaskKind, TaskState};
