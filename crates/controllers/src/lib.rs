//! The reconcilers. Each controller is invoked every worker loop iteration,
//! rate-limits itself with a jittered next-check timestamp and owns one
//! slice of the system: sessions, cluster alerts, or custom images.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use api_client::ApiError;
use build_client::BuildError;
use drivers::DriverError;

mod cluster;
mod custom_image;
mod session;

pub use cluster::ClusterController;
pub use custom_image::CustomImageController;
pub use session::SessionController;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Jittered self-rate-limiting, overridable per controller through
/// `<NAME>_POLLING_INTERVAL_SEC_MIN` / `_MAX` environment variables.
pub(crate) struct Pacing {
    min_secs: u64,
    max_secs: u64,
    next_check: Instant,
}

impl Pacing {
    pub(crate) fn from_env(controller_name: &str, default_min: u64, default_max: u64) -> Self {
        let min_secs = env_interval(controller_name, "MIN", default_min);
        let max_secs = env_interval(controller_name, "MAX", default_max);
        info!(controller = controller_name, min_secs, max_secs, "polling interval");
        let (min_secs, max_secs) = if min_secs > max_secs {
            warn!(
                controller = controller_name,
                "polling interval min exceeds max, using defaults"
            );
            (default_min, default_max)
        } else {
            (min_secs, max_secs)
        };
        Self {
            min_secs,
            max_secs,
            next_check: Instant::now(),
        }
    }

    pub(crate) fn due(&self) -> bool {
        Instant::now() >= self.next_check
    }

    pub(crate) fn schedule_next(&mut self) {
        self.schedule_next_with_floor(0);
    }

    /// Schedules the next check at least `floor_secs` away, regardless of
    /// how tight the configured window is.
    pub(crate) fn schedule_next_with_floor(&mut self, floor_secs: u64) {
        let jitter = rand::thread_rng().gen_range(self.min_secs..=self.max_secs);
        self.next_check = Instant::now() + Duration::from_secs(jitter.max(floor_secs));
    }
}

fn env_interval(controller_name: &str, bound: &str, default: u64) -> u64 {
    match std::env::var(format!("{controller_name}_POLLING_INTERVAL_SEC_{bound}")) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}
