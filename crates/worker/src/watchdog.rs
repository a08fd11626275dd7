//! Emergency brake for a stuck main loop. The loop arms the watchdog before
//! doing work and disarms it after; if a pass ever hangs past the deadline
//! the process exits and the orchestrator restarts it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::error;

pub struct Watchdog {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Watchdog {
    pub fn start() -> Self {
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let shared = deadline.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if expired(&shared) {
                    error!("watchdog deadline passed, terminating worker");
                    std::process::exit(2);
                }
            }
        });
        Self { deadline }
    }

    pub fn arm(&self, timeout: Duration) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + timeout);
        }
    }

    pub fn disarm(&self) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = None;
        }
    }
}

fn expired(deadline: &Mutex<Option<Instant>>) -> bool {
    match deadline.lock() {
        Ok(deadline) => matches!(*deadline, Some(at) if Instant::now() >= at),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_watchdog_expires_after_the_timeout() {
        let deadline = Mutex::new(Some(Instant::now() - Duration::from_secs(1)));
        assert!(expired(&deadline));

        let deadline = Mutex::new(Some(Instant::now() + Duration::from_secs(60)));
        assert!(!expired(&deadline));
    }

    #[test]
    fn disarmed_watchdog_never_expires() {
        let deadline = Mutex::new(None);
        assert!(!expired(&deadline));
    }
}
