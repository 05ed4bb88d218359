use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::UpdateError;
use crate::types::DownloadProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Downloading,
    Completed,
    Error,
}

/// Point-in-time copy of the daemon's download session, as served on `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: DaemonState,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The daemon's one piece of shared mutable state. Writers take the lock
/// exclusively; readers only ever see clones.
#[derive(Clone)]
pub struct DaemonStatus {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl DaemonStatus {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StatusSnapshot {
                state: DaemonState::Idle,
                version: version.into(),
                file: None,
                progress: None,
                error: None,
            })),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    pub fn set_state(&self, state: DaemonState) {
        self.update(|s| s.state = state);
    }

    /// Record progress. The state is left as it is.
    pub fn set_progress(&self, progress: &DownloadProgress) {
        self.update(|s| s.progress = Some(progress.clone()));
    }

    /// Mark the session completed with `file` and clear any earlier error.
    pub fn set_completed(&self, file: impl Into<String>) {
        let file = file.into();
        self.update(|s| {
            s.state = DaemonState::Completed;
            s.file = Some(file);
            s.error = None;
        });
    }

    /// Mark the session failed. `None` leaves the status untouched.
    pub fn set_error(&self, err: Option<&UpdateError>) {
        if let Some(err) = err {
            let message = err.to_string();
            self.update(|s| {
                s.state = DaemonState::Error;
                s.error = Some(message);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn progress(downloaded: u64) -> DownloadProgress {
        DownloadProgress {
            version: "1.0.0".into(),
            downloaded,
            total: 200,
            percentage: downloaded as f64 / 2.0,
            speed: 10.0,
        }
    }

    #[test]
    fn starts_idle() {
        let status = DaemonStatus::new("1.0.0");
        let snap = status.snapshot();
        assert_eq!(snap.state, DaemonState::Idle);
        assert_eq!(
            serde_json::to_value(&snap).unwrap(),
            json!({"state": "idle", "version": "1.0.0"})
        );
    }

    #[test]
    fn progress_does_not_change_state() {
        let status = DaemonStatus::new("1.0.0");
        status.set_progress(&progress(50));
        assert_eq!(status.snapshot().state, DaemonState::Idle);

        status.set_state(DaemonState::Downloading);
        status.set_progress(&progress(100));
        let snap = status.snapshot();
        assert_eq!(snap.state, DaemonState::Downloading);
        assert_eq!(snap.progress.unwrap().downloaded, 100);
    }

    #[test]
    fn completed_clears_error() {
        let status = DaemonStatus::new("1.0.0");
        status.set_error(Some(&UpdateError::Network("reset".into())));
        assert_eq!(status.snapshot().state, DaemonState::Error);

        status.set_completed("/tmp/app1.zip");
        let snap = status.snapshot();
        assert_eq!(snap.state, DaemonState::Completed);
        assert_eq!(snap.file.as_deref(), Some("/tmp/app1.zip"));
        assert!(snap.error.is_none());
    }

    #[test]
    fn none_error_is_ignored() {
        let status = DaemonStatus::new("1.0.0");
        status.set_state(DaemonState::Downloading);
        status.set_error(None);
        assert_eq!(status.snapshot().state, DaemonState::Downloading);
        assert!(status.snapshot().error.is_none());
    }

    #[test]
    fn progress_serializes_without_version() {
        let status = DaemonStatus::new("1.0.0");
        status.set_state(DaemonState::Downloading);
        status.set_progress(&progress(100));
        let value = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(
            value["progress"],
            json!({"downloaded": 100, "total": 200, "percentage": 50.0, "speed": 10.0})
        );
    }
}
