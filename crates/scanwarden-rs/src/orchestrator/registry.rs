use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    error::ScanError,
    executor::CancelToken,
    models::{ScanState, ScanStatus},
};

struct ScanEntry {
    state: watch::Sender<ScanState>,
    cancel: CancelToken,
    /// Set once a `run_scan` call owns the scan, while it is still PENDING.
    claimed: bool,
    percent: u8,
    vulnerabilities_so_far: usize,
    error_message: Option<String>,
}

impl ScanEntry {
    fn pending() -> Self {
        let (state, _) = watch::channel(ScanState::Pending);
        Self {
            state,
            cancel: CancelToken::new(),
            claimed: false,
            percent: 0,
            vulnerabilities_so_far: 0,
            error_message: None,
        }
    }

    fn current(&self) -> ScanState {
        *self.state.borrow()
    }
}

pub(crate) enum CancelRequest {
    AlreadyTerminal,
    /// The scan never started; it is now CANCELLED.
    BeforeStart,
    /// The token fired; the receiver observes the scan reaching a terminal state.
    Signalled(watch::Receiver<ScanState>),
}

/// Scans known to this process, keyed by scan id. The lock is never held
/// across an await.
#[derive(Clone, Default)]
pub(crate) struct ScanRegistry {
    scans: Arc<Mutex<HashMap<String, ScanEntry>>>,
}

impl ScanRegistry {
    /// Records a PENDING scan. Re-registering a PENDING scan is a no-op.
    pub(crate) fn register(&self, scan_id: &str) -> Result<(), ScanError> {
        let mut scans = self.scans.lock();
        match scans.get(scan_id) {
            None => {
                scans.insert(scan_id.to_string(), ScanEntry::pending());
                Ok(())
            }
            Some(entry) if entry.current() == ScanState::Pending => Ok(()),
            Some(entry) => Err(ScanError::ScanAlreadyStarted {
                scan_id: scan_id.to_string(),
                state: entry.current(),
            }),
        }
    }

    /// Atomically takes ownership of an unclaimed PENDING (or unknown) scan.
    pub(crate) fn claim(&self, scan_id: &str) -> Result<CancelToken, ScanError> {
        let mut scans = self.scans.lock();
        let entry = scans
            .entry(scan_id.to_string())
            .or_insert_with(ScanEntry::pending);
        let state = entry.current();
        if state != ScanState::Pending || entry.claimed {
            let state = if entry.claimed && state == ScanState::Pending {
                ScanState::Running
            } else {
                state
            };
            return Err(ScanError::ScanAlreadyStarted {
                scan_id: scan_id.to_string(),
                state,
            });
        }
        entry.claimed = true;
        Ok(entry.cancel.clone())
    }

    /// Applies a state-machine transition. Invalid transitions are refused and logged.
    pub(crate) fn transition(&self, scan_id: &str, next: ScanState) -> bool {
        let scans = self.scans.lock();
        let Some(entry) = scans.get(scan_id) else {
            return false;
        };
        let from = entry.current();
        if !from.can_transition_to(next) {
            warn!(scan_id, %from, to = %next, "refusing invalid scan state transition");
            return false;
        }
        entry.state.send_replace(next);
        info!(scan_id, %from, to = %next, "scan state changed");
        true
    }

    pub(crate) fn record_progress(&self, scan_id: &str, percent: u8, vulnerabilities_so_far: usize) {
        if let Some(entry) = self.scans.lock().get_mut(scan_id) {
            entry.percent = entry.percent.max(percent.min(100));
            entry.vulnerabilities_so_far = vulnerabilities_so_far;
        }
    }

    pub(crate) fn record_error(&self, scan_id: &str, message: impl Into<String>) {
        if let Some(entry) = self.scans.lock().get_mut(scan_id) {
            entry.error_message = Some(message.into());
        }
    }

    pub(crate) fn percent(&self, scan_id: &str) -> u8 {
        self.scans.lock().get(scan_id).map_or(0, |e| e.percent)
    }

    pub(crate) fn status(&self, scan_id: &str) -> Option<ScanStatus> {
        self.scans.lock().get(scan_id).map(|entry| ScanStatus {
            scan_id: scan_id.to_string(),
            state: entry.current(),
            percent: entry.percent,
            vulnerabilities_so_far: entry.vulnerabilities_so_far,
            error_message: entry.error_message.clone(),
        })
    }

    /// Removes a terminal scan. Live scans stay registered.
    pub(crate) fn forget(&self, scan_id: &str) -> bool {
        let mut scans = self.scans.lock();
        match scans.get(scan_id) {
            Some(entry) if entry.current().is_terminal() => {
                scans.remove(scan_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn request_cancel(&self, scan_id: &str) -> Result<CancelRequest, ScanError> {
        let mut scans = self.scans.lock();
        let entry = scans
            .get_mut(scan_id)
            .ok_or_else(|| ScanError::ScanNotFound(scan_id.to_string()))?;

        let state = entry.current();
        if state.is_terminal() {
            return Ok(CancelRequest::AlreadyTerminal);
        }
        entry.cancel.cancel();
        if state == ScanState::Pending && !entry.claimed {
            entry.state.send_replace(ScanState::Cancelled);
            entry.error_message = Some("cancelled before start".into());
            info!(scan_id, "scan cancelled before start");
            return Ok(CancelRequest::BeforeStart);
        }
        info!(scan_id, %state, "cancellation signalled");
        Ok(CancelRequest::Signalled(entry.state.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_rejected() {
        let registry = ScanRegistry::default();
        registry.claim("s1").unwrap();
        let err = registry.claim("s1").unwrap_err();
        assert!(matches!(err, ScanError::ScanAlreadyStarted { state: ScanState::Running, .. }));
    }

    #[test]
    fn terminal_state_is_final() {
        let registry = ScanRegistry::default();
        registry.claim("s1").unwrap();
        assert!(registry.transition("s1", ScanState::Running));
        assert!(registry.transition("s1", ScanState::Completed));
        assert!(!registry.transition("s1", ScanState::Failed));
        assert!(!registry.transition("s1", ScanState::Running));
        assert_eq!(registry.status("s1").unwrap().state, ScanState::Completed);
    }

    #[test]
    fn unclaimed_pending_scan_cancels_immediately() {
        let registry = ScanRegistry::default();
        registry.register("s1").unwrap();
        assert!(matches!(registry.request_cancel("s1").unwrap(), CancelRequest::BeforeStart));
        assert!(matches!(registry.request_cancel("s1").unwrap(), CancelRequest::AlreadyTerminal));
        assert!(registry.claim("s1").is_err());
    }

    #[test]
    fn only_finished_scans_are_forgotten() {
        let registry = ScanRegistry::default();
        registry.claim("s1").unwrap();
        assert!(registry.transition("s1", ScanState::Running));
        assert!(!registry.forget("s1"));
        assert!(registry.transition("s1", ScanState::Completed));
        assert!(registry.forget("s1"));
        assert!(registry.status("s1").is_none());
        assert!(!registry.forget("s1"));
    }

    #[test]
    fn unknown_scan_cannot_be_cancelled() {
        let registry = ScanRegistry::default();
        assert!(matches!(registry.request_cancel("nope"), Err(ScanError::ScanNotFound(_))));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let registry = ScanRegistry::default();
        registry.register("s1").unwrap();
        registry.record_progress("s1", 50, 2);
        registry.record_progress("s1", 30, 3);
        let status = registry.status("s1").unwrap();
        assert_eq!(status.percent, 50);
        assert_eq!(status.vulnerabilities_so_far, 3);
    }
}
