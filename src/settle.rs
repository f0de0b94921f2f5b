//! DOM settle wait.
//!
//! Tracks in-flight network requests on the lifecycle-pooled session:
//! `Network.requestWillBeSent` adds, `loadingFinished`/`loadingFailed`
//! remove. Polls every 100 ms and returns once the in-flight set has been
//! empty for one sample, or when the hard budget elapses.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::cdp::{CdpEvent, Session};
use crate::error::Result;

/// Sampling interval for the in-flight set
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why the settle wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleReason {
    /// No request was in flight for a full sample
    Quiet,
    /// The hard budget elapsed with requests still pending
    Timeout,
}

/// Result of a settle wait, reported in metrics
#[derive(Debug, Clone, Serialize)]
pub struct SettleOutcome {
    pub reason: SettleReason,
    pub waited_ms: u64,
    pub pending_at_exit: usize,
}

/// In-flight request bookkeeping, scoped to one session
#[derive(Debug, Default)]
struct InflightTracker {
    inflight: HashSet<String>,
}

impl InflightTracker {
    /// Apply one network event; events from other sessions are ignored
    fn on_event(&mut self, event: &CdpEvent, session_id: &str) {
        if event.session_id.as_deref() != Some(session_id) {
            return;
        }
        let Some(request_id) = event
            .params
            .get("requestId")
            .and_then(|v| v.as_str())
        else {
            return;
        };

        match event.method.as_str() {
            "Network.requestWillBeSent" => {
                self.inflight.insert(request_id.to_string());
            }
            "Network.loadingFinished" | "Network.loadingFailed" => {
                self.inflight.remove(request_id);
            }
            _ => {}
        }
    }

    fn is_quiet(&self) -> bool {
        self.inflight.is_empty()
    }

    fn pending(&self) -> usize {
        self.inflight.len()
    }
}

fn drain(rx: &mut mpsc::Receiver<CdpEvent>, tracker: &mut InflightTracker, session_id: &str) {
    while let Ok(event) = rx.try_recv() {
        tracker.on_event(&event, session_id);
    }
}

/// Wait for the DOM to settle on the lifecycle session.
///
/// Enables `Network` events on the session, then samples the in-flight set
/// every 100 ms until it is empty for one sample or `budget` elapses.
pub async fn wait_for_settled_dom(lifecycle: &Session, budget: Duration) -> Result<SettleOutcome> {
    let transport = lifecycle.transport();
    // Subscribe before enabling so the first burst of events is not missed.
    let mut sent = transport.subscribe("Network.requestWillBeSent").await;
    let mut finished = transport.subscribe("Network.loadingFinished").await;
    let mut failed = transport.subscribe("Network.loadingFailed").await;

    lifecycle.network_enable().await?;

    let session_id = lifecycle.session_id().to_string();
    let mut tracker = InflightTracker::default();
    let start = Instant::now();

    let outcome = loop {
        drain(&mut sent, &mut tracker, &session_id);
        drain(&mut finished, &mut tracker, &session_id);
        drain(&mut failed, &mut tracker, &session_id);

        if tracker.is_quiet() {
            break SettleOutcome {
                reason: SettleReason::Quiet,
                waited_ms: start.elapsed().as_millis() as u64,
                pending_at_exit: 0,
            };
        }
        if start.elapsed() >= budget {
            break SettleOutcome {
                reason: SettleReason::Timeout,
                waited_ms: start.elapsed().as_millis() as u64,
                pending_at_exit: tracker.pending(),
            };
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    };

    tracing::debug!(
        "DOM settle: {:?} after {}ms ({} pending)",
        outcome.reason,
        outcome.waited_ms,
        outcome.pending_at_exit
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(method: &str, request_id: &str, session: &str) -> CdpEvent {
        CdpEvent {
            method: method.to_string(),
            params: json!({ "requestId": request_id }),
            session_id: Some(session.to_string()),
        }
    }

    #[test]
    fn requests_are_tracked_until_finished() {
        let mut tracker = InflightTracker::default();
        assert!(tracker.is_quiet());

        tracker.on_event(&event("Network.requestWillBeSent", "r1", "S"), "S");
        tracker.on_event(&event("Network.requestWillBeSent", "r2", "S"), "S");
        assert_eq!(tracker.pending(), 2);

        tracker.on_event(&event("Network.loadingFinished", "r1", "S"), "S");
        assert_eq!(tracker.pending(), 1);

        tracker.on_event(&event("Network.loadingFailed", "r2", "S"), "S");
        assert!(tracker.is_quiet());
    }

    #[test]
    fn events_from_other_sessions_are_ignored() {
        let mut tracker = InflightTracker::default();
        tracker.on_event(&event("Network.requestWillBeSent", "r1", "OTHER"), "S");
        assert!(tracker.is_quiet());
    }

    #[test]
    fn finish_without_start_is_harmless() {
        let mut tracker = InflightTracker::default();
        tracker.on_event(&event("Network.loadingFinished", "ghost", "S"), "S");
        assert!(tracker.is_quiet());
    }
}
