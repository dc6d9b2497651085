//! Collaboration Broker: out-of-band asks between workers.
//!
//! A requester submits a request addressed to a target role and later waits
//! for the answer with [`CollaborationBroker::await_response`]. Waiting only
//! suspends the caller; the target learns about the request through its
//! inbox (push) or [`CollaborationBroker::pending_for`] (poll).
//!
//! Lifecycle:
//!   1. `submit()` record is `pending`, target inbox is notified
//!   2. `respond()` record becomes `completed`, every waiter wakes
//!   3. `await_response()` `Responded`, or `TimedOut` (record → `timeout`),
//!      or `Cancelled` when the plan's token fires
//!   4. `purge_expired()` pending records past their deadline become
//!      `timeout`; resolved records are dropped after retention

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::models::collaboration::{CollaborationRequest, CollaborationStatus};

/// Result of waiting on a collaboration request. A timeout is an outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CollaborationOutcome {
    Responded(serde_json::Value),
    TimedOut,
    Cancelled,
}

impl CollaborationOutcome {
    pub fn response(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Responded(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Receiving end of a role's inbox.
pub type Inbox = mpsc::UnboundedReceiver<CollaborationRequest>;

struct RequestEntry {
    request: CollaborationRequest,
    status_tx: watch::Sender<CollaborationStatus>,
}

#[derive(Default)]
struct BrokerInner {
    requests: HashMap<String, RequestEntry>,
    inboxes: HashMap<String, mpsc::UnboundedSender<CollaborationRequest>>,
}

/// Process-wide broker shared by every plan; cheap to clone.
#[derive(Clone, Default)]
pub struct CollaborationBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl CollaborationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerInner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::lock_poisoned("collaboration broker"))
    }

    /// Attach an inbox for `target`; a later call replaces the earlier one.
    pub fn register_inbox(&self, target: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.inboxes.insert(target.to_string(), tx);
        tracing::debug!("[Broker] Inbox registered for '{}'", target);
        Ok(rx)
    }

    /// Record a new `pending` request and notify the target. Returns at once.
    ///
    /// `timeout` bounds the request's life even if nobody awaits it: once it
    /// passes, [`purge_expired`](Self::purge_expired) marks it `timeout`.
    pub fn submit(
        &self,
        requester: &str,
        target: &str,
        description: &str,
        context: HashMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> Result<String> {
        let request = CollaborationRequest::new(
            requester.to_string(),
            target.to_string(),
            description.to_string(),
            context,
            timeout,
        );
        let request_id = request.id.clone();
        let (status_tx, _) = watch::channel(CollaborationStatus::Pending);

        let mut inner = self.lock()?;
        inner.requests.insert(
            request_id.clone(),
            RequestEntry {
                request: request.clone(),
                status_tx,
            },
        );

        let delivered = inner
            .inboxes
            .get(target)
            .map(|tx| tx.send(request).is_ok());
        match delivered {
            Some(true) => {}
            Some(false) => {
                inner.inboxes.remove(target);
                tracing::warn!(
                    "[Broker] Inbox for '{}' is closed; request {} must be polled",
                    target,
                    request_id
                );
            }
            None => {
                tracing::debug!(
                    "[Broker] No inbox for '{}'; request {} must be polled",
                    target,
                    request_id
                );
            }
        }

        tracing::info!(
            "[Broker] {} -> {}: request {} submitted",
            requester,
            target,
            request_id
        );
        Ok(request_id)
    }

    /// Answer a pending request and wake every waiter.
    pub fn respond(&self, request_id: &str, payload: serde_json::Value) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner
            .requests
            .get_mut(request_id)
            .filter(|e| e.request.is_pending())
            .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;

        entry.request.status = CollaborationStatus::Completed;
        entry.request.resolved_at = Some(Utc::now());
        entry.request.response = Some(payload);
        entry.status_tx.send_replace(CollaborationStatus::Completed);

        tracing::info!("[Broker] Request {} answered by {}", request_id, entry.request.target);
        Ok(())
    }

    /// Wait for the answer to `request_id`.
    ///
    /// Suspends only the caller. On timeout the request is marked `timeout`;
    /// a late `respond()` then fails with `UnknownRequest`. Cancellation also
    /// closes the request.
    pub async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CollaborationOutcome> {
        let mut status_rx = {
            let inner = self.lock()?;
            let entry = inner
                .requests
                .get(request_id)
                .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;
            if !entry.request.is_pending() {
                return Ok(outcome_of(&entry.request));
            }
            entry.status_tx.subscribe()
        };

        let resolved = async {
            status_rx
                .wait_for(|status| *status != CollaborationStatus::Pending)
                .await
                .map(|_| ())
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("[Broker] Wait on request {} cancelled", request_id);
                self.close_pending(request_id, CollaborationOutcome::Cancelled)
            }
            waited = tokio::time::timeout(timeout, resolved) => match waited {
                Ok(Ok(())) => {
                    let inner = self.lock()?;
                    inner
                        .requests
                        .get(request_id)
                        .map(|e| outcome_of(&e.request))
                        .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))
                }
                Ok(Err(_)) => Err(EngineError::UnknownRequest(request_id.to_string())),
                Err(_) => {
                    tracing::warn!(
                        "[Broker] Request {} timed out after {}ms",
                        request_id,
                        timeout.as_millis()
                    );
                    self.close_pending(request_id, CollaborationOutcome::TimedOut)
                }
            }
        }
    }

    /// Mark a still-pending request `timeout`. A response that raced the
    /// deadline wins.
    fn close_pending(
        &self,
        request_id: &str,
        outcome: CollaborationOutcome,
    ) -> Result<CollaborationOutcome> {
        let mut inner = self.lock()?;
        let entry = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;
        if !entry.request.is_pending() {
            return Ok(outcome_of(&entry.request));
        }
        entry.request.status = CollaborationStatus::Timeout;
        entry.request.resolved_at = Some(Utc::now());
        entry.status_tx.send_replace(CollaborationStatus::Timeout);
        Ok(outcome)
    }

    pub fn get(&self, request_id: &str) -> Result<CollaborationRequest> {
        self.lock()?
            .requests
            .get(request_id)
            .map(|e| e.request.clone())
            .ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))
    }

    /// Pending requests addressed to `target`, oldest first.
    pub fn pending_for(&self, target: &str) -> Result<Vec<CollaborationRequest>> {
        let inner = self.lock()?;
        let mut pending: Vec<CollaborationRequest> = inner
            .requests
            .values()
            .filter(|e| e.request.target == target && e.request.is_pending())
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    /// Expire pending requests past their deadline, then drop resolved
    /// requests older than `retention`. Returns how many were removed.
    pub fn purge_expired(&self, retention: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(retention)
                .map_err(|e| EngineError::Config(format!("Invalid retention: {}", e)))?;
        let mut inner = self.lock()?;

        let mut expired = 0;
        for entry in inner.requests.values_mut() {
            if entry.request.is_overdue(now) {
                entry.request.status = CollaborationStatus::Timeout;
                entry.request.resolved_at = Some(now);
                entry.status_tx.send_replace(CollaborationStatus::Timeout);
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!("[Broker] {} unanswered request(s) passed their deadline", expired);
        }

        let before = inner.requests.len();
        inner.requests.retain(|_, e| {
            e.request.is_pending() || e.request.resolved_at.is_some_and(|at| at > cutoff)
        });
        let purged = before - inner.requests.len();
        if purged > 0 {
            tracing::debug!("[Broker] Purged {} resolved request(s)", purged);
        }
        Ok(purged)
    }
}

fn outcome_of(request: &CollaborationRequest) -> CollaborationOutcome {
    match (request.status, &request.response) {
        (CollaborationStatus::Completed, Some(payload)) => {
            CollaborationOutcome::Responded(payload.clone())
        }
        (CollaborationStatus::Completed, None) => {
            CollaborationOutcome::Responded(serde_json::Value::Null)
        }
        _ => CollaborationOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_through_inbox() {
        let broker = CollaborationBroker::new();
        let mut inbox = broker.register_inbox("W2").unwrap();

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let request = inbox.recv().await.unwrap();
                assert_eq!(request.requester, "W1");
                assert_eq!(request.description, "need wind data");
                broker.respond(&request.id, json!({"x": 1})).unwrap();
            })
        };

        let request_id = broker
            .submit("W1", "W2", "need wind data", HashMap::new(), Duration::from_secs(60))
            .unwrap();
        let outcome = broker
            .await_response(&request_id, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(outcome, CollaborationOutcome::Responded(json!({"x": 1})));
        let record = broker.get(&request_id).unwrap();
        assert_eq!(record.status, CollaborationStatus::Completed);
        assert!(record.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_timeout_marks_request_and_rejects_late_response() {
        let broker = CollaborationBroker::new();
        let request_id = broker
            .submit("W1", "W2", "anyone there?", HashMap::new(), Duration::from_secs(60))
            .unwrap();

        let outcome = broker
            .await_response(&request_id, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CollaborationOutcome::TimedOut);
        assert_eq!(broker.get(&request_id).unwrap().status, CollaborationStatus::Timeout);

        let late = broker.respond(&request_id, json!("too late"));
        assert!(matches!(late, Err(EngineError::UnknownRequest(_))));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let broker = CollaborationBroker::new();
        let request_id = broker.submit("W1", "W2", "hold on", HashMap::new(), Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = broker
            .await_response(&request_id, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, CollaborationOutcome::Cancelled);
        assert!(!broker.get(&request_id).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_already_answered_returns_immediately() {
        let broker = CollaborationBroker::new();
        let request_id = broker.submit("W1", "W2", "q", HashMap::new(), Duration::from_secs(60)).unwrap();
        broker.respond(&request_id, json!(42)).unwrap();

        let outcome = broker
            .await_response(&request_id, Duration::from_millis(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response(), Some(&json!(42)));
    }

    #[test]
    fn test_unknown_request() {
        let broker = CollaborationBroker::new();
        assert!(matches!(
            broker.respond("nope", json!(null)),
            Err(EngineError::UnknownRequest(_))
        ));
        assert!(broker.get("nope").is_err());
    }

    #[test]
    fn test_unawaited_requests_expire_at_deadline() {
        let broker = CollaborationBroker::new();
        for i in 0..100 {
            broker
                .submit("W1", "W2", &format!("fire and forget {}", i), HashMap::new(), Duration::ZERO)
                .unwrap();
        }
        let kept = broker
            .submit("W1", "W2", "still open", HashMap::new(), Duration::from_secs(600))
            .unwrap();

        assert_eq!(broker.purge_expired(Duration::ZERO).unwrap(), 100);
        let pending = broker.pending_for("W2").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, kept);
    }

    #[test]
    fn test_overdue_request_is_timeout_before_retention() {
        let broker = CollaborationBroker::new();
        let id = broker
            .submit("W1", "W2", "q", HashMap::new(), Duration::ZERO)
            .unwrap();

        assert_eq!(broker.purge_expired(Duration::from_secs(600)).unwrap(), 0);
        assert_eq!(broker.get(&id).unwrap().status, CollaborationStatus::Timeout);
        assert!(matches!(
            broker.respond(&id, json!("late")),
            Err(EngineError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_pending_for_and_purge() {
        let broker = CollaborationBroker::new();
        let a = broker.submit("W1", "W2", "a", HashMap::new(), Duration::from_secs(60)).unwrap();
        broker.submit("W1", "W3", "b", HashMap::new(), Duration::from_secs(60)).unwrap();

        let pending = broker.pending_for("W2").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);

        broker.respond(&a, json!("ok")).unwrap();
        assert!(broker.pending_for("W2").unwrap().is_empty());

        // Pending requests survive, resolved ones go once retention is zero.
        assert_eq!(broker.purge_expired(Duration::from_secs(600)).unwrap(), 0);
        assert_eq!(broker.purge_expired(Duration::ZERO).unwrap(), 1);
        assert!(broker.get(&a).is_err());
        assert_eq!(broker.pending_for("W3").unwrap().len(), 1);
    }
}
