use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use herald_contracts::{
    ConversationId, MessageRef, PendingRequest, RequestId, RequestPayload, Resolution,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Authorization;
use crate::error::BridgeError;

/// Message ids remembered after their request is gone, so late replies read as stale.
const MESSAGE_INDEX_CAP: usize = 1024;

struct Entry {
    snapshot: PendingRequest,
    seq: u64,
    deadline: Option<Instant>,
    tx: Option<oneshot::Sender<Resolution>>,
    rx: Option<oneshot::Receiver<Resolution>>,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn is_pending(&self) -> bool {
        self.snapshot.resolution.is_none()
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RequestId, Entry>,
    messages: HashMap<MessageRef, RequestId>,
    message_order: VecDeque<MessageRef>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    /// Single write of the resolution slot. Past the deadline every outcome
    /// other than the timer's own becomes `TimedOut` and is refused.
    fn resolve(&mut self, id: &RequestId, outcome: Resolution) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.is_pending() {
            return false;
        }
        let expired = entry.deadline.is_some_and(|d| Instant::now() >= d);
        let (outcome, accepted) = if expired && outcome != Resolution::TimedOut {
            (Resolution::TimedOut, false)
        } else {
            (outcome, true)
        };

        entry.snapshot.resolution = Some(outcome.clone());
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(outcome);
        }
        accepted
    }

    fn remember_message(&mut self, message: MessageRef, id: RequestId) {
        if self.messages.insert(message, id).is_none() {
            self.message_order.push_back(message);
        }
        while self.message_order.len() > MESSAGE_INDEX_CAP {
            if let Some(oldest) = self.message_order.pop_front() {
                self.messages.remove(&oldest);
            }
        }
    }
}

/// Outstanding approval and question requests, each resolved at most once.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
    auth: Authorization,
}

impl Registry {
    pub fn new(auth: Authorization) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            auth,
        }
    }

    /// Registers a request. `timeout = None` waits indefinitely.
    pub fn create(
        &self,
        payload: RequestPayload,
        conversation: ConversationId,
        timeout: Option<Duration>,
    ) -> Result<RequestId, BridgeError> {
        if !self.auth.allows(conversation) {
            return Err(BridgeError::Unauthorized(conversation));
        }

        let id = RequestId(Uuid::new_v4().to_string());
        let created = Utc::now();
        // A timeout past the representable range means no deadline at all.
        let timeout = timeout.filter(|t| Instant::now().checked_add(*t).is_some());
        let wall_deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| created.checked_add_signed(t))
            .map(|d| d.to_rfc3339());
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BridgeError::ShuttingDown);
            }
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let snapshot = PendingRequest {
                id: id.clone(),
                kind: payload.kind(),
                payload,
                conversation,
                created_at: created.to_rfc3339(),
                deadline: wall_deadline,
                message: None,
                resolution: None,
            };
            inner.entries.insert(
                id.clone(),
                Entry {
                    snapshot,
                    seq,
                    deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
                    tx: Some(tx),
                    rx: Some(rx),
                    timer: None,
                },
            );
        }

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(weak, timer_id);
            });
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&id) {
                Some(entry) if entry.is_pending() => entry.timer = Some(handle.abort_handle()),
                _ => handle.abort(),
            }
        }

        debug!(request_id = %id, %conversation, ?timeout, "request created");
        Ok(id)
    }

    /// Suspends until the request is resolved, then removes it.
    ///
    /// Dropping the returned future cancels a still-pending request.
    pub async fn await_resolution(&self, id: &RequestId) -> Result<Resolution, BridgeError> {
        let rx = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(id)
                .ok_or_else(|| BridgeError::UnknownRequest(id.clone()))?;
            entry.rx.take().ok_or_else(|| {
                BridgeError::InvalidInput(format!("request {id} already has a waiter"))
            })?
        };
        let _delivery = Delivery {
            inner: &self.inner,
            id,
        };
        Ok(rx.await.unwrap_or(Resolution::Cancelled))
    }

    /// Cancels and removes `id` when dropped, unless it was already delivered.
    /// Covers the window between `create` and `await_resolution`.
    pub fn guard(&self, id: RequestId) -> RequestGuard {
        RequestGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Returns true only for the call that performed the transition.
    pub fn resolve(&self, id: &RequestId, outcome: Resolution) -> bool {
        let mut inner = self.inner.lock();
        let accepted = inner.resolve(id, outcome);
        if !accepted {
            let late = inner
                .entries
                .get(id)
                .and_then(|e| e.snapshot.resolution.as_ref())
                .is_some_and(|r| *r == Resolution::TimedOut);
            if late {
                debug!(request_id = %id, "resolution refused, request timed out");
            }
        }
        accepted
    }

    pub fn get(&self, id: &RequestId) -> Option<PendingRequest> {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|e| e.snapshot.clone())
    }

    /// Unresolved requests, oldest first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().filter(|e| e.is_pending()).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }

    pub fn latest_pending_for(&self, conversation: ConversationId) -> Option<PendingRequest> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|e| e.is_pending() && e.snapshot.conversation == conversation)
            .max_by_key(|e| e.seq)
            .map(|e| e.snapshot.clone())
    }

    /// Request whose prompt was carried by `message`, live or already delivered.
    pub fn find_by_message(&self, message: MessageRef) -> Option<RequestId> {
        self.inner.lock().messages.get(&message).cloned()
    }

    pub fn attach_message(&self, id: &RequestId, message: MessageRef) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        entry.snapshot.message = Some(message);
        inner.remember_message(message, id.clone());
        true
    }

    /// Refuses new requests and cancels every pending one.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let ids: Vec<RequestId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_pending())
            .map(|(id, _)| id.clone())
            .collect();
        let cancelled = ids
            .iter()
            .filter(|id| inner.resolve(id, Resolution::Cancelled))
            .count();
        if cancelled > 0 {
            info!(cancelled, "pending requests cancelled");
        }
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

fn expire(inner: Weak<Mutex<Inner>>, id: RequestId) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.lock().resolve(&id, Resolution::TimedOut) {
        info!(request_id = %id, "request timed out");
    }
}

fn discard(inner: &Mutex<Inner>, id: &RequestId) {
    let mut inner = inner.lock();
    if inner.resolve(id, Resolution::Cancelled) {
        debug!(request_id = %id, "waiter dropped, request cancelled");
    }
    if let Some(entry) = inner.entries.remove(id) {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
    }
}

struct Delivery<'a> {
    inner: &'a Mutex<Inner>,
    id: &'a RequestId,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        discard(self.inner, self.id);
    }
}

#[must_use = "dropping the guard cancels the request"]
pub struct RequestGuard {
    inner: Arc<Mutex<Inner>>,
    id: RequestId,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        discard(&self.inner, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(summary: &str) -> RequestPayload {
        RequestPayload::PlanApproval {
            summary: summary.to_string(),
            files_affected: vec![],
            task_name: None,
        }
    }

    fn registry() -> Registry {
        Registry::new(Authorization::new([1, 2]))
    }

    #[tokio::test]
    async fn resolves_once_and_removes_after_delivery() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), None)
            .expect("create");
        assert!(registry.resolve(&id, Resolution::Approved));
        assert!(!registry.resolve(&id, Resolution::Rejected { reason: None }));

        let outcome = registry.await_resolution(&id).await.expect("await");
        assert_eq!(outcome, Resolution::Approved);
        assert!(registry.get(&id).is_none());
        assert!(!registry.resolve(&id, Resolution::Approved));
    }

    #[tokio::test]
    async fn rejects_unauthorized_conversation() {
        let err = registry()
            .create(plan("a"), ConversationId(99), None)
            .expect_err("unauthorized");
        assert!(matches!(err, BridgeError::Unauthorized(ConversationId(99))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_timer_resolves_timed_out() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), Some(Duration::from_secs(5)))
            .expect("create");
        let outcome = registry.await_resolution(&id).await.expect("await");
        assert_eq!(outcome, Resolution::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn late_resolution_is_refused_even_before_timer_runs() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), Some(Duration::from_secs(5)))
            .expect("create");
        // Simulate a starved timer task.
        if let Some(timer) = registry
            .inner
            .lock()
            .entries
            .get_mut(&id)
            .and_then(|e| e.timer.take())
        {
            timer.abort();
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!registry.resolve(&id, Resolution::Approved));
        assert_eq!(
            registry.get(&id).and_then(|r| r.resolution),
            Some(Resolution::TimedOut)
        );
        let outcome = registry.await_resolution(&id).await.expect("await");
        assert_eq!(outcome, Resolution::TimedOut);
    }

    #[tokio::test]
    async fn close_cancels_pending_and_refuses_new_requests() {
        let registry = registry();
        let first = registry
            .create(plan("a"), ConversationId(1), None)
            .expect("create");
        let second = registry
            .create(plan("b"), ConversationId(2), None)
            .expect("create");
        assert!(registry.resolve(&second, Resolution::Approved));

        assert_eq!(registry.close(), 1);
        assert!(registry.is_closed());
        assert_eq!(
            registry.await_resolution(&first).await.expect("await"),
            Resolution::Cancelled
        );
        assert!(matches!(
            registry.create(plan("c"), ConversationId(1), None),
            Err(BridgeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn dropped_waiter_cancels_request() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), None)
            .expect("create");
        let waiter = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.await_resolution(&id).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        assert!(registry.get(&id).is_none());
        assert!(!registry.resolve(&id, Resolution::Approved));
    }

    #[tokio::test]
    async fn guard_removes_request_that_never_got_a_waiter() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), Some(Duration::from_secs(60)))
            .expect("create");
        drop(registry.guard(id.clone()));

        assert!(registry.get(&id).is_none());
        assert!(registry.pending().is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_timeout_means_no_deadline() {
        let registry = registry();
        let id = registry
            .create(plan("a"), ConversationId(1), Some(Duration::from_secs(u64::MAX)))
            .expect("create");
        let request = registry.get(&id).expect("pending");
        assert!(request.deadline.is_none());
        assert!(registry.resolve(&id, Resolution::Approved));
        assert_eq!(
            registry.await_resolution(&id).await.expect("await"),
            Resolution::Approved
        );
    }

    #[tokio::test]
    async fn lookups_by_conversation_and_message() {
        let registry = registry();
        let older = registry
            .create(plan("older"), ConversationId(1), None)
            .expect("create");
        let newer = registry
            .create(plan("newer"), ConversationId(1), None)
            .expect("create");
        let other = registry
            .create(plan("other"), ConversationId(2), None)
            .expect("create");

        let latest = registry
            .latest_pending_for(ConversationId(1))
            .expect("latest");
        assert_eq!(latest.id, newer);
        assert_eq!(registry.pending().len(), 3);
        assert_eq!(registry.pending()[0].id, older);

        let message = MessageRef {
            conversation: ConversationId(2),
            message_id: 77,
        };
        assert!(registry.attach_message(&other, message));
        assert_eq!(registry.find_by_message(message), Some(other.clone()));
        assert_eq!(
            registry.get(&other).and_then(|r| r.message),
            Some(message)
        );

        assert!(registry.resolve(&newer, Resolution::Approved));
        assert_eq!(
            registry
                .latest_pending_for(ConversationId(1))
                .map(|r| r.id),
            Some(older)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolvers_have_exactly_one_winner() {
        let registry = registry();
        let id = registry
            .create(plan("race"), ConversationId(1), None)
            .expect("create");

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let outcome = if i % 2 == 0 {
                    Resolution::Approved
                } else {
                    Resolution::Rejected { reason: None }
                };
                registry.resolve(&id, outcome)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
