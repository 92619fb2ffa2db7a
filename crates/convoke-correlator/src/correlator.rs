// ABOUTME: Pending-request table matching replies to requests by correlation id.
// ABOUTME: Each entry is removed exactly once: by its reply, its deadline, an explicit failure, or the caller leaving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use convoke_proto::{Envelope, ErrorKind, MessageType};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CorrelationError;
use crate::sink::EnvelopeSink;

type Waiter = oneshot::Sender<Result<Envelope, CorrelationError>>;

/// A request waiting for its correlated reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub created_at: Instant,
    pub deadline: Instant,
    /// Agent the request was delivered to, when known.
    pub target: Option<String>,
    seq: u64,
    waiter: Waiter,
}

/// What happened to a reply handed to [`Correlator::on_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// A waiter was found and fulfilled.
    Fulfilled,
    /// No waiter (late or duplicate reply); dropped and counted.
    Dropped,
    /// Sent by an agent that does not hold the request. Dropped and counted;
    /// the request keeps waiting for its real reply.
    Rejected,
}

/// Counters describing correlator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub pending: usize,
    pub fulfilled: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Matches asynchronous replies to the requests that caused them.
///
/// The table sits behind one mutex that is never held across an await, so a
/// correlator can be shared between the tasks that send and the task that
/// reads replies.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_seq: AtomicU64,
    fulfilled: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Removes the caller's entry if the caller stops waiting early.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: String,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.correlator.remove_own(&self.id, self.seq).is_some() {
            debug!(correlation_id = %self.id, "Pending request abandoned by caller");
        }
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove `id` only if it is still the entry registered with `seq`.
    fn remove_own(&self, id: &str, seq: u64) -> Option<PendingRequest> {
        let mut table = self.table();
        match table.get(id) {
            Some(entry) if entry.seq == seq => table.remove(id),
            _ => None,
        }
    }

    /// Send `envelope` and wait for its correlated reply.
    pub async fn send_and_wait<S>(
        &self,
        sink: &S,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CorrelationError>
    where
        S: EnvelopeSink + ?Sized,
    {
        self.send_and_wait_to(None, sink, envelope, timeout).await
    }

    /// Like [`send_and_wait`](Self::send_and_wait), recording the agent the
    /// request is addressed to so [`fail_target`](Self::fail_target) can reach it.
    pub async fn send_and_wait_to<S>(
        &self,
        target: Option<String>,
        sink: &S,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CorrelationError>
    where
        S: EnvelopeSink + ?Sized,
    {
        let id = envelope
            .correlation_id()
            .map(str::to_string)
            .ok_or(CorrelationError::MissingCorrelationId)?;

        let (tx, mut rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        {
            let mut table = self.table();
            if table.contains_key(&id) {
                return Err(CorrelationError::DuplicateCorrelationId(id));
            }
            table.insert(
                id.clone(),
                PendingRequest {
                    correlation_id: id.clone(),
                    created_at: now,
                    deadline: now + timeout,
                    target,
                    seq,
                    waiter: tx,
                },
            );
        }
        let guard = PendingGuard {
            correlator: self,
            id: id.clone(),
            seq,
        };

        // Registered before sending so a fast reply cannot miss its waiter.
        if let Err(e) = sink.send_envelope(envelope).await {
            return Err(CorrelationError::SendFailed(e.to_string()));
        }

        match tokio::time::timeout_at(now + timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelationError::Abandoned),
            Err(_) => {
                if self.remove_own(&id, seq).is_some() {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    drop(guard);
                    debug!(correlation_id = %id, timeout = ?timeout, "Request timed out");
                    Err(CorrelationError::Timeout {
                        correlation_id: id,
                        timeout,
                    })
                } else {
                    // Fulfilled between the deadline firing and the removal.
                    rx.try_recv().unwrap_or(Err(CorrelationError::Abandoned))
                }
            }
        }
    }

    /// Deliver a reply. Fulfills the matching waiter once; anything else is dropped.
    pub fn on_response(&self, envelope: Envelope) -> ResponseDisposition {
        self.resolve(envelope, None, |_| true)
    }

    /// Deliver a reply read from `responder`'s connection.
    ///
    /// A request recorded with a target only accepts replies from that agent;
    /// `None` stands for a connection that never registered.
    pub fn on_response_from(
        &self,
        responder: Option<&str>,
        envelope: Envelope,
    ) -> ResponseDisposition {
        self.resolve(envelope, responder, |pending| match &pending.target {
            Some(target) => Some(target.as_str()) == responder,
            None => true,
        })
    }

    fn resolve(
        &self,
        envelope: Envelope,
        responder: Option<&str>,
        accept: impl FnOnce(&PendingRequest) -> bool,
    ) -> ResponseDisposition {
        let Some(id) = envelope.correlation_id().map(str::to_string) else {
            warn!(kind = %envelope.kind, "Reply without correlation id dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return ResponseDisposition::Dropped;
        };

        let (accepted, entry) = {
            let mut table = self.table();
            match table.get(&id).map(accept) {
                Some(true) => (true, table.remove(&id)),
                Some(false) => (false, None),
                None => (true, None),
            }
        };
        if !accepted {
            warn!(
                correlation_id = %id,
                responder = ?responder,
                "Reply from an agent that does not hold the request dropped"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return ResponseDisposition::Rejected;
        }
        let Some(entry) = entry else {
            debug!(correlation_id = %id, kind = %envelope.kind, "Late or duplicate reply dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return ResponseDisposition::Dropped;
        };

        let result = if envelope.kind == MessageType::Error {
            let (kind, message) = envelope
                .error_payload()
                .map(|p| (p.kind, p.message))
                .unwrap_or((ErrorKind::HandlerError, "unspecified error".to_string()));
            Err(CorrelationError::Remote { kind, message })
        } else {
            Ok(envelope)
        };

        if entry.waiter.send(result).is_err() {
            debug!(correlation_id = %id, "Waiter gone before reply could be delivered");
        }
        self.fulfilled.fetch_add(1, Ordering::Relaxed);
        ResponseDisposition::Fulfilled
    }

    /// Fail one pending request. Returns false if it was not pending.
    pub fn fail(&self, id: &str, error: CorrelationError) -> bool {
        let Some(entry) = self.table().remove(id) else {
            return false;
        };
        let _ = entry.waiter.send(Err(error));
        self.failed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Fail every pending request addressed to `agent_id` with `AgentUnavailable`.
    pub fn fail_target(&self, agent_id: &str) -> usize {
        let entries: Vec<PendingRequest> = {
            let mut table = self.table();
            let ids: Vec<String> = table
                .values()
                .filter(|p| p.target.as_deref() == Some(agent_id))
                .map(|p| p.correlation_id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };

        let count = entries.len();
        for entry in entries {
            let _ = entry.waiter.send(Err(CorrelationError::AgentUnavailable {
                agent_id: agent_id.to_string(),
            }));
        }
        self.failed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    /// Agent a pending request was delivered to.
    pub fn target_of(&self, id: &str) -> Option<String> {
        self.table().get(id).and_then(|p| p.target.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            pending: self.pending_count(),
            fulfilled: self.fulfilled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn task(id: &str) -> Envelope {
        Envelope::new(MessageType::TaskSubmit)
            .with_task_id(id)
            .for_type("planner")
            .with_action("plan")
    }

    #[tokio::test]
    async fn test_missing_correlation_id() {
        let correlator = Correlator::new();
        let (tx, _rx) = mpsc::channel::<Envelope>(1);
        let env = Envelope::new(MessageType::TaskSubmit).for_type("planner");
        let result = correlator
            .send_and_wait(&tx, env, Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap_err(), CorrelationError::MissingCorrelationId);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_removes_entry() {
        let correlator = Correlator::new();
        let (tx, rx) = mpsc::channel::<Envelope>(1);
        drop(rx);
        let result = correlator
            .send_and_wait(&tx, task("t1"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CorrelationError::SendFailed(_))));
        assert!(!correlator.is_pending("t1"));
    }

    #[tokio::test]
    async fn test_on_response_unknown_is_dropped() {
        let correlator = Correlator::new();
        let reply = task("nobody").reply_ok("a1", json!({}));
        assert_eq!(correlator.on_response(reply), ResponseDisposition::Dropped);
        assert_eq!(correlator.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_fail_single() {
        let correlator = Arc::new(Correlator::new());
        let (tx, mut rx) = mpsc::channel::<Envelope>(1);

        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.send_and_wait(&tx, task("t1"), Duration::from_secs(5)).await
        });
        rx.recv().await.unwrap();

        assert!(correlator.fail(
            "t1",
            CorrelationError::Remote {
                kind: ErrorKind::Cancelled,
                message: "stop".into()
            }
        ));
        assert!(!correlator.fail("t1", CorrelationError::Abandoned));

        let result = waiter.await.unwrap();
        assert!(matches!(
            result,
            Err(CorrelationError::Remote {
                kind: ErrorKind::Cancelled,
                ..
            })
        ));
        assert_eq!(correlator.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_target_of() {
        let correlator = Arc::new(Correlator::new());
        let (tx, mut rx) = mpsc::channel::<Envelope>(1);

        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.send_and_wait_to(
                Some("agent-9".into()),
                &tx,
                task("t1"),
                Duration::from_secs(5),
            )
            .await
        });
        rx.recv().await.unwrap();
        assert_eq!(correlator.target_of("t1").as_deref(), Some("agent-9"));

        correlator.on_response(task("t1").reply_ok("agent-9", json!(1)));
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(correlator.target_of("t1"), None);
    }

    #[tokio::test]
    async fn test_reply_only_accepted_from_target() {
        let correlator = Arc::new(Correlator::new());
        let (tx, mut rx) = mpsc::channel::<Envelope>(1);

        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.send_and_wait_to(
                Some("agent-9".into()),
                &tx,
                task("t1"),
                Duration::from_secs(5),
            )
            .await
        });
        rx.recv().await.unwrap();

        let forged = task("t1").reply_ok("agent-4", json!({"forged": true}));
        assert_eq!(
            correlator.on_response_from(Some("agent-4"), forged.clone()),
            ResponseDisposition::Rejected
        );
        assert_eq!(
            correlator.on_response_from(None, forged),
            ResponseDisposition::Rejected
        );
        assert!(correlator.is_pending("t1"));

        let real = task("t1").reply_ok("agent-9", json!({"real": true}));
        assert_eq!(
            correlator.on_response_from(Some("agent-9"), real),
            ResponseDisposition::Fulfilled
        );
        assert_eq!(waiter.await.unwrap().unwrap().payload, json!({"real": true}));

        let stats = correlator.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.fulfilled, 1);
    }

    #[tokio::test]
    async fn test_untargeted_request_accepts_any_responder() {
        let correlator = Arc::new(Correlator::new());
        let (tx, mut rx) = mpsc::channel::<Envelope>(1);

        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.send_and_wait(&tx, task("t2"), Duration::from_secs(5)).await
        });
        rx.recv().await.unwrap();

        let reply = task("t2").reply_ok("anyone", json!(2));
        assert_eq!(
            correlator.on_response_from(Some("anyone"), reply),
            ResponseDisposition::Fulfilled
        );
        assert!(waiter.await.unwrap().is_ok());
    }
}
