// ABOUTME: Integration tests for convoke-correlator.
// ABOUTME: Timeouts, exactly-once fulfilment, late replies and eviction failures.

use std::sync::Arc;
use std::time::Duration;

use convoke_correlator::{CorrelationError, Correlator, ResponseDisposition};
use convoke_proto::{Envelope, ErrorKind, ErrorPayload, MessageType};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn task(id: &str) -> Envelope {
    Envelope::new(MessageType::TaskSubmit)
        .with_task_id(id)
        .for_type("literature")
        .with_action("review_literature")
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_after_deadline_and_cleans_up() {
    let correlator = Correlator::new();
    let (tx, _rx) = mpsc::channel::<Envelope>(4);

    let started = Instant::now();
    let result = correlator
        .send_and_wait(&tx, task("t-timeout"), Duration::from_millis(200))
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(CorrelationError::Timeout {
            correlation_id,
            timeout,
        }) => {
            assert_eq!(correlation_id, "t-timeout");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
    assert!(!correlator.is_pending("t-timeout"));
    assert_eq!(correlator.pending_count(), 0);
    assert_eq!(correlator.stats().timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_dropped() {
    let correlator = Correlator::new();
    let (tx, _rx) = mpsc::channel::<Envelope>(4);

    let request = task("t-late");
    let result = correlator
        .send_and_wait(&tx, request.clone(), Duration::from_millis(50))
        .await;
    assert!(result.unwrap_err().is_timeout());

    let late = request.reply_ok("lit-1", json!({"papers": []}));
    assert_eq!(correlator.on_response(late), ResponseDisposition::Dropped);

    let stats = correlator.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.fulfilled, 0);
    assert_eq!(stats.pending, 0);
}

// ============================================================================
// Fulfilment
// ============================================================================

#[tokio::test]
async fn test_reply_fulfills_exactly_one_waiter() {
    let correlator = Arc::new(Correlator::new());
    let (tx, mut rx) = mpsc::channel::<Envelope>(4);

    let c = correlator.clone();
    let waiter = tokio::spawn(async move {
        c.send_and_wait(&tx, task("t-ok"), Duration::from_secs(5))
            .await
    });

    let sent = rx.recv().await.expect("request should be sent");
    assert!(correlator.is_pending("t-ok"));

    let reply = sent.reply_ok("lit-1", json!({"papers": ["a", "b"]}));
    assert_eq!(
        correlator.on_response(reply.clone()),
        ResponseDisposition::Fulfilled
    );
    assert_eq!(correlator.on_response(reply), ResponseDisposition::Dropped);

    let got = waiter.await.unwrap().expect("waiter should get the reply");
    assert_eq!(got.kind, MessageType::TaskResult);
    assert_eq!(got.payload["papers"][1], "b");

    let stats = correlator.stats();
    assert_eq!(stats.fulfilled, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_error_reply_is_typed() {
    let correlator = Arc::new(Correlator::new());
    let (tx, mut rx) = mpsc::channel::<Envelope>(4);

    let c = correlator.clone();
    let waiter = tokio::spawn(async move {
        c.send_and_wait(&tx, task("t-err"), Duration::from_secs(5))
            .await
    });

    let sent = rx.recv().await.unwrap();
    correlator.on_response(sent.reply_error(
        "lit-1",
        ErrorPayload::new(ErrorKind::HandlerError, "index offline"),
    ));

    match waiter.await.unwrap() {
        Err(CorrelationError::Remote { kind, message }) => {
            assert_eq!(kind, ErrorKind::HandlerError);
            assert_eq!(message, "index offline");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_pending_id_rejected() {
    let correlator = Arc::new(Correlator::new());
    let (tx, mut rx) = mpsc::channel::<Envelope>(4);

    let c = correlator.clone();
    let tx_first = tx.clone();
    let first = tokio::spawn(async move {
        c.send_and_wait(&tx_first, task("t-dup"), Duration::from_secs(5))
            .await
    });
    let sent = rx.recv().await.unwrap();

    let second = correlator
        .send_and_wait(&tx, task("t-dup"), Duration::from_secs(5))
        .await;
    assert_eq!(
        second.unwrap_err(),
        CorrelationError::DuplicateCorrelationId("t-dup".to_string())
    );

    // The original waiter is untouched by the rejected duplicate.
    correlator.on_response(sent.reply_ok("lit-1", json!("done")));
    assert!(first.await.unwrap().is_ok());
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn test_fail_target_only_hits_that_agent() {
    let correlator = Arc::new(Correlator::new());
    let (tx, mut rx) = mpsc::channel::<Envelope>(8);

    let mut waiters = Vec::new();
    for (id, target) in [("t1", "lit-1"), ("t2", "lit-1"), ("t3", "lit-2")] {
        let c = correlator.clone();
        let tx = tx.clone();
        waiters.push(tokio::spawn(async move {
            c.send_and_wait_to(Some(target.to_string()), &tx, task(id), Duration::from_secs(5))
                .await
        }));
        rx.recv().await.unwrap();
    }

    assert_eq!(correlator.fail_target("lit-1"), 2);
    assert_eq!(correlator.pending_count(), 1);

    let t3 = waiters.pop().unwrap();
    for waiter in waiters {
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            CorrelationError::AgentUnavailable {
                agent_id: "lit-1".to_string()
            }
        );
    }

    correlator.on_response(task("t3").reply_ok("lit-2", json!({})));
    assert!(t3.await.unwrap().is_ok());
    assert_eq!(correlator.stats().failed, 2);
}

#[tokio::test]
async fn test_abandoned_wait_removes_entry() {
    let correlator = Arc::new(Correlator::new());
    let (tx, mut rx) = mpsc::channel::<Envelope>(4);

    let c = correlator.clone();
    let waiter = tokio::spawn(async move {
        c.send_and_wait(&tx, task("t-abort"), Duration::from_secs(60))
            .await
    });
    rx.recv().await.unwrap();
    assert!(correlator.is_pending("t-abort"));

    waiter.abort();
    let _ = waiter.await;

    assert!(!correlator.is_pending("t-abort"));
}
