#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests of the session, correlator and hub against a fake relay.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use common::{FakeRelay, Harness, Reply, test_config};
use shroud_client::{SessionState, TunnelError};
use shroud_core::PendingPolicy;
use shroud_crypto::{EnvelopeCipher, encoding};
use shroud_proto::{ControlMessage, DataFrame, HeaderList, ProxyRequest};

const DEADLINE: Duration = Duration::from_secs(15);

fn get(url: &str) -> ProxyRequest {
    ProxyRequest::new("GET", url)
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn handshake_reaches_ready_with_one_key() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;

    assert_eq!(harness.session.state(), SessionState::Ready);
    assert_eq!(harness.session.epoch(), 1);
    assert_eq!(relay.session_keys().len(), 1);
    assert_eq!(relay.connection_count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn every_reconnect_negotiates_a_fresh_key() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;

    relay.drop_connection();
    harness.wait_for_epoch(2).await;
    relay.drop_connection();
    harness.wait_for_epoch(3).await;

    let keys = relay.session_keys();
    assert_eq!(keys.len(), 3);
    assert_ne!(keys[0], keys[1]);
    assert_ne!(keys[1], keys[2]);
    assert_ne!(keys[0], keys[2]);

    harness.stop().await;
}

#[tokio::test]
async fn refused_connections_are_retried() {
    let relay = FakeRelay::new();
    relay.refuse_connections(true);
    let harness = Harness::start(&relay, test_config(PendingPolicy::Fail), DEADLINE);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ne!(harness.session.state(), SessionState::Ready);

    relay.refuse_connections(false);
    harness.wait_for(SessionState::Ready).await;
    assert_eq!(relay.session_keys().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let session = Arc::clone(&harness.session);

    harness.stop().await;
    assert_eq!(session.state(), SessionState::Closed);
}

// =============================================================================
// Request / response
// =============================================================================

#[tokio::test]
async fn round_trip_carries_status_headers_and_body() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|req: &ProxyRequest| {
        let headers: HeaderList = [("x-upstream", "yes"), ("content-type", "text/plain")]
            .into_iter()
            .collect();
        Reply::ok(format!("hello from {}", req.url))
            .with_status(201)
            .with_headers(headers)
    }));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let request = ProxyRequest::new("POST", "https://app.example/apx/items")
        .with_header("content-type", "application/json")
        .with_body(br#"{"n":1}"#.to_vec());
    let response = harness.hub.submit(&context, request.clone()).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "hello from https://app.example/apx/items");
    let names: Vec<&str> = response.headers.iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["x-upstream", "content-type"]);

    // The relay saw exactly what was submitted.
    assert_eq!(relay.requests(), vec![request]);
    assert!(harness.correlator.is_empty().await);

    harness.stop().await;
}

#[tokio::test]
async fn missing_status_defaults_to_200() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let response = harness.hub.submit(&context, get("/apx/plain")).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.headers.is_empty());
    assert_eq!(response.text(), "/apx/plain");

    harness.stop().await;
}

#[tokio::test]
async fn out_of_order_responses_reach_their_requests() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|req: &ProxyRequest| {
        let delay = match req.url.as_str() {
            "/apx/slow" => 300,
            "/apx/medium" => 150,
            _ => 10,
        };
        Reply::ok(req.url.clone()).after(Duration::from_millis(delay))
    }));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let (slow, medium, fast) = tokio::join!(
        harness.hub.submit(&context, get("/apx/slow")),
        harness.hub.submit(&context, get("/apx/medium")),
        harness.hub.submit(&context, get("/apx/fast")),
    );
    assert_eq!(slow.unwrap().text(), "/apx/slow");
    assert_eq!(medium.unwrap().text(), "/apx/medium");
    assert_eq!(fast.unwrap().text(), "/apx/fast");

    let ids = relay.request_ids();
    assert_eq!(ids.len(), 3);
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 3);

    harness.stop().await;
}

/// Two contexts submit at once; the one whose URL ends in `slow_suffix`
/// is answered last. Each must only ever see its own response.
async fn check_context_isolation(slow_suffix: &'static str) {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(move |req: &ProxyRequest| {
        let delay = if req.url.ends_with(slow_suffix) { 120 } else { 20 };
        Reply::ok(req.url.clone()).after(Duration::from_millis(delay))
    }));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let first = harness.hub.announce().await;
    let second = harness.hub.announce().await;
    assert_eq!(harness.hub.context_count().await, 2);

    let (a, b) = tokio::join!(
        harness.hub.submit(&first, get("/apx/a")),
        harness.hub.submit(&second, get("/apx/b")),
    );
    assert_eq!(a.unwrap().text(), "/apx/a");
    assert_eq!(b.unwrap().text(), "/apx/b");
    assert_eq!(harness.hub.in_flight(&first).await, Some(0));
    assert_eq!(harness.hub.in_flight(&second).await, Some(0));

    harness.stop().await;
}

#[tokio::test]
async fn contexts_only_see_their_own_responses() {
    check_context_isolation("/a").await;
}

#[tokio::test]
async fn contexts_only_see_their_own_responses_in_reverse_order() {
    check_context_isolation("/b").await;
}

#[tokio::test]
async fn submit_before_ready_waits_for_the_handshake() {
    let relay = FakeRelay::new();
    relay.set_ack_delay(Duration::from_millis(300));
    let harness = Harness::start(&relay, test_config(PendingPolicy::Fail), DEADLINE);
    let context = harness.hub.announce().await;

    let started = Instant::now();
    let response = harness.hub.submit(&context, get("/apx/early")).await.unwrap();
    assert_eq!(response.text(), "/apx/early");
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(relay.session_keys().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn submit_without_a_session_fails_after_the_ready_wait() {
    let relay = FakeRelay::new();
    relay.withhold_ack(true);
    let mut config = test_config(PendingPolicy::Fail);
    config.ready_wait = Duration::from_millis(200);
    config.handshake_timeout = Duration::from_secs(5);
    let harness = Harness::start(&relay, config, DEADLINE);
    let context = harness.hub.announce().await;

    let started = Instant::now();
    let err = harness.hub.submit(&context, get("/apx/x")).await.unwrap_err();
    assert_eq!(err, TunnelError::NoSession(Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(relay.request_ids().is_empty());

    harness.stop().await;
}

// =============================================================================
// Failures scoped to one request
// =============================================================================

#[tokio::test]
async fn tag_mismatch_fails_only_that_request() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|req: &ProxyRequest| {
        if req.url.ends_with("/bad") {
            Reply::ok("tampered").corrupted()
        } else {
            Reply::ok(req.url.clone()).after(Duration::from_millis(50))
        }
    }));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let (bad, good) = tokio::join!(
        harness.hub.submit(&context, get("/apx/bad")),
        harness.hub.submit(&context, get("/apx/good")),
    );
    assert!(matches!(bad, Err(TunnelError::Decryption { .. })));
    assert_eq!(good.unwrap().text(), "/apx/good");

    // The session survives and keeps serving.
    assert_eq!(harness.session.state(), SessionState::Ready);
    assert_eq!(harness.session.epoch(), 1);
    let after = harness.hub.submit(&context, get("/apx/after")).await.unwrap();
    assert_eq!(after.text(), "/apx/after");

    harness.stop().await;
}

#[tokio::test]
async fn malformed_frame_naming_an_id_fails_that_request() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let waiter = tokio::spawn(async move { hub.submit(&context, get("/apx/x")).await });
    relay.wait_for_requests(1).await;
    let id = relay.request_ids()[0].clone();

    relay.inject(r#"{"type":"data"}"#).await;
    relay
        .inject(format!(r#"{{"type":"data","id":"{id}","ivBase64":"!!"}}"#))
        .await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::Decryption { id: failed, .. } if failed == id));
    assert_eq!(harness.session.state(), SessionState::Ready);

    harness.stop().await;
}

#[tokio::test]
async fn frames_for_unknown_or_settled_ids_change_nothing() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let first = harness.hub.submit(&context, get("/apx/one")).await.unwrap();
    assert_eq!(first.text(), "/apx/one");
    let settled_id = relay.request_ids()[0].clone();

    let cipher = relay.current_cipher();
    for id in ["never-registered", settled_id.as_str()] {
        let sealed = cipher.seal(b"stray").unwrap();
        let frame = ControlMessage::Data(DataFrame {
            id: id.to_string(),
            iv_base64: encoding::encode(&sealed.iv),
            payload_base64: encoding::encode(&sealed.ciphertext),
            tag_base64: encoding::encode(&sealed.tag),
            status: Some(500),
            headers: None,
        });
        relay.inject(frame.to_json().unwrap()).await;
    }
    relay.inject(ControlMessage::InitAck.to_json().unwrap()).await;
    relay.inject("not json at all").await;

    let second = harness.hub.submit(&context, get("/apx/two")).await.unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.text(), "/apx/two");
    assert!(harness.correlator.is_empty().await);
    assert_eq!(harness.session.epoch(), 1);

    harness.stop().await;
}

fn sealed_frame(cipher: &EnvelopeCipher, id: &str, body: &[u8]) -> String {
    let sealed = cipher.seal(body).unwrap();
    ControlMessage::Data(DataFrame {
        id: id.to_string(),
        iv_base64: encoding::encode(&sealed.iv),
        payload_base64: encoding::encode(&sealed.ciphertext),
        tag_base64: encoding::encode(&sealed.tag),
        status: Some(201),
        headers: None,
    })
    .to_json()
    .unwrap()
}

#[tokio::test]
async fn on_frame_resolves_against_the_ready_session() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let waiter = tokio::spawn(async move { hub.submit(&context, get("/apx/fed")).await });
    relay.wait_for_requests(1).await;
    let id = relay.request_ids()[0].clone();

    harness
        .session
        .on_frame(&sealed_frame(&relay.current_cipher(), &id, b"fed by hand"))
        .await;

    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "fed by hand");
    assert!(harness.correlator.is_empty().await);

    harness.stop().await;
}

#[tokio::test]
async fn on_frame_without_a_session_is_dropped() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::AwaitTimeout), DEADLINE).await;
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let waiter = tokio::spawn(async move { hub.submit(&context, get("/apx/orphan")).await });
    relay.wait_for_requests(1).await;
    let id = relay.request_ids()[0].clone();
    let cipher = relay.current_cipher();

    relay.refuse_connections(true);
    relay.drop_connection();
    harness.wait_for(SessionState::Closed).await;

    harness
        .session
        .on_frame(&sealed_frame(&cipher, &id, b"too late"))
        .await;

    assert!(harness.correlator.contains(&id).await);
    assert_eq!(harness.correlator.len().await, 1);
    assert!(!waiter.is_finished());

    waiter.abort();
    harness.stop().await;
}

#[tokio::test]
async fn silent_relay_times_out_at_the_deadline() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(
        &relay,
        test_config(PendingPolicy::Fail),
        Duration::from_millis(200),
    )
    .await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = harness
        .correlator
        .spawn_sweeper(Duration::from_millis(20), shutdown_rx);
    let context = harness.hub.announce().await;

    let started = Instant::now();
    let err = harness.hub.submit(&context, get("/apx/slow")).await.unwrap_err();
    assert!(matches!(err, TunnelError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(harness.correlator.is_empty().await);

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();
    harness.stop().await;
}

// =============================================================================
// Transport loss policies
// =============================================================================

#[tokio::test]
async fn transport_loss_fails_pending_requests_by_default() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let pending_context = context.clone();
    let waiter = tokio::spawn(async move { hub.submit(&pending_context, get("/apx/lost")).await });
    relay.wait_for_requests(1).await;

    relay.set_responder(common::echo_url());
    relay.drop_connection();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::TransportLoss { .. }));

    // Requests on the next session use its own key and succeed.
    harness.wait_for_epoch(2).await;
    let response = harness.hub.submit(&context, get("/apx/next")).await.unwrap();
    assert_eq!(response.text(), "/apx/next");
    let keys = relay.session_keys();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);

    harness.stop().await;
}

#[tokio::test]
async fn requests_racing_a_teardown_fail_with_it() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    // A request that slipped past the teardown would sit out this deadline.
    let harness = Harness::ready(
        &relay,
        test_config(PendingPolicy::Fail),
        Duration::from_secs(60),
    )
    .await;
    let context = harness.hub.announce().await;

    let rounds = 20_u64;
    let mut waiters = Vec::new();
    for round in 0..rounds {
        for _ in 0..5 {
            let hub = Arc::clone(&harness.hub);
            let context = context.clone();
            waiters.push(tokio::spawn(async move {
                hub.submit(&context, get("/apx/churn")).await
            }));
        }
        tokio::task::yield_now().await;
        if round + 1 == rounds {
            relay.refuse_connections(true);
        }
        relay.drop_connection();
        if round + 1 < rounds {
            harness.wait_for_epoch(round + 2).await;
        }
    }

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(TunnelError::TransportLoss { .. } | TunnelError::NoSession(_))
        ));
    }
    assert!(harness.correlator.is_empty().await);

    harness.stop().await;
}

#[tokio::test]
async fn resubmit_policy_replays_under_a_new_session() {
    let relay = FakeRelay::new();
    let answer = Arc::new(AtomicBool::new(false));
    {
        let answer = Arc::clone(&answer);
        relay.set_responder(Arc::new(move |req: &ProxyRequest| {
            if answer.load(Ordering::SeqCst) {
                Reply::ok(req.url.clone())
            } else {
                Reply::silent()
            }
        }));
    }
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Resubmit), DEADLINE).await;
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let waiter = tokio::spawn(async move { hub.submit(&context, get("/apx/replayed")).await });
    relay.wait_for_requests(1).await;

    answer.store(true, Ordering::SeqCst);
    relay.drop_connection();

    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.text(), "/apx/replayed");

    let ids = relay.request_ids();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert_eq!(harness.session.epoch(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn await_timeout_policy_leaves_requests_to_their_deadline() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|_: &ProxyRequest| Reply::silent()));
    let harness = Harness::ready(
        &relay,
        test_config(PendingPolicy::AwaitTimeout),
        Duration::from_millis(400),
    )
    .await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _sweeper = harness
        .correlator
        .spawn_sweeper(Duration::from_millis(20), shutdown_rx);
    let context = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let waiter = tokio::spawn(async move { hub.submit(&context, get("/apx/held")).await });
    relay.wait_for_requests(1).await;
    relay.drop_connection();
    harness.wait_for_epoch(2).await;

    // Still pending after the reconnect.
    assert_eq!(harness.correlator.len().await, 1);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::Timeout { .. }));

    shutdown_tx.send(true).unwrap();
    harness.stop().await;
}

// =============================================================================
// Context lifecycle
// =============================================================================

#[tokio::test]
async fn disconnected_context_never_receives_its_late_response() {
    let relay = FakeRelay::new();
    relay.set_responder(Arc::new(|req: &ProxyRequest| {
        Reply::ok(req.url.clone()).after(Duration::from_millis(200))
    }));
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let leaving = harness.hub.announce().await;
    let staying = harness.hub.announce().await;

    let hub = Arc::clone(&harness.hub);
    let leaving_id = leaving.clone();
    let waiter = tokio::spawn(async move { hub.submit(&leaving_id, get("/apx/late")).await });
    relay.wait_for_requests(1).await;
    assert_eq!(harness.hub.in_flight(&leaving).await, Some(1));

    assert!(harness.hub.disconnect(&leaving).await);
    assert_eq!(harness.hub.context_count().await, 1);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::Abandoned(_)));
    assert!(harness.correlator.is_empty().await);

    let ok = harness.hub.submit(&staying, get("/apx/alive")).await.unwrap();
    assert_eq!(ok.text(), "/apx/alive");

    harness.stop().await;
}

#[tokio::test]
async fn unknown_context_is_rejected() {
    let relay = FakeRelay::new();
    let harness = Harness::ready(&relay, test_config(PendingPolicy::Fail), DEADLINE).await;
    let context = harness.hub.announce().await;
    harness.hub.disconnect(&context).await;

    let err = harness.hub.submit(&context, get("/apx/x")).await.unwrap_err();
    assert!(matches!(err, TunnelError::ContextNotFound(_)));
    assert!(!harness.hub.disconnect(&context).await);
    assert!(relay.request_ids().is_empty());

    harness.stop().await;
}
