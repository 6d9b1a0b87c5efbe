//! End-to-end worker pipeline tests over the in-memory store and gate,
//! with wiremock standing in for destinations.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use hookline_core::{
    AttemptStatus, Destination, DestinationId, Event, EventId, RealClock, Route, RouteId, SourceId,
};
use hookline_delivery::{
    DeliveryStore, DeliveryWorker, Dispatcher, DispatcherConfig, EngineStats, MemoryDeliveryStore,
    MemoryRateGate, RateGate, SystemResolver, WorkerIdentity,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Pipeline {
    store: Arc<MemoryDeliveryStore>,
    gate: Arc<MemoryRateGate>,
    worker: DeliveryWorker,
}

fn build_pipeline() -> Pipeline {
    let clock = Arc::new(RealClock);
    let store = Arc::new(MemoryDeliveryStore::new(clock.clone()));
    let gate = Arc::new(MemoryRateGate::new(clock.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(SystemResolver),
        clock.clone(),
        DispatcherConfig { allow_private_ips: true, ..Default::default() },
    ));

    let worker = DeliveryWorker::new(
        0,
        store.clone(),
        gate.clone(),
        dispatcher,
        clock,
        CancellationToken::new(),
        WorkerIdentity { name: "worker-1".to_string(), version: "v0.3.1".to_string() },
        Arc::new(RwLock::new(EngineStats::default())),
    );

    Pipeline { store, gate, worker }
}

fn destination(url: &str) -> Destination {
    Destination {
        id: DestinationId::new(),
        name: format!("dest-{}", DestinationId::new()),
        url: url.to_string(),
        headers: sqlx::types::Json(HashMap::new()),
        secret: None,
        connect_timeout_s: 5,
        total_timeout_s: 10,
        verify_tls: true,
        max_rps: 100.0,
        burst: 100,
        max_inflight: 10,
        breaker_failure_ratio: 0.5,
        breaker_min_requests: 10,
        breaker_cooldown_s: 60,
        append_path: false,
        created_at: Utc::now(),
    }
}

fn event(body: &[u8]) -> Event {
    Event {
        id: EventId::new(),
        source_id: SourceId::new(),
        received_at: Utc::now(),
        content_type: Some("application/json".to_string()),
        headers: sqlx::types::Json(HashMap::new()),
        body: body.to_vec(),
        body_size: i32::try_from(body.len()).unwrap(),
        source_ip: None,
        idempotency_key: None,
        body_hash: Event::hash_body(body),
        method: None,
        path: Some("/".to_string()),
        query: None,
    }
}

async fn enqueue(pipeline: &Pipeline, dest: Destination, ev: Event) -> hookline_core::AttemptId {
    let route = Route {
        id: RouteId::new(),
        source_id: ev.source_id,
        destination_id: dest.id,
        enabled: true,
        content_type_like: None,
        ord: 0,
    };
    let route_id = route.id;
    pipeline.store.insert_destination(dest).await;
    pipeline.store.insert_route(route).await;
    pipeline.store.enqueue(ev, route_id).await
}

#[tokio::test]
async fn successful_dispatch_ends_succeeded() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let dest = destination(&format!("{}/hook", server.uri()));
    let dest_id = dest.id;
    let attempt_id = enqueue(&pipeline, dest, event(b"{\"x\":1}")).await;

    assert!(pipeline.worker.tick().await.unwrap());

    let attempt = pipeline.store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Succeeded);
    assert_eq!(attempt.http_code, Some(200));
    assert_eq!(attempt.worker_name.as_deref(), Some("worker-1"));
    assert!(attempt.succeeded_at.is_some());
    assert_eq!(attempt.response_body.as_deref(), Some("ok"));

    let health = pipeline.store.health_snapshot(dest_id).await.unwrap();
    assert_eq!(health.success_count, 1);
    assert_eq!(health.failure_count, 0);

    // The in-flight reservation was released.
    assert_eq!(pipeline.gate.inflight(dest_id).await, 0);
}

#[tokio::test]
async fn empty_queue_reports_idle() {
    let pipeline = build_pipeline();
    assert!(!pipeline.worker.tick().await.unwrap());
}

#[tokio::test]
async fn claim_hands_each_attempt_to_exactly_one_caller() {
    let clock = Arc::new(RealClock);
    let store = Arc::new(MemoryDeliveryStore::new(clock));
    let route_id = RouteId::new();

    let first = store.enqueue(event(b"a"), route_id).await;
    let second = store.enqueue(event(b"b"), route_id).await;

    let a = store.claim_next("w1".to_string(), "v".to_string()).await.unwrap().unwrap();
    let b = store.claim_next("w2".to_string(), "v".to_string()).await.unwrap().unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(
        [a.id, b.id].iter().filter(|id| [first, second].contains(id)).count(),
        2
    );

    // Everything due is picked; a third claim comes up empty.
    assert!(store.claim_next("w3".to_string(), "v".to_string()).await.unwrap().is_none());

    for id in [first, second] {
        assert_eq!(store.attempt(id).await.unwrap().status, AttemptStatus::Picked);
    }
}

#[tokio::test]
async fn server_error_schedules_retry_with_fast_ramp() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let dest = destination(&server.uri());
    let attempt_id = enqueue(&pipeline, dest, event(b"x")).await;

    let before = Utc::now();
    pipeline.worker.tick().await.unwrap();

    let attempt = pipeline.store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert_eq!(attempt.attempt_no, 1);
    assert_eq!(attempt.http_code, Some(503));

    // First failure: minimum fast-ramp step of 5s.
    let delay = (attempt.next_at - before).num_seconds();
    assert!((4..=6).contains(&delay), "unexpected retry delay {delay}s");
}

#[tokio::test]
async fn retry_after_on_429_is_honored() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_string("slow down")
                .append_header("Retry-After", "2"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let dest = destination(&server.uri());
    let attempt_id = enqueue(&pipeline, dest, event(b"x")).await;

    let before = Utc::now();
    pipeline.worker.tick().await.unwrap();

    let attempt = pipeline.store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert_eq!(attempt.attempt_no, 1);
    assert_eq!(attempt.http_code, Some(429));

    // Retry-After: 2 beats the 5s schedule step.
    let delay_ms = (attempt.next_at - before).num_milliseconds();
    assert!((1500..=3000).contains(&delay_ms), "unexpected retry delay {delay_ms}ms");
}

#[tokio::test]
async fn exhausted_attempts_fail_terminally() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let dest = destination(&server.uri());
    let attempt_id = enqueue(&pipeline, dest, event(b"x")).await;
    pipeline.store.set_attempt_no(attempt_id, 60).await;

    pipeline.worker.tick().await.unwrap();

    let attempt = pipeline.store.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(attempt.failed_at.is_some());
    assert_eq!(attempt.http_code, Some(500));
}

#[tokio::test]
async fn breaker_opens_after_failure_ratio_and_defers_claims() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        // Exactly two dispatches: the third claim must defer without dialing.
        .expect(2)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let mut dest = destination(&server.uri());
    dest.breaker_min_requests = 2;
    dest.breaker_failure_ratio = 0.5;
    dest.breaker_cooldown_s = 60;
    let dest_id = dest.id;

    let first = enqueue(&pipeline, dest.clone(), event(b"a")).await;
    let route_id = pipeline.store.attempt(first).await.unwrap().route_id;
    let second = pipeline.store.enqueue(event(b"b"), route_id).await;
    let third = pipeline.store.enqueue(event(b"c"), route_id).await;

    pipeline.worker.tick().await.unwrap();
    pipeline.worker.tick().await.unwrap();

    let health = pipeline.store.health_snapshot(dest_id).await.unwrap();
    assert_eq!(health.failure_count, 2);
    let open_until = health.open_until.expect("breaker should be open");
    assert!(open_until > Utc::now() + chrono::Duration::seconds(50));

    // Third attempt defers to open_until without dispatching.
    pipeline.worker.tick().await.unwrap();
    let deferred = pipeline.store.attempt(third).await.unwrap();
    assert_eq!(deferred.status, AttemptStatus::Pending);
    assert_eq!(deferred.next_at, open_until);
    assert_eq!(deferred.attempt_no, 0);

    // First and second are waiting on the retry schedule.
    assert_eq!(pipeline.store.attempt(first).await.unwrap().attempt_no, 1);
    assert_eq!(pipeline.store.attempt(second).await.unwrap().attempt_no, 1);
}

#[tokio::test]
async fn ssrf_blocked_destination_records_failure_without_dialing() {
    // Production dispatcher configuration: block sets active.
    let clock = Arc::new(RealClock);
    let store = Arc::new(MemoryDeliveryStore::new(clock.clone()));
    let gate = Arc::new(MemoryRateGate::new(clock.clone()));
    let worker = DeliveryWorker::new(
        0,
        store.clone(),
        gate.clone(),
        Arc::new(Dispatcher::new(
            Arc::new(SystemResolver),
            clock.clone(),
            DispatcherConfig::default(),
        )),
        clock,
        CancellationToken::new(),
        WorkerIdentity { name: "worker-1".to_string(), version: "v0.3.1".to_string() },
        Arc::new(RwLock::new(EngineStats::default())),
    );
    let pipeline = Pipeline { store, gate, worker };

    let dest = destination("http://169.254.169.254/latest/meta-data");
    let attempt_id = enqueue(&pipeline, dest, event(b"x")).await;

    pipeline.worker.tick().await.unwrap();

    let attempt = pipeline.store.attempt(attempt_id).await.unwrap();
    // Policy refusal is a failure outcome on the retry schedule.
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert_eq!(attempt.attempt_no, 1);
    assert_eq!(attempt.http_code, None);
    let error = attempt.response_error.expect("error should be recorded");
    assert!(error.starts_with("ssrf_blocked"), "unexpected error: {error}");
}

#[tokio::test]
async fn rate_gate_spaces_out_admissions() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        // Only the first attempt may dispatch this round.
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build_pipeline();
    let mut dest = destination(&server.uri());
    dest.max_rps = 1.0;
    dest.burst = 1;

    let first = enqueue(&pipeline, dest.clone(), event(b"a")).await;
    let route_id = pipeline.store.attempt(first).await.unwrap().route_id;
    let second = pipeline.store.enqueue(event(b"b"), route_id).await;
    let third = pipeline.store.enqueue(event(b"c"), route_id).await;

    let before = Utc::now();
    pipeline.worker.tick().await.unwrap();
    pipeline.worker.tick().await.unwrap();
    pipeline.worker.tick().await.unwrap();

    assert_eq!(
        pipeline.store.attempt(first).await.unwrap().status,
        AttemptStatus::Succeeded
    );

    // The throttled attempts are deferred roughly one token apart.
    for id in [second, third] {
        let attempt = pipeline.store.attempt(id).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert_eq!(attempt.attempt_no, 0, "throttling must not consume a retry");
        let wait_ms = (attempt.next_at - before).num_milliseconds();
        assert!((500..=2500).contains(&wait_ms), "unexpected gate wait {wait_ms}ms");
    }
}

#[tokio::test]
async fn inflight_cap_defers_with_short_wait() {
    let pipeline = build_pipeline();
    let mut dest = destination("http://203.0.113.9/hook");
    dest.max_inflight = 1;
    let dest_id = dest.id;

    let first = enqueue(&pipeline, dest.clone(), event(b"a")).await;
    let route_id = pipeline.store.attempt(first).await.unwrap().route_id;
    let second = pipeline.store.enqueue(event(b"b"), route_id).await;

    // Occupy the only slot directly.
    pipeline.gate.admit(dest_id, dest.burst, dest.max_rps, dest.max_inflight).await.unwrap();

    let before = Utc::now();
    pipeline.worker.tick().await.unwrap();

    // Whichever attempt was claimed first got deferred by the cap.
    let deferred = pipeline.store.attempt(first).await.unwrap();
    let other = pipeline.store.attempt(second).await.unwrap();
    let throttled = if deferred.next_at > before { deferred } else { other };
    assert_eq!(throttled.status, AttemptStatus::Pending);
    let wait_ms = (throttled.next_at - before).num_milliseconds();
    assert!((50..=500).contains(&wait_ms), "unexpected cap wait {wait_ms}ms");
}

#[tokio::test]
async fn janitor_sweep_deletes_expired_events_and_requeues_stale_claims() {
    use hookline_delivery::{Janitor, JanitorConfig};

    let clock = Arc::new(RealClock);
    let store = Arc::new(MemoryDeliveryStore::new(clock.clone()));

    let dest = destination("http://203.0.113.9/hook");
    let route = Route {
        id: RouteId::new(),
        source_id: SourceId::new(),
        destination_id: dest.id,
        enabled: true,
        content_type_like: None,
        ord: 0,
    };
    let route_id = route.id;
    store.insert_destination(dest).await;
    store.insert_route(route).await;

    // Old event with a terminal attempt: eligible for deletion.
    let mut old_event = event(b"old");
    old_event.received_at = Utc::now() - chrono::Duration::days(30);
    let old_attempt = store.enqueue(old_event, route_id).await;
    store
        .record_failure(old_attempt, hookline_delivery::store::DispatchOutcome::default())
        .await
        .unwrap();

    // Old event with a live (pending) attempt: retained.
    let mut live_event = event(b"live");
    live_event.received_at = Utc::now() - chrono::Duration::days(30);
    store.enqueue(live_event, route_id).await;

    let janitor = Janitor::new(
        store.clone(),
        clock,
        CancellationToken::new(),
        JanitorConfig { retention_days: 7, ..Default::default() },
    );
    janitor.sweep_once().await;

    assert_eq!(store.event_count().await, 1);
}
