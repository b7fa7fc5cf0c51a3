//! End-to-end dispatcher behavior: ordering, coalescing, cancellation, retry
//! and event sequencing.

#![allow(clippy::unwrap_used)] // Test code

use courier_core::{
    Clock, Connectivity, Request, RequestError, RequestId, Transport, TransportResponse,
};
use courier_runtime::cache::Cache;
use courier_runtime::dispatcher::{AddOptions, Dispatcher, DispatcherConfig, ElementStatus};
use courier_runtime::events::{Channel, EventBus, LifecycleEvent};
use courier_runtime::interceptor::request_interceptor;
use courier_runtime::retry::RetryPolicy;
use courier_testing::{EventRecorder, MockTransport, TokioClock, ToggleConnectivity};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn backoff() -> RetryPolicy {
    RetryPolicy::builder()
        .initial_delay(Duration::from_millis(100))
        .multiplier(2.0)
        .build()
}

fn dispatcher_with(transport: &Arc<MockTransport>, config: DispatcherConfig) -> Dispatcher {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    Dispatcher::builder(
        Arc::clone(transport) as Arc<dyn Transport>,
        Cache::new(Arc::clone(&clock)),
        EventBus::new(),
    )
    .clock(clock)
    .config(config)
    .build()
}

fn dispatcher(transport: &Arc<MockTransport>) -> Dispatcher {
    dispatcher_with(transport, DispatcherConfig::new().with_retry_policy(backoff()))
}

fn record(dispatcher: &Dispatcher, request: &Request) -> EventRecorder {
    EventRecorder::attach(dispatcher.events(), &request.queue_key(), &request.abort_key())
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_bursts_coalesce_and_supersede() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(1)));
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/search")
        .with_query("q=rust")
        .with_cancelable(true);
    let recorder = record(&dispatcher, &request);

    let initial = dispatcher.add(request.clone(), AddOptions::default());
    sleep(Duration::from_millis(100)).await;

    let first_burst: Vec<RequestId> = (0..3)
        .map(|_| dispatcher.add(request.clone(), AddOptions::revalidate()))
        .collect();
    sleep(Duration::from_millis(200)).await;

    let second_burst: Vec<RequestId> = (0..3)
        .map(|_| dispatcher.add(request.clone(), AddOptions::revalidate()))
        .collect();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(recorder.loading_pulses(), 3);
    assert_eq!(recorder.count(Channel::Abort), 2);

    assert!(first_burst.iter().all(|id| *id == first_burst[0]));
    assert!(second_burst.iter().all(|id| *id == second_burst[0]));
    assert_ne!(initial, first_burst[0]);
    assert_ne!(first_burst[0], second_burst[0]);

    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].details.request_id, second_burst[0]);
    assert_eq!(transport.call_count(), 3);
    assert_eq!(transport.completed_count(), 1);
    assert_eq!(recorder.loading_states().last(), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn test_cancelable_request_aborts_sibling_before_starting() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(500)));
    let dispatcher = dispatcher(&transport);
    let first = Request::new("/search").with_query("q=a").with_cancelable(true);
    let second = Request::new("/search").with_query("q=b").with_cancelable(true);

    let log = Arc::new(Mutex::new(Vec::new()));
    let abort_log = Arc::clone(&log);
    let _aborts = dispatcher.events().on_abort("GET_/search", move |details| {
        abort_log
            .lock()
            .unwrap()
            .push(format!("abort {}", details.request.cache_key()));
    });
    let start_log = Arc::clone(&log);
    let _starts = dispatcher
        .events()
        .on_request_start(second.queue_key(), move |details| {
            start_log
                .lock()
                .unwrap()
                .push(format!("start {}", details.request.cache_key()));
        });

    dispatcher.add(first, AddOptions::default());
    sleep(Duration::from_millis(100)).await;
    dispatcher.add(second, AddOptions::default());
    sleep(Duration::from_secs(1)).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "abort GET_/search?q=a".to_string(),
            "start GET_/search?q=b".to_string(),
        ]
    );
    assert!(dispatcher.cache().get("GET_/search?q=a").is_none());
    assert!(dispatcher.cache().get("GET_/search?q=b").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_lane_completes_in_enqueue_order() {
    let transport = Arc::new(MockTransport::new());
    for delay in [400, 50, 300, 10, 200] {
        transport.respond_after(
            "/jobs",
            TransportResponse::success(json!(delay), 200),
            Duration::from_millis(delay),
        );
    }
    let dispatcher = dispatcher(&transport);

    let completed = Arc::new(Mutex::new(Vec::new()));
    let completed_clone = Arc::clone(&completed);
    let _sub = dispatcher.events().on_response("jobs", move |event| {
        completed_clone.lock().unwrap().push(event.details.request_id);
    });

    let added: Vec<RequestId> = (0..5)
        .map(|n| {
            dispatcher.add(
                Request::new("/jobs")
                    .with_queue_key("jobs")
                    .with_body(n.to_string()),
                AddOptions::default(),
            )
        })
        .collect();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(*completed.lock().unwrap(), added);
}

#[tokio::test(start_paused = true)]
async fn test_success_event_sequence() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/users");
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_millis(200)).await;

    assert_eq!(
        recorder.channels(),
        vec![
            Channel::Loading,
            Channel::RequestStart,
            Channel::ResponseStart,
            Channel::Response,
            Channel::Loading,
            Channel::Remove,
        ]
    );
    assert_eq!(recorder.loading_states(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_progress_signals_become_events() {
    let transport = Arc::new(
        MockTransport::new()
            .with_delay(Duration::from_millis(100))
            .with_progress(1000),
    );
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/upload");
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_millis(200)).await;

    assert_eq!(recorder.count(Channel::UploadProgress), 2);
    assert_eq!(recorder.count(Channel::DownloadProgress), 2);
    assert_eq!(recorder.count(Channel::ResponseStart), 1);

    let first_upload = recorder
        .events()
        .into_iter()
        .find_map(|event| match event {
            LifecycleEvent::UploadProgress(progress) => Some(progress),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_upload.progress.loaded, 500);
    assert_eq!(first_upload.progress.size_left, 500);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff_then_success() {
    courier_testing::init_test_tracing();
    let transport = Arc::new(MockTransport::new());
    transport.respond("/flaky", TransportResponse::failure(json!("unavailable"), 503));
    transport.respond("/flaky", TransportResponse::failure(json!("unavailable"), 503));
    transport.respond("/flaky", TransportResponse::success(json!("ok"), 200));
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/flaky").with_retry(2);
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.call_count(), 1);
    let element = dispatcher.get("GET_/flaky").unwrap();
    assert_eq!(element.status, ElementStatus::Backoff);
    assert_eq!(element.retries, 1);
    assert!(dispatcher.is_loading("GET_/flaky"));
    assert!(!dispatcher.has_running_requests("GET_/flaky"));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.call_count(), 2);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.call_count(), 3);

    let retry_flags: Vec<(bool, bool)> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LifecycleEvent::Loading(loading) => Some((loading.is_loading, loading.is_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(
        retry_flags,
        vec![(true, false), (true, true), (true, true), (false, false)]
    );

    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].is_failed());
    assert_eq!(responses[0].details.retries, 2);

    let entry = dispatcher.cache().get("GET_/flaky").unwrap();
    assert_eq!(entry.data, Some(json!("ok")));
    assert_eq!(entry.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_is_terminal() {
    courier_testing::init_test_tracing();
    let transport = Arc::new(MockTransport::new());
    for _ in 0..3 {
        transport.respond("/down", TransportResponse::failure(json!("down"), 500));
    }
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/down").with_retry(1);
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.call_count(), 2);
    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].outcome,
        Err(RequestError::Transport {
            status: 500,
            payload: json!("down"),
        })
    );

    let entry = dispatcher.cache().get("GET_/down").unwrap();
    assert_eq!(entry.error, Some(json!("down")));
    assert_eq!(entry.data, None);
    assert_eq!(entry.retries, 1);
    assert!(dispatcher.get("GET_/down").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_is_not_retried_or_cached() {
    let transport = Arc::new(MockTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let dispatcher = Dispatcher::builder(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Cache::new(Arc::clone(&clock)),
        EventBus::new(),
    )
    .clock(clock)
    .interceptor(request_interceptor(|_| Err(anyhow::anyhow!("missing token"))))
    .build();
    let request = Request::new("/private").with_retry(3);
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.call_count(), 0);
    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].outcome,
        Err(RequestError::Validation("missing token".into()))
    );
    assert!(dispatcher.cache().get("GET_/private").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failure_while_offline_is_classified_offline() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/feed", TransportResponse::failure(json!("network"), 0));
    let connectivity = ToggleConnectivity::new(false);
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let dispatcher = Dispatcher::builder(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Cache::new(Arc::clone(&clock)),
        EventBus::new(),
    )
    .clock(clock)
    .connectivity(Arc::new(connectivity.clone()) as Arc<dyn Connectivity>)
    .build();
    let request = Request::new("/feed");
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request.clone(), AddOptions::default());
    sleep(Duration::from_millis(10)).await;

    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_offline());

    // Back online, the same failure is a plain transport error
    connectivity.set_online(true);
    recorder.reset();
    transport.respond("/feed", TransportResponse::failure(json!("server"), 502));
    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_millis(10)).await;

    let responses = recorder.responses();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_failed());
    assert!(!responses[0].is_offline());
}

#[tokio::test(start_paused = true)]
async fn test_delete_pending_emits_remove_only() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/jobs").with_queue_key("jobs");
    let recorder = record(&dispatcher, &request);

    let running = dispatcher.add(request.clone().with_body("1"), AddOptions::default());
    let pending = dispatcher.add(request.with_body("2"), AddOptions::default());
    recorder.reset();

    assert!(dispatcher.delete("jobs", pending));
    assert_eq!(recorder.channels(), vec![Channel::Remove]);

    assert!(dispatcher.delete("jobs", running));
    assert_eq!(
        recorder.channels(),
        vec![Channel::Remove, Channel::Abort, Channel::Remove, Channel::Loading]
    );
    assert_eq!(recorder.loading_states(), vec![false]);
    assert!(!dispatcher.delete("jobs", running));
}

#[tokio::test(start_paused = true)]
async fn test_abort_spans_lanes() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(1)));
    let dispatcher = dispatcher(&transport);

    dispatcher.add(
        Request::new("/a").with_abort_key("session"),
        AddOptions::default(),
    );
    let kept = dispatcher.add(Request::new("/b"), AddOptions::default());
    dispatcher.add(
        Request::new("/c").with_abort_key("session"),
        AddOptions::default(),
    );

    assert_eq!(dispatcher.abort("session"), 2);
    let running = dispatcher.get_all_running_requests();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].request_id, kept);

    assert!(dispatcher.abort_by_id(kept));
    assert!(dispatcher.get_all_running_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_loading_turns_off_after_last_concurrent_request() {
    let transport = Arc::new(MockTransport::new());
    for (value, delay) in [(1, 100), (2, 300)] {
        transport.respond_after(
            "/a",
            TransportResponse::success(json!(value), 200),
            Duration::from_millis(delay),
        );
    }
    let dispatcher = dispatcher_with(&transport, DispatcherConfig::new().with_max_concurrency(2));
    let request = Request::new("/a").with_queue_key("lane");
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request.clone().with_body("1"), AddOptions::default());
    dispatcher.add(request.with_body("2"), AddOptions::default());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.loading_states(), vec![true, true]);
    assert!(dispatcher.has_running_requests("lane"));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.loading_states(), vec![true, true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_lane_keeps_elements_without_terminal_events() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let dispatcher = dispatcher(&transport);
    let request = Request::new("/sync");
    let recorder = record(&dispatcher, &request);

    dispatcher.add(request, AddOptions::default());
    sleep(Duration::from_millis(10)).await;
    dispatcher.stop("GET_/sync");
    sleep(Duration::from_millis(500)).await;

    assert_eq!(recorder.count(Channel::Abort), 0);
    assert_eq!(recorder.count(Channel::Response), 0);
    assert_eq!(recorder.loading_states(), vec![true, false]);

    dispatcher.start("GET_/sync");
    sleep(Duration::from_millis(500)).await;

    assert_eq!(recorder.count(Channel::Response), 1);
    assert_eq!(recorder.loading_states(), vec![true, false, true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_cache_listener_sees_dispatcher_writes() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/profile", TransportResponse::success(json!({"name": "ada"}), 200));
    let dispatcher = dispatcher(&transport);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _sub = dispatcher.cache().events().get("GET_/profile", move |entry| {
        seen_clone.lock().unwrap().push(entry.data.clone());
    });

    dispatcher.add(Request::new("/profile"), AddOptions::default());
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*seen.lock().unwrap(), vec![Some(json!({"name": "ada"}))]);
}
