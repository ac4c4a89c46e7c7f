use super::*;
use crate::model::{StatusResponse, WorkflowRunStatus};
use crate::storage::MemoryStore;
use crate::testing::{status, timed_out, MockTransport};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

const KEY: &str = "genrun.active_run";

fn tracker(mock: &Arc<MockTransport>, store: &Arc<MemoryStore>) -> RunTracker<Value> {
    RunTracker::new(mock.clone(), store.clone())
}

fn fast() -> TrackOptions<Value> {
    TrackOptions::default()
        .polling_interval(Duration::from_millis(10))
        .max_polling_attempts(3)
}

#[tokio::test(start_paused = true)]
async fn immediate_result_completes_without_polling() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"success": true, "output": {"days": 3}})));

    let succeeded = Arc::new(Mutex::new(None));
    let s = succeeded.clone();
    let t = tracker(&mock, &store);
    t.submit(
        "generate/workout",
        json!({"goal": "strength"}),
        TrackOptions::default()
            .persist_as(KEY)
            .on_success(move |out: &Value| *s.lock() = Some(out.clone())),
    )
    .await
    .unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.status, Some(WorkflowRunStatus::Completed));
    assert_eq!(snap.progress, 100);
    assert_eq!(snap.output, Some(json!({"days": 3})));
    assert_eq!(*succeeded.lock(), Some(json!({"days": 3})));
    assert_eq!(mock.status_count(), 0);
    assert_eq!(store.get(KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn durable_run_persists_id_until_terminal() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"workflowRunId": "run_1"})));
    mock.push_status(Ok(status(WorkflowRunStatus::Running, 30.0)));
    mock.push_status(Ok(StatusResponse {
        current_step: Some("balancing macros".into()),
        ..status(WorkflowRunStatus::Running, 70.0)
    }));
    mock.push_status(Ok(StatusResponse {
        output: Some(json!({"meals": 21})),
        ..status(WorkflowRunStatus::Completed, 100.0)
    }));

    let seen = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
    let t = tracker(&mock, &store);
    let mut rx = t.subscribe();
    t.submit("generate/nutrition", json!({}), TrackOptions::default().persist_as(KEY))
        .await
        .unwrap();

    // Watch the persisted key while the run is in flight.
    loop {
        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone();
        seen.lock().push(store.get(KEY).unwrap());
        if snap.is_terminal() {
            break;
        }
        if snap.run_id.is_some() {
            assert_eq!(store.get(KEY).unwrap().as_deref(), Some("run_1"));
        }
    }

    let snap = t.snapshot();
    assert_eq!(snap.status, Some(WorkflowRunStatus::Completed));
    assert_eq!(snap.output, Some(json!({"meals": 21})));
    assert_eq!(snap.current_step.as_deref(), Some("balancing macros"));
    assert_eq!(mock.status_count(), 3);
    assert_eq!(store.get(KEY).unwrap(), None);
    assert!(seen.lock().iter().any(|v| v.as_deref() == Some("run_1")));
}

#[tokio::test(start_paused = true)]
async fn transport_failures_end_in_timeout_after_max_attempts() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));

    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let e = errors.clone();
    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), fast().on_error(move |err| e.lock().push(err.to_string())))
        .await
        .unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.status, Some(WorkflowRunStatus::Error));
    assert!(snap.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(mock.status_count(), 3);
    assert_eq!(errors.lock().len(), 1);

    // Nothing else is scheduled afterwards.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.status_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_errors_back_off_with_doubled_interval() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.push_status(Err(timed_out()));
    mock.push_status(Ok(status(WorkflowRunStatus::Completed, 100.0)));

    let t = tracker(&mock, &store);
    t.submit(
        "generate",
        json!({}),
        TrackOptions::default().polling_interval(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.status_count(), 1, "retry must wait twice the interval");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.status_count(), 2);
    assert_eq!(t.wait_terminal().await.status, Some(WorkflowRunStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn non_terminal_statuses_time_out_at_the_ceiling() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.fallback_status(status(WorkflowRunStatus::Paused, 10.0));

    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), fast().persist_as(KEY)).await.unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.status, Some(WorkflowRunStatus::Error));
    assert_eq!(
        snap.error.as_deref(),
        Some("generation timed out after 3 polling attempts")
    );
    assert_eq!(mock.status_count(), 3);
    assert_eq!(store.get(KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn server_failure_is_reported_verbatim() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.push_status(Ok(StatusResponse {
        error: Some("model quota exceeded".into()),
        ..status(WorkflowRunStatus::Failed, 40.0)
    }));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), fast().on_error(move |err| e.lock().push(err.to_string())))
        .await
        .unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.status, Some(WorkflowRunStatus::Failed));
    assert_eq!(snap.error.as_deref(), Some("model quota exceeded"));
    assert_eq!(*errors.lock(), vec!["model quota exceeded".to_string()]);
    assert_eq!(mock.status_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent_and_silent() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.fallback_status(status(WorkflowRunStatus::Running, 20.0));

    let errors = Arc::new(AtomicUsize::new(0));
    let e = errors.clone();
    let t = tracker(&mock, &store);
    t.submit(
        "generate",
        json!({}),
        TrackOptions::default()
            .persist_as(KEY)
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let polled = mock.status_count();
    assert!(polled >= 1);

    t.cancel().await;
    t.cancel().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(t.snapshot().status, Some(WorkflowRunStatus::Cancelled));
    assert_eq!(*mock.cancel_calls.lock(), vec!["r1".to_string()]);
    assert_eq!(mock.status_count(), polled);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_submission_aborts_request() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.delay_submit(Duration::from_secs(5));
    mock.push_submit(Ok(json!({"runId": "late"})));

    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), fast().persist_as(KEY)).await.unwrap();
    assert!(t.snapshot().is_generating());
    t.cancel().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snap = t.snapshot();
    assert_eq!(snap.status, Some(WorkflowRunStatus::Cancelled));
    assert_eq!(snap.run_id, None);
    assert!(mock.cancel_calls.lock().is_empty());
    assert_eq!(mock.status_count(), 0);
    assert_eq!(store.get(KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn resume_after_reload_matches_uninterrupted_run() {
    let store = Arc::new(MemoryStore::new());
    let first = MockTransport::new();
    first.push_submit(Ok(json!({"runId": "r7"})));
    first.fallback_status(status(WorkflowRunStatus::Running, 50.0));

    {
        let t = tracker(&first, &store);
        t.submit("generate", json!({}), TrackOptions::default().persist_as(KEY))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Simulated reload: the tracker goes away without a terminal state.
    }
    assert_eq!(store.get(KEY).unwrap().as_deref(), Some("r7"));

    let second = MockTransport::new();
    second.push_status(Ok(status(WorkflowRunStatus::Running, 80.0)));
    second.push_status(Ok(StatusResponse {
        output: Some(json!("done")),
        ..status(WorkflowRunStatus::Completed, 100.0)
    }));
    let run_id = RunTracker::<Value>::persisted_run_id(store.as_ref(), KEY).unwrap();
    let t = tracker(&second, &store);
    t.resume(run_id, TrackOptions::default().persist_as(KEY)).await;

    let snap = t.wait_terminal().await;
    assert_eq!(snap.run_id.as_deref(), Some("r7"));
    assert_eq!(snap.output, Some(json!("done")));
    assert_eq!(second.status_count(), 2);
    assert_eq!(store.get(KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn reset_returns_to_idle() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.fallback_status(status(WorkflowRunStatus::Running, 5.0));

    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), TrackOptions::default().persist_as(KEY))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    t.reset().await;

    let snap = t.snapshot();
    assert!(snap.is_idle());
    assert_eq!(snap.run_id, None);
    assert_eq!(store.get(KEY).unwrap(), None);
    let polled = mock.status_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(mock.status_count(), polled);
}

#[tokio::test(start_paused = true)]
async fn transforms_and_status_callbacks() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Ok(json!({"runId": "r1"})));
    mock.push_status(Ok(status(WorkflowRunStatus::Running, 60.0)));
    // Regressed progress is not applied.
    mock.push_status(Ok(status(WorkflowRunStatus::Running, 40.0)));
    mock.push_status(Ok(StatusResponse {
        output: Some(json!({"count": 4})),
        ..status(WorkflowRunStatus::Completed, 100.0)
    }));

    let progress = Arc::new(Mutex::new(Vec::new()));
    let p = progress.clone();
    let t: RunTracker<u64> = RunTracker::new(mock.clone(), store.clone());
    t.submit(
        "generate",
        json!({"weeks": 2}),
        TrackOptions::default()
            .polling_interval(Duration::from_millis(10))
            .transform_input(|mut v| {
                v["source"] = json!("cli");
                v
            })
            .transform_output(|v| v["count"].as_u64().ok_or_else(|| "no count".to_string()))
            .on_status_change(move |s| p.lock().push(s.progress)),
    )
    .await
    .unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.output, Some(4));
    assert_eq!(mock.submit_bodies.lock()[0], json!({"weeks": 2, "source": "cli"}));
    let seen = progress.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test(start_paused = true)]
async fn submission_error_is_surfaced_once() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    mock.push_submit(Err(TrackerError::api_error(402, "not enough credits")));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let t = tracker(&mock, &store);
    t.submit("generate", json!({}), fast().on_error(move |err| e.lock().push(err.to_string())))
        .await
        .unwrap();

    let snap = t.wait_terminal().await;
    assert_eq!(snap.status, Some(WorkflowRunStatus::Error));
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].contains("not enough credits"));
    assert_eq!(mock.status_count(), 0);
}
