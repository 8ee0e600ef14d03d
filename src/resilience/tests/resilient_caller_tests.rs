use super::*;
use crate::testing::{RecordingObserver, Reply, ScriptedCaller};
use serde_json::json;

const CALL: Duration = Duration::from_secs(5);

fn timeout_error(capability: &str) -> CallError {
    CallError::Timeout {
        capability: capability.to_string(),
        method: "run".to_string(),
        after: CALL,
    }
}

fn policy(max_attempts: u32, threshold: u32) -> ResiliencePolicy {
    ResiliencePolicy {
        max_attempts,
        breaker_threshold: threshold,
        ..ResiliencePolicy::default()
    }
}

fn caller(
    inner: &Arc<ScriptedCaller>,
    policy: ResiliencePolicy,
) -> (ResilientCaller, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let inner: Arc<dyn ToolCaller> = inner.clone();
    (
        ResilientCaller::new(inner, &policy, observer.clone()),
        observer,
    )
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_until_success() {
    let inner = ScriptedCaller::new();
    inner
        .push("research", "run", Reply::Return(Err(timeout_error("research"))))
        .push("research", "run", Reply::Return(Err(timeout_error("research"))))
        .push_ok("research", "run", json!("finally"));
    let (resilient, _) = caller(&inner, policy(3, 5));

    let started = tokio::time::Instant::now();
    let result = resilient
        .call("research", "run", json!({}), CALL)
        .await
        .unwrap();

    assert_eq!(result, json!("finally"));
    assert_eq!(inner.calls_to("research").len(), 3);
    // 200ms + 400ms of backoff
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(600) && waited < Duration::from_millis(700));
    assert_eq!(resilient.status("research").consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_max_attempts() {
    let inner = ScriptedCaller::new();
    inner.always("research", "run", Reply::Return(Err(timeout_error("research"))));
    let (resilient, _) = caller(&inner, policy(3, 5));

    let err = resilient
        .call("research", "run", json!({}), CALL)
        .await
        .unwrap_err();

    assert_eq!(err, timeout_error("research"));
    assert_eq!(inner.calls_to("research").len(), 3);
    assert_eq!(resilient.status("research").consecutive_failures, 1);
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let inner = ScriptedCaller::new();
    inner.always(
        "verify",
        "run",
        Reply::Return(Err(CallError::Remote {
            capability: "verify".to_string(),
            kind: "bad_input".to_string(),
            message: "nope".to_string(),
            retryable: false,
        })),
    );
    let (resilient, _) = caller(&inner, policy(3, 5));

    let err = resilient
        .call("verify", "run", json!({}), CALL)
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(inner.calls_to("verify").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_fails_fast_without_calling_worker() {
    let inner = ScriptedCaller::new();
    inner.always("design", "run", Reply::Return(Err(timeout_error("design"))));
    let (resilient, observer) = caller(&inner, policy(1, 3));

    for _ in 0..3 {
        let err = resilient
            .call("design", "run", json!({}), CALL)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { .. }));
    }
    assert!(resilient.status("design").open);

    let err = resilient
        .call("design", "run", json!({}), CALL)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::CircuitOpen { .. }));
    assert!(!err.is_transient());
    assert_eq!(inner.calls_to("design").len(), 3);
    assert_eq!(
        observer.breakers(),
        vec![("design".to_string(), BreakerTransition::Opened)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_trial_after_cooldown() {
    let inner = ScriptedCaller::new();
    inner
        .push("design", "run", Reply::Return(Err(timeout_error("design"))))
        .push("design", "run", Reply::Hang);
    let (resilient, observer) = caller(&inner, policy(1, 1));
    let resilient = Arc::new(resilient);

    assert!(resilient.call("design", "run", json!({}), CALL).await.is_err());
    assert_eq!(inner.calls_to("design").len(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;

    let trial = tokio::spawn({
        let resilient = Arc::clone(&resilient);
        async move { resilient.call("design", "run", json!({}), CALL).await }
    });
    tokio::task::yield_now().await;
    while inner.calls_to("design").len() < 2 {
        tokio::task::yield_now().await;
    }

    let concurrent = resilient
        .call("design", "run", json!({}), CALL)
        .await
        .unwrap_err();
    assert!(matches!(concurrent, CallError::CircuitOpen { .. }));
    assert_eq!(inner.calls_to("design").len(), 2);

    trial.abort();
    assert!(observer
        .breakers()
        .contains(&("design".to_string(), BreakerTransition::HalfOpen)));
}

#[tokio::test(start_paused = true)]
async fn test_successful_trial_closes_breaker() {
    let inner = ScriptedCaller::new();
    inner
        .push("design", "run", Reply::Return(Err(timeout_error("design"))))
        .push_ok("design", "run", json!("recovered"));
    let (resilient, observer) = caller(&inner, policy(1, 1));

    assert!(resilient.call("design", "run", json!({}), CALL).await.is_err());
    assert!(resilient.status("design").open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let result = resilient
        .call("design", "run", json!({}), CALL)
        .await
        .unwrap();

    assert_eq!(result, json!("recovered"));
    assert!(!resilient.status("design").open);
    assert_eq!(
        observer
            .breakers()
            .into_iter()
            .map(|(_, t)| t)
            .collect::<Vec<_>>(),
        vec![
            BreakerTransition::Opened,
            BreakerTransition::HalfOpen,
            BreakerTransition::Closed
        ]
    );
}

#[tokio::test]
async fn test_breakers_are_per_capability() {
    let inner = ScriptedCaller::new();
    inner
        .always("design", "run", Reply::Return(Err(timeout_error("design"))))
        .always_ok("research", "run", json!("ok"));
    let (resilient, _) = caller(&inner, policy(1, 1));

    assert!(resilient.call("design", "run", json!({}), CALL).await.is_err());
    assert!(resilient.status("design").open);
    assert_eq!(
        resilient.call("research", "run", json!({}), CALL).await.unwrap(),
        json!("ok")
    );
    assert_eq!(resilient.statuses().len(), 2);
}
