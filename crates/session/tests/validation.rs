mod support;

use std::time::Duration;

use parley_api::{ValidationId, ValidationOutcome};
use parley_mock::{ExchangeDriver, ValidationCall};
use parley_session::{
    ConflictReason, ExchangeOutcome, ExchangeTicket, NotificationKind, SendRequest, SessionError,
    SessionSettings, SessionSnapshot,
};
use serde_json::json;
use support::{Harness, MODEL, contents, eventually, stream_text};

fn pending_id(snapshot: &SessionSnapshot) -> Option<&ValidationId> {
    snapshot.pending_validation().map(|request| &request.id)
}

fn conflict(error: &SessionError) -> &ConflictReason {
    error.conflict_reason().expect("validation conflict")
}

/// Opens an exchange that is paused on a `shell` validation.
async fn paused_exchange(harness: &Harness) -> (ExchangeTicket, ExchangeDriver, ValidationId) {
    let ticket = harness
        .controller
        .send_message(SendRequest::new("List the files", MODEL))
        .expect("send starts");
    let mut driver = harness.backend.next_exchange().await.expect("exchange opened");
    driver.token("Checking");
    let validation_id = driver.request_validation("shell", json!({"cmd": "ls"}));
    harness
        .wait_for(|s| pending_id(s) == Some(&validation_id))
        .await;
    (ticket, driver, validation_id)
}

#[tokio::test]
async fn approval_resumes_paused_exchange() {
    let harness = Harness::new().await;
    let (ticket, mut driver, validation_id) = paused_exchange(&harness).await;
    driver.token(" output");

    let snapshot = harness.controller.snapshot();
    let stream = snapshot.stream.as_ref().expect("stream in flight");
    assert!(stream.paused);
    assert!(!stream.resolving);
    assert_eq!(stream.text, "Checking");

    let outcome = harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect("approval accepted");
    assert_eq!(outcome, ValidationOutcome { stream_active: true });
    assert_eq!(
        harness.backend.validation_calls(),
        vec![ValidationCall::Approve {
            validation_id: validation_id.clone(),
            always_allow: false,
        }]
    );

    let snapshot = harness
        .wait_for(|s| stream_text(s) == Some("Checking output"))
        .await;
    assert!(snapshot.pending_validation().is_none());

    driver.done();
    match ticket.finished().await.expect("exchange completes") {
        ExchangeOutcome::Completed { text, .. } => assert_eq!(text, "Checking output"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn rejection_resumes_and_completes_without_duplicate_turns() {
    let harness = Harness::new().await;
    let ticket = harness
        .controller
        .send_message(SendRequest::new("Find the docs", MODEL))
        .expect("send starts");
    let mut driver = harness.backend.next_exchange().await.expect("exchange opened");
    let validation_id = driver.request_validation("search", json!({"query": "docs"}));
    harness
        .wait_for(|s| pending_id(s) == Some(&validation_id))
        .await;

    harness
        .controller
        .reject(&validation_id, Some("not needed".to_string()))
        .await
        .expect("rejection accepted");
    assert_eq!(
        harness.backend.validation_calls(),
        vec![ValidationCall::Reject {
            validation_id: validation_id.clone(),
            reason: Some("not needed".to_string()),
        }]
    );
    let snapshot = harness.controller.snapshot();
    assert!(snapshot.pending_validation().is_none());
    assert!(!snapshot.stream.expect("stream in flight").paused);

    driver.token("Answering from memory.");
    harness
        .wait_for(|s| stream_text(s) == Some("Answering from memory."))
        .await;
    driver.done();
    ticket.finished().await.expect("exchange completes");

    assert_eq!(
        contents(&harness.controller.snapshot()),
        vec![("Find the docs", false), ("Answering from memory.", false)]
    );
}

#[tokio::test]
async fn feedback_reaches_the_service_and_resumes_the_exchange() {
    let harness = Harness::new().await;
    let (ticket, mut driver, validation_id) = paused_exchange(&harness).await;
    driver.token(" in src");

    let outcome = harness
        .controller
        .feedback(&validation_id, "only list the src directory")
        .await
        .expect("feedback accepted");

    assert_eq!(outcome, ValidationOutcome { stream_active: true });
    assert_eq!(
        harness.backend.validation_calls(),
        vec![ValidationCall::Feedback {
            validation_id: validation_id.clone(),
            text: "only list the src directory".to_string(),
        }]
    );
    let snapshot = harness
        .wait_for(|s| stream_text(s) == Some("Checking in src"))
        .await;
    let stream = snapshot.stream.as_ref().expect("stream in flight");
    assert!(!stream.paused);
    assert!(!stream.resolving);
    assert!(stream.pending_validation.is_none());
    assert_eq!(stream.queued_validations, 0);

    driver.token(": main.rs");
    harness
        .wait_for(|s| stream_text(s) == Some("Checking in src: main.rs"))
        .await;
    driver.done();
    match ticket.finished().await.expect("exchange completes") {
        ExchangeOutcome::Completed { text, .. } => assert_eq!(text, "Checking in src: main.rs"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn resolving_twice_is_a_conflict() {
    let harness = Harness::new().await;
    let (_ticket, _driver, validation_id) = paused_exchange(&harness).await;

    harness
        .controller
        .reject(&validation_id, Some("not now".to_string()))
        .await
        .expect("rejection accepted");
    let error = harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect_err("already resolved");

    assert_eq!(
        conflict(&error),
        &ConflictReason::AlreadyResolved {
            validation_id: validation_id.clone(),
        }
    );
    assert_eq!(harness.backend.validation_calls().len(), 1);
}

#[tokio::test]
async fn unknown_validation_is_not_pending() {
    let harness = Harness::new().await;
    let (_ticket, _driver, _validation_id) = paused_exchange(&harness).await;
    let unknown = ValidationId::new("val-unknown");

    let error = harness
        .controller
        .feedback(&unknown, "use ls -la")
        .await
        .expect_err("unknown validation");

    assert_eq!(
        conflict(&error),
        &ConflictReason::NotPending {
            validation_id: unknown,
        }
    );
    assert!(harness.backend.validation_calls().is_empty());
}

#[tokio::test]
async fn concurrent_resolutions_reach_the_service_once() {
    let harness = Harness::new().await;
    let (_ticket, _driver, validation_id) = paused_exchange(&harness).await;
    harness
        .backend
        .set_validation_latency(Duration::from_millis(20));

    let (approved, rejected) = tokio::join!(
        harness.controller.approve(&validation_id, false),
        harness.controller.reject(&validation_id, None),
    );

    assert!(approved.is_ok());
    let error = rejected.expect_err("second resolution conflicts");
    assert!(matches!(
        conflict(&error),
        ConflictReason::AlreadyResolved { .. }
    ));
    assert_eq!(harness.backend.validation_calls().len(), 1);
}

#[tokio::test]
async fn service_failure_releases_the_claim() {
    let harness = Harness::new().await;
    let mut notifications = harness.controller.notifications();
    let (_ticket, _driver, validation_id) = paused_exchange(&harness).await;
    harness.backend.fail_next_validation("policy service down");

    let error = harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect_err("service fails");

    assert!(matches!(error, SessionError::ValidationService { .. }));
    let snapshot = harness.controller.snapshot();
    let stream = snapshot.stream.as_ref().expect("stream in flight");
    assert_eq!(pending_id(&snapshot), Some(&validation_id));
    assert!(!stream.resolving);
    assert!(stream.paused);
    assert_eq!(
        notifications.recv().await.expect("notification").kind,
        NotificationKind::ValidationFailed
    );

    harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect("retry succeeds");
}

#[tokio::test]
async fn inactive_stream_after_resolution_completes_exchange() {
    let harness = Harness::new().await;
    harness.backend.set_stream_active_after_validation(false);
    let (ticket, mut driver, validation_id) = paused_exchange(&harness).await;

    let outcome = harness
        .controller
        .reject(&validation_id, Some("too risky".to_string()))
        .await
        .expect("rejection accepted");

    assert!(!outcome.stream_active);
    match ticket.finished().await.expect("exchange completes") {
        ExchangeOutcome::Completed { text, .. } => assert_eq!(text, "Checking"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    driver.wait_released().await;
    assert!(!harness.controller.is_sending());
}

#[tokio::test]
async fn remote_resolution_clears_pending_request() {
    let harness = Harness::new().await;
    let (_ticket, driver, validation_id) = paused_exchange(&harness).await;

    driver.resolve_validation(&validation_id);
    let snapshot = harness
        .wait_for(|s| s.is_sending && s.pending_validation().is_none())
        .await;
    assert!(!snapshot.stream.expect("stream in flight").paused);

    let error = harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect_err("already resolved remotely");
    assert!(matches!(
        conflict(&error),
        ConflictReason::AlreadyResolved { .. }
    ));
}

#[tokio::test]
async fn queued_requests_surface_one_at_a_time() {
    let harness = Harness::new().await;
    let (_ticket, driver, first) = paused_exchange(&harness).await;
    let second = driver.request_validation("write_file", json!({"path": "notes.md"}));
    harness
        .wait_for(|s| s.stream.as_ref().is_some_and(|stream| stream.queued_validations == 1))
        .await;

    let error = harness
        .controller
        .approve(&second, false)
        .await
        .expect_err("queued request is not pending yet");
    assert!(matches!(conflict(&error), ConflictReason::NotPending { .. }));

    harness
        .controller
        .approve(&first, false)
        .await
        .expect("first approval");
    assert_eq!(pending_id(&harness.controller.snapshot()), Some(&second));
}

#[tokio::test]
async fn always_allow_auto_approves_the_same_tool() {
    let harness = Harness::new().await;
    let (_ticket, driver, first) = paused_exchange(&harness).await;

    harness
        .controller
        .approve(&first, true)
        .await
        .expect("standing approval");
    let second = driver.request_validation("shell", json!({"cmd": "pwd"}));

    eventually(|| harness.backend.validation_calls().len() == 2).await;
    assert_eq!(
        harness.backend.validation_calls()[1],
        ValidationCall::Approve {
            validation_id: second,
            always_allow: false,
        }
    );
    let snapshot = harness
        .wait_for(|s| s.is_sending && s.pending_validation().is_none())
        .await;
    assert!(!snapshot.stream.expect("stream in flight").paused);
}

#[tokio::test]
async fn standing_permission_is_ignored_when_auto_approve_is_off() {
    let settings = SessionSettings {
        auto_approve_standing: false,
        ..SessionSettings::default()
    };
    let harness = Harness::with_settings(settings).await;
    let (_ticket, driver, first) = paused_exchange(&harness).await;
    harness
        .controller
        .approve(&first, true)
        .await
        .expect("standing approval");

    let second = driver.request_validation("shell", json!({"cmd": "pwd"}));
    harness
        .wait_for(|s| pending_id(s) == Some(&second))
        .await;

    assert_eq!(harness.backend.validation_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_window_is_suspended_while_waiting_on_the_user() {
    let settings = SessionSettings::default().with_idle_timeout(Duration::from_secs(1));
    let harness = Harness::with_settings(settings).await;
    let ticket = harness
        .controller
        .send_message(SendRequest::new("List the files", MODEL))
        .expect("send starts");
    let mut driver = harness.backend.next_exchange().await.expect("exchange opened");
    let validation_id = driver.request_validation("shell", json!({"cmd": "ls"}));

    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = harness.controller.snapshot();
    assert!(snapshot.is_sending);
    assert_eq!(pending_id(&snapshot), Some(&validation_id));

    harness
        .controller
        .approve(&validation_id, false)
        .await
        .expect("approval accepted");
    driver.token("done");
    driver.done();
    assert!(matches!(
        ticket.finished().await.expect("exchange completes"),
        ExchangeOutcome::Completed { .. }
    ));
}
