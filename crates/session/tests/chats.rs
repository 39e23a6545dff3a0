mod support;

use std::sync::Arc;

use parley_api::{AgentId, ChatId, Role};
use parley_mock::MockBackend;
use parley_session::{
    ErrorKind, SendRequest, SessionController, SessionError, SessionSettings, SettingsStore,
};
use support::{AGENT, Harness, MODEL, contents};

#[tokio::test]
async fn chats_are_listed_newest_first() {
    let backend = MockBackend::new();
    let older = backend.seed_chat("Older", None);
    let newer = backend.seed_chat("Newer", None);
    let controller = SessionController::new(Arc::new(backend), SessionSettings::default());

    let chats = controller.refresh_chats().await.expect("list chats");

    assert_eq!(
        chats.iter().map(|chat| chat.id.clone()).collect::<Vec<_>>(),
        vec![newer.id, older.id]
    );
    assert!(controller.active_chat().is_none());
    assert!(controller.render_messages().is_empty());
}

#[tokio::test]
async fn activating_a_chat_loads_its_history() {
    let backend = MockBackend::new();
    let chat = backend.seed_chat("History", Some(AgentId::new(AGENT)));
    backend.seed_message(&chat.id, Role::User, "What is Rust?");
    backend.seed_message(&chat.id, Role::Assistant, "A systems language.");
    let controller = SessionController::new(Arc::new(backend), SessionSettings::default());
    let mut snapshots = controller.subscribe();

    controller
        .set_active_chat(Some(chat.id.clone()))
        .await
        .expect("activate chat");

    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(snapshot.active_chat, Some(chat.id));
    assert_eq!(
        contents(&snapshot),
        vec![("What is Rust?", false), ("A systems language.", false)]
    );
}

#[tokio::test]
async fn new_chat_becomes_active_and_empty() {
    let harness = Harness::new().await;

    let chat = harness
        .controller
        .create_new_chat()
        .await
        .expect("create chat");

    let snapshot = harness.controller.snapshot();
    assert_eq!(snapshot.active_chat, Some(chat.id.clone()));
    assert_eq!(snapshot.chats[0].id, chat.id);
    assert_eq!(snapshot.chats[0].display_title(), "New Chat");
    assert!(snapshot.messages.is_empty());

    let _ticket = harness
        .controller
        .send_message(SendRequest::new("Hi", MODEL).with_agent(AGENT))
        .expect("send in new chat");
    assert_eq!(
        harness.backend.opened_requests()[0].chat_id,
        chat.id
    );
}

#[tokio::test]
async fn refresh_without_active_chat_is_rejected() {
    let harness = Harness::new().await;
    harness
        .controller
        .set_active_chat(None)
        .await
        .expect("clear active chat");

    let error = harness
        .controller
        .refresh_messages()
        .await
        .expect_err("no active chat");

    assert!(matches!(error, SessionError::NoActiveChat { .. }));
    assert!(!harness.controller.stop_stream());
}

#[tokio::test]
async fn refresh_failure_surfaces_as_retryable_error() {
    let harness = Harness::new().await;
    harness.backend.fail_next_refreshes(1);

    let error = harness
        .controller
        .refresh_messages()
        .await
        .expect_err("refresh fails");

    assert_eq!(error.kind(), ErrorKind::PersistenceRefresh);
    assert!(error.is_retryable());
    harness
        .controller
        .refresh_messages()
        .await
        .expect("retry succeeds");
}

#[tokio::test]
async fn deleting_unknown_chat_reports_directory_error() {
    let harness = Harness::new().await;

    let error = harness
        .controller
        .delete_chat(&ChatId::new("chat-missing"))
        .await
        .expect_err("unknown chat");

    assert_eq!(error.kind(), ErrorKind::Backend);
    assert_eq!(harness.controller.chats().len(), 1);
}

#[test]
fn connect_rejects_invalid_base_url() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SettingsStore::new(dir.path().join("settings.json"));
    let mut settings = SessionSettings::default();
    settings.backend.base_url = "not a url".to_string();
    store.update(settings).expect("update settings");

    let error = SessionController::connect(&store)
        .err()
        .expect("invalid url");

    assert!(matches!(error, SessionError::BackendSetup { .. }));
}
