use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use parley_api::{AgentId, ErrorCause, Role};
use parley_mock::{ExchangeDriver, MockBackend};
use parley_session::{
    ConflictReason, ExchangeOutcome, ExchangeTicket, SendRequest, SessionController, SessionError,
    SessionSettings, SessionSnapshot, SettingsStore,
};

const AGENT: &str = "qa-agent";
const MODEL: &str = "qa-model";
const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    /// Defaults to the per-user settings file.
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    StreamedReply,
    StopStream,
    ValidationApprove,
    ValidationConflict,
    RefreshFailure,
    IdleTimeout,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "streamed_reply" => Some(Self::StreamedReply),
            "stop_stream" => Some(Self::StopStream),
            "validation_approve" => Some(Self::ValidationApprove),
            "validation_conflict" => Some(Self::ValidationConflict),
            "refresh_failure" => Some(Self::RefreshFailure),
            "idle_timeout" => Some(Self::IdleTimeout),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::StreamedReply => "streamed_reply",
            Self::StopStream => "stop_stream",
            Self::ValidationApprove => "validation_approve",
            Self::ValidationConflict => "validation_conflict",
            Self::RefreshFailure => "refresh_failure",
            Self::IdleTimeout => "idle_timeout",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("session operation failed: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("mock backend never opened an exchange"))]
    ExchangeMissing { stage: &'static str },
    #[snafu(display("timed out waiting for {what}"))]
    WaitTimeout {
        stage: &'static str,
        what: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let store = match args.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    println!("settings_path={}", store.config_path().display());

    match args.scenario {
        Scenario::StreamedReply => run_streamed_reply(&store).await,
        Scenario::StopStream => run_stop_stream(&store).await,
        Scenario::ValidationApprove => run_validation_approve(&store).await,
        Scenario::ValidationConflict => run_validation_conflict(&store).await,
        Scenario::RefreshFailure => run_refresh_failure(&store).await,
        Scenario::IdleTimeout => run_idle_timeout(&store).await,
        Scenario::All => run_all(&store).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut config = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        config,
    })
}

struct Fixture {
    backend: MockBackend,
    controller: SessionController,
}

/// Controller that follows the loaded settings file.
async fn fixture(store: &SettingsStore, stage: &'static str) -> RunnerResult<Fixture> {
    let backend = MockBackend::new();
    let controller = SessionController::with_settings_store(Arc::new(backend.clone()), store);
    activate(backend, controller, stage).await
}

/// Controller pinned to `settings`, for scenarios that need a shorter window than the file.
async fn pinned_fixture(settings: SessionSettings, stage: &'static str) -> RunnerResult<Fixture> {
    let backend = MockBackend::new();
    let controller = SessionController::new(Arc::new(backend.clone()), settings);
    activate(backend, controller, stage).await
}

async fn activate(
    backend: MockBackend,
    controller: SessionController,
    stage: &'static str,
) -> RunnerResult<Fixture> {
    let chat = backend.seed_chat("QA", Some(AgentId::new(AGENT)));
    controller.refresh_chats().await.context(SessionSnafu { stage })?;
    controller
        .set_active_chat(Some(chat.id))
        .await
        .context(SessionSnafu { stage })?;
    Ok(Fixture {
        backend,
        controller,
    })
}

async fn open_exchange(
    fixture: &Fixture,
    content: &str,
    stage: &'static str,
) -> RunnerResult<(ExchangeTicket, ExchangeDriver)> {
    let ticket = fixture
        .controller
        .send_message(SendRequest::new(content, MODEL))
        .context(SessionSnafu { stage })?;
    let driver = tokio::time::timeout(WAIT_LIMIT, fixture.backend.next_exchange())
        .await
        .ok()
        .flatten()
        .context(ExchangeMissingSnafu { stage })?;
    Ok((ticket, driver))
}

async fn wait_for(
    controller: &SessionController,
    what: &'static str,
    stage: &'static str,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> RunnerResult<SessionSnapshot> {
    let mut snapshots = controller.subscribe();
    let waited = tokio::time::timeout(WAIT_LIMIT, snapshots.wait_for(predicate)).await;
    match waited {
        Ok(Ok(snapshot)) => Ok(snapshot.clone()),
        _ => WaitTimeoutSnafu { stage, what }.fail(),
    }
}

async fn finish(ticket: ExchangeTicket, stage: &'static str) -> RunnerResult<ExchangeOutcome> {
    match tokio::time::timeout(WAIT_LIMIT, ticket.finished()).await {
        Ok(result) => result.context(SessionSnafu { stage }),
        Err(_) => WaitTimeoutSnafu {
            stage,
            what: "exchange outcome",
        }
        .fail(),
    }
}

fn check(scenario: &'static str, stage: &'static str, ok: bool, reason: &str) -> RunnerResult<()> {
    if ok {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}

async fn run_streamed_reply(store: &SettingsStore) -> RunnerResult<()> {
    let fixture = fixture(store, "scenario-streamed-reply-setup").await?;
    let (ticket, mut driver) =
        open_exchange(&fixture, "Hello", "scenario-streamed-reply-send").await?;

    let optimistic = fixture
        .controller
        .render_messages()
        .iter()
        .any(|message| message.is_temporary() && message.content == "Hello");
    println!("optimistic_visible={optimistic}");

    driver.token("Hi");
    driver.token(" there");
    driver.done();
    let outcome = finish(ticket, "scenario-streamed-reply-finish").await?;
    let completed = matches!(
        &outcome,
        ExchangeOutcome::Completed { text, durable_refreshed: true, .. } if text == "Hi there"
    );
    println!("completed={completed}");

    let messages = fixture.controller.render_messages();
    let durable = messages.len() == 2 && messages.iter().all(|message| !message.is_temporary());
    println!("durable_history={durable}");

    check(
        "streamed_reply",
        "scenario-streamed-reply-verify",
        optimistic && completed && durable,
        "streamed reply did not reconcile into durable history",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_stop_stream(store: &SettingsStore) -> RunnerResult<()> {
    let fixture = fixture(store, "scenario-stop-stream-setup").await?;
    let (ticket, mut driver) =
        open_exchange(&fixture, "Hello", "scenario-stop-stream-send").await?;
    driver.token("Partial");
    wait_for(
        &fixture.controller,
        "partial text",
        "scenario-stop-stream-partial",
        |snapshot| snapshot.stream.as_ref().is_some_and(|view| view.text == "Partial"),
    )
    .await?;

    let stopped = fixture.controller.stop_stream();
    let stopped_again = fixture.controller.stop_stream();
    println!("stopped={stopped}");
    println!("stop_idempotent={}", !stopped_again);

    let cancelled = matches!(
        finish(ticket, "scenario-stop-stream-finish").await?,
        ExchangeOutcome::Cancelled
    );
    println!("cancelled={cancelled}");

    tokio::time::timeout(WAIT_LIMIT, driver.wait_released())
        .await
        .ok()
        .context(WaitTimeoutSnafu {
            stage: "scenario-stop-stream-release",
            what: "exchange release",
        })?;
    let snapshot = wait_for(
        &fixture.controller,
        "post-cancel refresh",
        "scenario-stop-stream-refresh",
        |snapshot| !snapshot.messages.is_empty(),
    )
    .await?;
    let partial_discarded = snapshot
        .messages
        .iter()
        .all(|message| message.role == Role::User && !message.is_temporary());
    println!("partial_discarded={partial_discarded}");

    check(
        "stop_stream",
        "scenario-stop-stream-verify",
        stopped && !stopped_again && cancelled && partial_discarded,
        "stop did not cancel the exchange cleanly",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_validation_approve(store: &SettingsStore) -> RunnerResult<()> {
    let fixture = fixture(store, "scenario-validation-approve-setup").await?;
    let (ticket, mut driver) =
        open_exchange(&fixture, "List files", "scenario-validation-approve-send").await?;
    driver.token("Checking");
    let validation_id = driver.request_validation("shell", json!({"cmd": "ls"}));
    driver.token(" done");

    let snapshot = wait_for(
        &fixture.controller,
        "pending validation",
        "scenario-validation-approve-pending",
        |snapshot| snapshot.pending_validation().is_some(),
    )
    .await?;
    let held_while_paused = snapshot
        .stream
        .as_ref()
        .is_some_and(|view| view.paused && view.text == "Checking");
    println!("held_while_paused={held_while_paused}");

    let outcome = fixture
        .controller
        .approve(&validation_id, false)
        .await
        .context(SessionSnafu {
            stage: "scenario-validation-approve-resolve",
        })?;
    println!("stream_active={}", outcome.stream_active);

    wait_for(
        &fixture.controller,
        "released tokens",
        "scenario-validation-approve-resume",
        |snapshot| {
            snapshot
                .stream
                .as_ref()
                .is_some_and(|view| view.text == "Checking done")
        },
    )
    .await?;
    driver.done();
    let completed = matches!(
        finish(ticket, "scenario-validation-approve-finish").await?,
        ExchangeOutcome::Completed { ref text, .. } if text == "Checking done"
    );
    println!("completed={completed}");

    check(
        "validation_approve",
        "scenario-validation-approve-verify",
        held_while_paused && outcome.stream_active && completed,
        "approval did not resume the paused exchange",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_validation_conflict(store: &SettingsStore) -> RunnerResult<()> {
    let fixture = fixture(store, "scenario-validation-conflict-setup").await?;
    let (_ticket, driver) =
        open_exchange(&fixture, "Write a file", "scenario-validation-conflict-send").await?;
    let validation_id = driver.request_validation("write_file", json!({"path": "notes.md"}));
    wait_for(
        &fixture.controller,
        "pending validation",
        "scenario-validation-conflict-pending",
        |snapshot| snapshot.pending_validation().is_some(),
    )
    .await?;
    fixture
        .backend
        .set_validation_latency(Duration::from_millis(20));

    let (approved, rejected) = tokio::join!(
        fixture.controller.approve(&validation_id, false),
        fixture.controller.reject(&validation_id, None),
    );
    let conflict = matches!(
        rejected
            .as_ref()
            .err()
            .and_then(SessionError::conflict_reason),
        Some(ConflictReason::AlreadyResolved { .. })
    );
    let service_calls = fixture.backend.validation_calls().len();
    println!("first_accepted={}", approved.is_ok());
    println!("second_conflict={conflict}");
    println!("service_calls={service_calls}");

    check(
        "validation_conflict",
        "scenario-validation-conflict-verify",
        approved.is_ok() && conflict && service_calls == 1,
        "concurrent resolutions were not serialized",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_refresh_failure(store: &SettingsStore) -> RunnerResult<()> {
    let fixture = fixture(store, "scenario-refresh-failure-setup").await?;
    let (ticket, mut driver) =
        open_exchange(&fixture, "Hello", "scenario-refresh-failure-send").await?;
    driver.token("Hi");
    fixture.backend.fail_next_refreshes(1);
    driver.done();

    let provisional = matches!(
        finish(ticket, "scenario-refresh-failure-finish").await?,
        ExchangeOutcome::Completed {
            durable_refreshed: false,
            ..
        }
    );
    let temporary_turns = fixture
        .controller
        .render_messages()
        .iter()
        .filter(|message| message.is_temporary())
        .count();
    println!("provisional={provisional}");
    println!("temporary_turns={temporary_turns}");

    fixture
        .controller
        .refresh_messages()
        .await
        .context(SessionSnafu {
            stage: "scenario-refresh-failure-retry",
        })?;
    let recovered = fixture
        .controller
        .render_messages()
        .iter()
        .all(|message| !message.is_temporary());
    println!("recovered={recovered}");

    check(
        "refresh_failure",
        "scenario-refresh-failure-verify",
        provisional && temporary_turns == 2 && recovered,
        "provisional turns were not replaced by the retried refresh",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_idle_timeout(store: &SettingsStore) -> RunnerResult<()> {
    let settings =
        SessionSettings::clone(&store.settings()).with_idle_timeout(Duration::from_millis(100));
    let fixture = pinned_fixture(settings, "scenario-idle-timeout-setup").await?;
    let (ticket, _driver) = open_exchange(&fixture, "Hello", "scenario-idle-timeout-send").await?;

    let timed_out = match tokio::time::timeout(WAIT_LIMIT, ticket.finished()).await {
        Ok(Err(SessionError::StreamTransport { cause, .. })) => cause == ErrorCause::IdleTimeout,
        _ => false,
    };
    let released = !fixture.controller.is_sending();
    println!("idle_timeout={timed_out}");
    println!("released={released}");

    check(
        "idle_timeout",
        "scenario-idle-timeout-verify",
        timed_out && released,
        "silent exchange was not failed after the idle window",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_all(store: &SettingsStore) -> RunnerResult<()> {
    run_streamed_reply(store).await?;
    run_stop_stream(store).await?;
    run_validation_approve(store).await?;
    run_validation_conflict(store).await?;
    run_refresh_failure(store).await?;
    run_idle_timeout(store).await?;

    println!("all_passed=true");
    Ok(())
}
