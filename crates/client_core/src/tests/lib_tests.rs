use super::*;
use tokio::{sync::Notify, task::JoinHandle};

use crate::test_support::{
    baseline, credential, invite, message, room, session_request, snapshot, wait_until,
    with_messages, RecordingActions, RecordingHandler, ScriptedSource, StaticAuthenticator, Step,
};

struct Harness {
    client: Arc<SyncClient>,
    source: Arc<ScriptedSource>,
    auth: Arc<StaticAuthenticator>,
    handler: Arc<RecordingHandler>,
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        poll_interval: Duration::from_millis(10),
        ..SyncOptions::default()
    }
}

fn harness_with(
    auth: StaticAuthenticator,
    steps: Vec<Step>,
    handler: RecordingHandler,
    options: SyncOptions,
) -> Harness {
    let source = Arc::new(ScriptedSource::new(steps));
    let auth = Arc::new(auth);
    let handler = Arc::new(handler);
    let client = SyncClient::with_parts(
        auth.clone(),
        source.clone(),
        Arc::new(RecordingActions::default()),
        handler.clone(),
        session_request(),
        options,
    );
    Harness {
        client: Arc::new(client),
        source,
        auth,
        handler,
    }
}

fn harness(steps: Vec<Step>, handler: RecordingHandler) -> Harness {
    harness_with(
        StaticAuthenticator::accepting(),
        steps,
        handler,
        fast_options(),
    )
}

fn spawn_run(client: &Arc<SyncClient>) -> JoinHandle<Result<(), ClientError>> {
    let client = Arc::clone(client);
    tokio::spawn(async move { client.run().await })
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn stop_and_join(h: &Harness, run: JoinHandle<Result<(), ClientError>>) {
    h.client.stop();
    run.await.expect("run task").expect("run result");
    assert_eq!(h.client.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn history_is_suppressed_and_only_new_messages_are_delivered() {
    let h = harness(
        vec![
            Step::Snapshot(baseline()),
            Step::Snapshot(baseline()),
            Step::Snapshot(with_messages(
                &baseline(),
                vec![message("!lobby:hs.test", "$m6", "@alice:hs.test", "six")],
            )),
        ],
        RecordingHandler::default(),
    );
    let mut events = h.client.subscribe_events();
    let run = spawn_run(&h.client);

    wait_until(|| !h.handler.message_ids().is_empty()).await;
    let settled = h.source.fetches() + 3;
    wait_until(|| h.source.fetches() >= settled).await;

    assert_eq!(h.handler.message_ids(), vec!["$m6"]);
    assert!(h.handler.invite_rooms().is_empty());
    wait_until(|| h.handler.ready_calls() == 1).await;
    stop_and_join(&h, run).await;

    let states: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            LifecycleState::Authenticating,
            LifecycleState::Priming,
            LifecycleState::Polling,
            LifecycleState::Stopped,
        ]
    );
}

#[tokio::test]
async fn transport_error_is_skipped_and_next_tick_delivers_everything() {
    let h = harness(
        vec![
            Step::Snapshot(baseline()),
            Step::TransportFailure,
            Step::Snapshot(with_messages(
                &baseline(),
                vec![
                    message("!lobby:hs.test", "$a", "@alice:hs.test", "a"),
                    message("!lobby:hs.test", "$b", "@bob:hs.test", "b"),
                ],
            )),
        ],
        RecordingHandler::default(),
    );
    let mut events = h.client.subscribe_events();
    let run = spawn_run(&h.client);

    wait_until(|| h.handler.message_ids().len() == 2).await;
    assert_eq!(h.handler.message_ids(), vec!["$a", "$b"]);
    stop_and_join(&h, run).await;

    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        ClientEvent::PollFailed {
            phase: LifecycleState::Polling,
            ..
        }
    )));
}

#[tokio::test]
async fn failed_priming_fetch_is_retried_before_ready() {
    let h = harness(
        vec![
            Step::TransportFailure,
            Step::ParseFailure,
            Step::Snapshot(baseline()),
            Step::Snapshot(with_messages(
                &baseline(),
                vec![message("!ops:hs.test", "$m6", "@dave:hs.test", "six")],
            )),
        ],
        RecordingHandler::default(),
    );
    let mut events = h.client.subscribe_events();
    let run = spawn_run(&h.client);

    wait_until(|| !h.handler.message_ids().is_empty()).await;
    assert_eq!(h.handler.message_ids(), vec!["$m6"]);
    wait_until(|| h.handler.ready_calls() == 1).await;
    stop_and_join(&h, run).await;

    let priming_failures = drain(&mut events)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                ClientEvent::PollFailed {
                    phase: LifecycleState::Priming,
                    ..
                }
            )
        })
        .count();
    assert_eq!(priming_failures, 2);
}

#[tokio::test]
async fn malformed_snapshot_while_polling_is_skipped_and_next_tick_delivers() {
    let h = harness(
        vec![
            Step::Snapshot(baseline()),
            Step::ParseFailure,
            Step::Snapshot(with_messages(
                &baseline(),
                vec![
                    message("!lobby:hs.test", "$a", "@alice:hs.test", "a"),
                    message("!lobby:hs.test", "$b", "@bob:hs.test", "b"),
                ],
            )),
        ],
        RecordingHandler::default(),
    );
    let mut events = h.client.subscribe_events();
    let run = spawn_run(&h.client);

    wait_until(|| h.handler.message_ids().len() == 2).await;
    assert_eq!(h.handler.message_ids(), vec!["$a", "$b"]);
    wait_until(|| h.handler.ready_calls() == 1).await;
    stop_and_join(&h, run).await;

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::PollFailed { phase, error } => Some((phase, error)),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, LifecycleState::Polling);
    assert!(failures[0].1.contains("event_id"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_ready_handler_does_not_hold_back_polling() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        vec![
            Step::Snapshot(baseline()),
            Step::Snapshot(with_messages(
                &baseline(),
                vec![message("!lobby:hs.test", "$new", "@alice:hs.test", "new")],
            )),
        ],
        RecordingHandler::default().ready_gated(gate.clone()),
    );
    let run = spawn_run(&h.client);

    wait_until(|| h.handler.message_ids() == vec!["$new"]).await;
    assert_eq!(h.client.state(), LifecycleState::Polling);
    assert_eq!(h.handler.ready_calls(), 0);

    gate.notify_one();
    wait_until(|| h.handler.ready_calls() == 1).await;
    stop_and_join(&h, run).await;
}

#[tokio::test]
async fn rejected_credentials_prevent_any_polling() {
    let h = harness_with(
        StaticAuthenticator::rejecting(),
        vec![Step::Snapshot(baseline())],
        RecordingHandler::default(),
        fast_options(),
    );

    let err = h.client.run().await.expect_err("auth must fail");

    assert!(matches!(err, ClientError::Auth(AuthError::Rejected(_))));
    assert_eq!(h.auth.calls(), 1);
    assert_eq!(h.source.fetches(), 0);
    assert_eq!(h.handler.ready_calls(), 0);
    assert_eq!(h.client.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn pending_invite_is_delivered_once() {
    let h = harness(
        vec![
            Step::Snapshot(snapshot(vec![], vec![])),
            Step::Snapshot(snapshot(vec![], vec![invite("!party:hs.test", "@erin:hs.test")])),
        ],
        RecordingHandler::default(),
    );
    let run = spawn_run(&h.client);

    wait_until(|| !h.handler.invite_rooms().is_empty()).await;
    let settled = h.source.fetches() + 3;
    wait_until(|| h.source.fetches() >= settled).await;

    assert_eq!(h.handler.invite_rooms(), vec!["!party:hs.test"]);
    stop_and_join(&h, run).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_message_handler_does_not_hold_back_invites() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        vec![
            Step::Snapshot(snapshot(vec![], vec![])),
            Step::Snapshot(snapshot(
                vec![room(
                    "!lobby:hs.test",
                    vec![message("!lobby:hs.test", "$slow", "@alice:hs.test", "wait")],
                )],
                vec![invite("!party:hs.test", "@erin:hs.test")],
            )),
        ],
        RecordingHandler::default().gated(gate.clone()),
    );
    let run = spawn_run(&h.client);

    wait_until(|| !h.handler.invite_rooms().is_empty()).await;
    let polled = h.source.fetches() + 2;
    wait_until(|| h.source.fetches() >= polled).await;
    assert!(h.handler.message_ids().is_empty());

    gate.notify_one();
    wait_until(|| h.handler.message_ids() == vec!["$slow"]).await;
    stop_and_join(&h, run).await;
}

#[tokio::test]
async fn failing_handler_does_not_cause_redelivery() {
    let h = harness(
        vec![
            Step::Snapshot(baseline()),
            Step::Snapshot(with_messages(
                &baseline(),
                vec![message("!lobby:hs.test", "$bad", "@alice:hs.test", "x")],
            )),
            Step::Snapshot(with_messages(
                &baseline(),
                vec![
                    message("!lobby:hs.test", "$bad", "@alice:hs.test", "x"),
                    message("!lobby:hs.test", "$good", "@alice:hs.test", "y"),
                ],
            )),
        ],
        RecordingHandler::default().failing_on(&["$bad"]),
    );
    let run = spawn_run(&h.client);

    wait_until(|| h.handler.message_ids().len() == 2).await;
    let settled = h.source.fetches() + 2;
    wait_until(|| h.source.fetches() >= settled).await;

    assert_eq!(h.handler.message_ids(), vec!["$bad", "$good"]);
    stop_and_join(&h, run).await;
}

#[tokio::test]
async fn stop_is_idempotent_and_a_client_runs_once() {
    let h = harness(
        vec![Step::Snapshot(baseline())],
        RecordingHandler::default(),
    );
    let handle = h.client.stop_handle();
    let run = spawn_run(&h.client);

    wait_until(|| h.client.state() == LifecycleState::Polling).await;
    assert!(handle.stop());
    assert!(!handle.stop());
    h.client.stop();
    run.await.expect("run task").expect("run result");

    assert_eq!(h.client.state(), LifecycleState::Stopped);
    assert!(matches!(
        h.client.run().await,
        Err(ClientError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn stop_before_run_skips_authentication() {
    let h = harness(
        vec![Step::Snapshot(baseline())],
        RecordingHandler::default(),
    );

    h.client.stop();
    h.client.run().await.expect("run returns cleanly");

    assert_eq!(h.auth.calls(), 0);
    assert_eq!(h.source.fetches(), 0);
    assert_eq!(h.client.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn stop_interrupts_the_poll_delay() {
    let h = harness_with(
        StaticAuthenticator::accepting(),
        vec![Step::Snapshot(baseline())],
        RecordingHandler::default(),
        SyncOptions {
            poll_interval: Duration::from_secs(3600),
            ..SyncOptions::default()
        },
    );
    let mut state = h.client.watch_state();
    let run = spawn_run(&h.client);

    state
        .wait_for(|state| *state == LifecycleState::Polling)
        .await
        .expect("reaches polling");
    tokio::time::timeout(Duration::from_secs(5), stop_and_join(&h, run))
        .await
        .expect("stop does not wait for the next tick");
    assert_eq!(h.source.fetches(), 1);
}

#[tokio::test]
async fn eviction_is_reported_when_capacity_is_exceeded() {
    let h = harness_with(
        StaticAuthenticator::accepting(),
        vec![Step::Snapshot(baseline())],
        RecordingHandler::default(),
        SyncOptions {
            poll_interval: Duration::from_millis(10),
            seen_capacity: NonZeroUsize::new(2),
            handler_timeout: None,
        },
    );
    let mut events = h.client.subscribe_events();
    let run = spawn_run(&h.client);

    wait_until(|| h.source.fetches() >= 3).await;
    stop_and_join(&h, run).await;

    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::TrackerEvicted { evicted } if *evicted > 0)));
}

#[test]
fn default_options_match_documented_values() {
    let options = SyncOptions::default();
    assert_eq!(options.poll_interval, Duration::from_secs(2));
    assert_eq!(
        options.seen_capacity.map(NonZeroUsize::get),
        Some(DEFAULT_SEEN_CAPACITY)
    );
    assert!(options.handler_timeout.is_none());
}

#[test]
fn credential_debug_redacts_token() {
    let rendered = format!("{:?}", credential());
    assert!(!rendered.contains("secret-token"));
    assert!(rendered.contains("@bot:hs.test"));
}
