//! Integration tests for the run worker and supervisor.

use std::time::Duration;

use async_trait::async_trait;
use mirrord_driver::cli::{ExecutionResult, ProtocolError, Terminate};
use mirrord_driver::supervisor::{
    await_outcome, drive, progress_channel, result_channel, ExecError, ExecutionOutcome,
    ExecutionState, ExecutionStateMachine, Progress, ProgressReceiver, SuppressionId,
    WarningClassifier,
};
use tokio_util::sync::CancellationToken;

/// Stand-in process that only counts terminations.
#[derive(Default)]
struct CountingProcess {
    terminations: usize,
}

#[async_trait]
impl Terminate for CountingProcess {
    async fn terminate(&mut self) -> std::io::Result<()> {
        self.terminations += 1;
        Ok(())
    }
}

fn machine() -> (ExecutionStateMachine, ProgressReceiver) {
    let (tx, rx) = progress_channel();
    (
        ExecutionStateMachine::new(WarningClassifier::with_default_rules(), tx),
        rx,
    )
}

async fn run_lines(input: &'static str) -> (ExecutionState, ExecutionOutcome, Vec<Progress>) {
    run_bytes(input.as_bytes()).await
}

async fn run_bytes(input: &'static [u8]) -> (ExecutionState, ExecutionOutcome, Vec<Progress>) {
    let (machine, mut progress) = machine();
    let (sender, mut receiver) = result_channel();

    let state = drive(input, machine, sender).await;
    let outcome = receiver.wait(Duration::from_secs(1)).await.unwrap();

    let mut updates = Vec::new();
    while let Some(update) = progress.try_recv() {
        updates.push(update);
    }
    (state, outcome, updates)
}

const LAUNCH_SCENARIO: &str = concat!(
    r#"{"type":"NewTask","name":"mirrord preparing to launch","parent":null,"success":null,"message":null}"#,
    "\n",
    r#"{"type":"Warning","name":"mirrord preparing to launch","parent":null,"success":null,"message":"Agent version 3.0.0 does not match the local mirrord version"}"#,
    "\n",
    r#"{"type":"FinishedTask","name":"mirrord preparing to launch","parent":null,"success":true,"message":"{\"environment\":{\"A\":\"1\"},\"patched_path\":null}"}"#,
    "\n",
);

#[tokio::test]
async fn launch_scenario_succeeds_with_classified_warning() {
    let (state, outcome, updates) = run_lines(LAUNCH_SCENARIO).await;

    assert_eq!(state, ExecutionState::Succeeded);
    let expected = ExecutionResult::new([("A".to_string(), "1".to_string())].into(), None);
    assert_eq!(outcome.success(), Some(&expected));

    assert!(updates.contains(&Progress::Warning {
        message: "Agent version 3.0.0 does not match the local mirrord version".to_string(),
        suppression: Some(SuppressionId::AgentVersionMismatch),
    }));
    assert_eq!(
        updates.last(),
        Some(&Progress::Status("mirrord is running".to_string()))
    );
}

#[tokio::test]
async fn status_follows_tasks() {
    let (_, _, updates) = run_lines(concat!(
        r#"{"type":"NewTask","name":"starting agent","parent":"mirrord preparing to launch","message":"pod/api"}"#,
        "\n",
    ))
    .await;

    assert_eq!(
        updates,
        vec![
            Progress::Status("mirrord is starting...".to_string()),
            Progress::Status("starting agent: pod/api".to_string()),
        ]
    );
}

#[tokio::test]
async fn end_of_stream_without_result_is_cancelled() {
    let (state, outcome, _) = run_lines(concat!(
        r#"{"type":"NewTask","name":"mirrord preparing to launch"}"#,
        "\n",
    ))
    .await;

    assert_eq!(state, ExecutionState::Cancelled);
    assert!(matches!(outcome, ExecutionOutcome::Cancelled));
}

#[tokio::test]
async fn failed_completion_does_not_end_the_run() {
    let (state, outcome, _) = run_lines(concat!(
        r#"{"type":"FinishedTask","name":"mirrord preparing to launch","success":false,"message":"retrying"}"#,
        "\n",
    ))
    .await;

    // Only the end of the stream resolves the run.
    assert_eq!(state, ExecutionState::Cancelled);
    assert!(matches!(outcome, ExecutionOutcome::Cancelled));
}

#[tokio::test]
async fn malformed_line_fails_the_run() {
    let (state, outcome, _) = run_lines(concat!(
        r#"{"type":"NewTask","name":"a"}"#,
        "\n",
        "{definitely not json\n",
        r#"{"type":"FinishedTask","name":"mirrord preparing to launch","success":true,"message":"{\"environment\":{}}"}"#,
        "\n",
    ))
    .await;

    assert_eq!(state, ExecutionState::Failed);
    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed(ExecError::Protocol(ProtocolError::Malformed { .. }))
    ));
}

#[tokio::test]
async fn invalid_utf8_line_is_a_protocol_error() {
    let (state, outcome, _) = run_bytes(b"{\"type\":\"NewTask\",\"name\":\"\xff\xfe\"}\n").await;

    assert_eq!(state, ExecutionState::Failed);
    assert_eq!(outcome.state(), ExecutionState::Failed);
    let err = outcome.error().unwrap();
    assert!(matches!(err, ExecError::Protocol(ProtocolError::Malformed { .. })));
    assert_eq!(
        err.hint().as_deref(),
        Some("try updating to the latest version of mirrord")
    );
}

#[tokio::test]
async fn crlf_line_endings_are_accepted() {
    let (state, _, _) = run_bytes(
        b"{\"type\":\"FinishedTask\",\"name\":\"mirrord preparing to launch\",\"success\":true,\"message\":\"{\\\"environment\\\":{}}\"}\r\n",
    )
    .await;
    assert_eq!(state, ExecutionState::Succeeded);
}

#[tokio::test]
async fn completion_without_success_fails_the_run() {
    let (state, outcome, _) = run_lines(concat!(
        r#"{"type":"FinishedTask","name":"mirrord preparing to launch","message":"{\"environment\":{}}"}"#,
        "\n",
    ))
    .await;

    assert_eq!(state, ExecutionState::Failed);
    let err = outcome.error().unwrap();
    assert!(matches!(err, ExecError::Protocol(ProtocolError::Invalid(_))));
    assert_eq!(
        err.hint().as_deref(),
        Some("try updating to the latest version of mirrord")
    );
}

#[tokio::test]
async fn timeout_terminates_once_and_ignores_late_result() {
    let (mut sender, mut receiver) = result_channel();
    let mut process = CountingProcess::default();

    let outcome = await_outcome(&mut receiver, &mut process, Duration::from_millis(20), None).await;

    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed(ExecError::Timeout(_))
    ));
    assert!(outcome.error().is_some_and(ExecError::is_cancellation));
    assert_eq!(process.terminations, 1);

    drop(receiver);
    let late = ExecutionResult::new([("A".to_string(), "1".to_string())].into(), None);
    assert!(!sender.complete(ExecutionOutcome::Success(late)));
    assert!(sender.is_completed());
    assert_eq!(process.terminations, 1);
}

#[tokio::test]
async fn caller_abort_terminates_and_cancels() {
    let (_sender, mut receiver) = result_channel();
    let mut process = CountingProcess::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = await_outcome(
        &mut receiver,
        &mut process,
        Duration::from_secs(10),
        Some(&cancel),
    )
    .await;

    assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    assert_eq!(process.terminations, 1);
}

#[tokio::test]
async fn failure_terminates_the_process() {
    let (mut sender, mut receiver) = result_channel();
    let mut process = CountingProcess::default();
    sender.complete(ExecutionOutcome::Failed(ExecError::NoStdout));

    let outcome = await_outcome(&mut receiver, &mut process, Duration::from_secs(1), None).await;
    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed(ExecError::NoStdout)
    ));
    assert_eq!(process.terminations, 1);
}

#[tokio::test]
async fn dropped_sender_releases_the_waiter() {
    let (sender, mut receiver) = result_channel();
    let mut process = CountingProcess::default();
    drop(sender);

    let outcome = await_outcome(&mut receiver, &mut process, Duration::from_secs(1), None).await;
    assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    assert_eq!(process.terminations, 0);
}

/// The supervisor runs `sh ext ...` in a temp dir holding a script named
/// `ext`, which stands in for the mirrord binary.
#[cfg(unix)]
mod with_fake_binary {
    use std::time::Duration;

    use mirrord_driver::cli::MirrordCommand;
    use mirrord_driver::supervisor::{
        ExecError, ExecSupervisor, ExecutionOutcome, Progress, WarningClassifier,
        IGNORE_DEBUGGER_PORTS_ENV,
    };
    use tempfile::TempDir;

    fn fake_mirrord(script: &str) -> (TempDir, MirrordCommand) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ext"), script).unwrap();
        let command = MirrordCommand::ext().working_dir(dir.path());
        (dir, command)
    }

    fn supervisor() -> ExecSupervisor {
        ExecSupervisor::new("sh")
            .with_timeout(Duration::from_secs(10))
            .with_grace(Duration::from_millis(200))
    }

    const SUCCESS_SCRIPT: &str = r#"[ "$MIRRORD_PROGRESS_MODE" = json ] || exit 3
cat <<'END'
{"type":"NewTask","name":"mirrord preparing to launch","parent":null,"success":null,"message":null}
{"type":"Warning","name":"mirrord preparing to launch","parent":null,"success":null,"message":"Agent version 3.0.0 does not match the local mirrord version"}
{"type":"FinishedTask","name":"mirrord preparing to launch","parent":null,"success":true,"message":"{\"environment\":{\"A\":\"1\"},\"patched_path\":null}"}
END
"#;

    #[tokio::test]
    async fn execute_reports_progress_and_result() {
        let (_dir, command) = fake_mirrord(SUCCESS_SCRIPT);

        let mut updates = Vec::new();
        let outcome = supervisor()
            .execute(&command, |update| updates.push(update.clone()))
            .await;

        let result = outcome.success().expect("run should succeed");
        assert_eq!(result.environment()["A"], "1");
        assert_eq!(
            result.environment()[IGNORE_DEBUGGER_PORTS_ENV],
            "35000-65535"
        );
        assert!(updates.iter().any(|update| matches!(
            update,
            Progress::Warning {
                suppression: Some(_),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn custom_classifier_and_no_debugger_ports() {
        let (_dir, command) = fake_mirrord(SUCCESS_SCRIPT);

        let mut warnings = Vec::new();
        let outcome = supervisor()
            .with_classifier(WarningClassifier::new())
            .with_debugger_ports(None)
            .execute(&command, |update| {
                if let Progress::Warning { suppression, .. } = update {
                    warnings.push(*suppression);
                }
            })
            .await;

        let result = outcome.success().expect("run should succeed");
        assert!(!result.environment().contains_key(IGNORE_DEBUGGER_PORTS_ENV));
        assert_eq!(warnings, vec![None]);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_record() {
        let (_dir, command) = fake_mirrord(
            r#"printf '%s' 'Error: {"message":"failed to connect to the cluster","severity":"Error","causes":[],"help":"check your kubeconfig","labels":[],"related":[]}' >&2
exit 1
"#,
        );

        let outcome = supervisor().execute(&command, |_| {}).await;
        match outcome {
            ExecutionOutcome::Failed(ExecError::Remote(err)) => {
                assert_eq!(err.message, "failed to connect to the cluster");
                assert_eq!(err.help(), Some("check your kubeconfig"));
            }
            other => panic!("Expected remote failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_result_is_cancelled() {
        let (_dir, command) = fake_mirrord("exit 0\n");
        let outcome = supervisor().execute(&command, |_| {}).await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    }

    #[tokio::test]
    async fn silent_binary_times_out() {
        let (_dir, command) = fake_mirrord("sleep 30\n");
        let outcome = supervisor()
            .with_timeout(Duration::from_millis(200))
            .execute(&command, |_| {})
            .await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed(ExecError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn timeout_stops_worker_while_pipe_stays_open() {
        // The background sleep inherits stdout and outlives the killed shell.
        let (_dir, command) = fake_mirrord("sleep 30 &\nsleep 30\n");
        let mut run = supervisor()
            .with_timeout(Duration::from_millis(200))
            .start(&command)
            .unwrap();
        let mut progress = run.take_progress().unwrap();

        let outcome = run.outcome().await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed(ExecError::Timeout(_))
        ));

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while progress.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "worker still holds the progress channel");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_launch() {
        let outcome = ExecSupervisor::new("/nonexistent/bin/mirrord")
            .execute(&MirrordCommand::ext(), |_| {})
            .await;
        let err = outcome.error().expect("launch should fail");
        assert!(matches!(err, ExecError::Launch(_)));
        assert!(err.hint().is_some());
    }
}
