use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blockpilot::{
    compile, Block, Command, CommandExecutor, CommandScript, ExecutionEngine, ExecutionSession,
    GraphBuilder, Instruction, Location, RemoteError, RunStatus, Severity,
};

/// Records dispatched commands and can fail or request a stop at a given call.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<Command>>,
    failsafe: Mutex<Vec<bool>>,
    fail_at: Option<usize>,
    stop_after: Option<(usize, Arc<ExecutionSession>)>,
    failsafe_broken: bool,
    location: Option<Location>,
}

impl RecordingExecutor {
    fn calls(&self) -> Vec<Command> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: &Command) -> Result<Option<Location>, RemoteError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(command.clone());
            calls.len()
        };
        if let Some((k, session)) = &self.stop_after {
            if count == *k {
                session.request_stop();
            }
        }
        if self.fail_at == Some(count) {
            return Err(RemoteError::new(format!("boom at {count}")));
        }
        match command {
            Command::WaitForElement { .. } => Ok(self.location),
            _ => Ok(None),
        }
    }

    async fn set_failsafe(&self, enabled: bool) -> Result<(), RemoteError> {
        self.failsafe.lock().unwrap().push(enabled);
        if self.failsafe_broken {
            return Err(RemoteError::new("failsafe unavailable"));
        }
        Ok(())
    }
}

fn clicks(n: i64) -> CommandScript {
    (1..=n)
        .map(|i| Instruction::command(Command::Click { x: i, y: i }))
        .collect()
}

fn engine(executor: RecordingExecutor, session: Arc<ExecutionSession>) -> ExecutionEngine<RecordingExecutor> {
    ExecutionEngine::new(Arc::new(executor), session)
}

#[tokio::test]
async fn test_successful_run_logs_each_step_then_success() {
    let session = Arc::new(ExecutionSession::new());
    let engine = engine(RecordingExecutor::default(), session.clone());

    let report = engine.run(&clicks(4)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.dispatched, 4);
    let log = session.log();
    assert_eq!(log.len(), 5);
    assert_eq!(log.count(Severity::Info), 4);
    assert_eq!(
        log.messages(),
        vec![
            "Click at (1, 1)",
            "Click at (2, 2)",
            "Click at (3, 3)",
            "Click at (4, 4)",
            "Execution completed"
        ]
    );
    assert_eq!(log.last().unwrap().severity, Severity::Success);
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_stop_after_k_dispatches_exactly_k() {
    let session = Arc::new(ExecutionSession::new());
    let executor = RecordingExecutor {
        stop_after: Some((2, session.clone())),
        ..Default::default()
    };
    let engine = engine(executor, session.clone());

    let report = engine.run(&clicks(5)).await.unwrap();

    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(engine.executor().calls().len(), 2);
    let log = session.log();
    assert_eq!(log.count(Severity::Error), 0);
    assert_eq!(log.count(Severity::Success), 0);
    assert!(log.messages().contains(&"Stop requested"));
    assert_eq!(log.last().unwrap().message, "Execution stopped after 2 steps");
}

#[tokio::test]
async fn test_failure_aborts_remaining_steps() {
    let session = Arc::new(ExecutionSession::new());
    let executor = RecordingExecutor {
        fail_at: Some(3),
        ..Default::default()
    };
    let engine = engine(executor, session.clone());

    let err = engine.run(&clicks(6)).await.unwrap_err();

    assert_eq!(err.step, 2);
    assert_eq!(err.action, "click");
    assert_eq!(err.source.message, "boom at 3");
    assert_eq!(engine.executor().calls().len(), 3);

    let log = session.log();
    assert_eq!(log.count(Severity::Info), 3);
    let last = log.last().unwrap();
    assert_eq!(last.severity, Severity::Error);
    assert_eq!(last.message, "Error: boom at 3");
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_repeat_runs_body_n_times() {
    let graph = GraphBuilder::new()
        .top(
            Block::new("r", "repeat_times")
                .with_input("TIMES", "n")
                .with_input("DO", "c"),
        )
        .block(Block::new("n", "math_number").with_number("NUM", 3.0))
        .block(
            Block::new("c", "mouse_click")
                .with_input("X", "x")
                .with_input("Y", "y"),
        )
        .block(Block::new("x", "math_number").with_number("NUM", 1.0))
        .block(Block::new("y", "math_number").with_number("NUM", 2.0))
        .build();
    let script = compile(&graph).unwrap();

    let session = Arc::new(ExecutionSession::new());
    let engine = engine(RecordingExecutor::default(), session.clone());
    let report = engine.run(&script).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        engine.executor().calls(),
        vec![Command::Click { x: 1, y: 2 }; 3]
    );
    // The repeat itself plus three clicks.
    assert_eq!(session.log().count(Severity::Info), 4);
}

#[tokio::test]
async fn test_stop_inside_repeat_aborts_mid_loop() {
    let script = CommandScript::new(vec![
        Instruction::Repeat {
            times: 10,
            body: clicks(1),
        },
        Instruction::command(Command::RefreshBrowser),
    ]);

    let session = Arc::new(ExecutionSession::new());
    let executor = RecordingExecutor {
        stop_after: Some((3, session.clone())),
        ..Default::default()
    };
    let engine = engine(executor, session.clone());

    let report = engine.run(&script).await.unwrap();
    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(engine.executor().calls().len(), 3);
}

#[tokio::test]
async fn test_failsafe_error_is_advisory() {
    let session = Arc::new(ExecutionSession::new());
    let executor = RecordingExecutor {
        failsafe_broken: true,
        ..Default::default()
    };
    let engine = engine(executor, session.clone()).with_failsafe(false);

    let report = engine.run(&clicks(1)).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*engine.executor().failsafe.lock().unwrap(), vec![false]);
    assert_eq!(session.log().count(Severity::Error), 0);
}

#[tokio::test]
async fn test_search_location_is_step_result() {
    let found = Location {
        x: 4.0,
        y: 8.0,
        center_x: 9.0,
        center_y: 12.0,
    };
    let executor = RecordingExecutor {
        location: Some(found),
        ..Default::default()
    };
    let script = CommandScript::new(vec![
        Instruction::command(Command::RefreshBrowser),
        Instruction::command(Command::WaitForElement {
            image: "logo".into(),
            timeout_secs: 30.0,
            confidence_percent: 80.0,
        }),
    ]);

    let engine = engine(executor, Arc::new(ExecutionSession::new()));
    let report = engine.run(&script).await.unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].step, 1);
    assert_eq!(report.last_location(), Some(found));
}

#[tokio::test(start_paused = true)]
async fn test_wait_is_local_and_logged() {
    let script = CommandScript::new(vec![
        Instruction::Wait { seconds: 2.0 },
        Instruction::command(Command::MiddleClick),
    ]);
    let session = Arc::new(ExecutionSession::new());
    let engine = engine(RecordingExecutor::default(), session.clone());

    let started = tokio::time::Instant::now();
    engine.run(&script).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(engine.executor().calls(), vec![Command::MiddleClick]);
    assert_eq!(session.log().messages()[0], "Wait 2s");
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_is_ignored() {
    let session = Arc::new(ExecutionSession::new());
    let engine = Arc::new(engine(RecordingExecutor::default(), session.clone()));

    let long = CommandScript::new(vec![
        Instruction::Wait { seconds: 10.0 },
        Instruction::command(Command::RefreshBrowser),
    ]);
    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(&long).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(session.is_running());

    let second = engine.run(&clicks(3)).await.unwrap();
    assert_eq!(second.status, RunStatus::AlreadyRunning);
    assert_eq!(second.dispatched, 0);

    let first = background.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(engine.executor().calls(), vec![Command::RefreshBrowser]);
}

#[tokio::test]
async fn test_new_run_clears_previous_log() {
    let session = Arc::new(ExecutionSession::new());
    let engine = engine(RecordingExecutor::default(), session.clone());
    engine.run(&clicks(3)).await.unwrap();
    engine.run(&clicks(1)).await.unwrap();
    assert_eq!(session.log().len(), 2);
}
