//! Cooperative execution engine
//!
//! Runs a [`CommandScript`] one instruction at a time. Cancellation is polled
//! before every instruction and before every loop pass; a call already sent
//! to the remote side always finishes before the flag is looked at again.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::client::CommandExecutor;
use crate::errors::EngineError;
use crate::instruction::{CommandScript, Instruction, Location};

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// One user-visible line of the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
        }
    }
}

/// Append-only record of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }

    pub fn messages(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.message.as_str()).collect()
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

/// Shared run state: the running flag, the stop token and the log.
///
/// Only [`start`](Self::start) and [`request_stop`](Self::request_stop)
/// change the flags. Each engine holds its own session, so tests never share
/// state.
#[derive(Debug)]
pub struct ExecutionSession {
    running: AtomicBool,
    stop: Mutex<CancellationToken>,
    log: Mutex<ExecutionLog>,
    events: broadcast::Sender<LogEntry>,
}

impl Default for ExecutionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionSession {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            running: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            log: Mutex::new(ExecutionLog::default()),
            events,
        }
    }

    /// Begins a session: clears the log and arms a fresh stop token.
    ///
    /// Returns `None` when a session is already running; the running one is
    /// left untouched.
    pub fn start(&self) -> Option<CancellationToken> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let token = CancellationToken::new();
        *lock(&self.stop) = token.clone();
        *lock(&self.log) = ExecutionLog::default();
        Some(token)
    }

    /// Asks the running session to stop at the next instruction boundary.
    ///
    /// Returns `false` if nothing is running.
    pub fn request_stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let token = lock(&self.stop).clone();
        if !token.is_cancelled() {
            token.cancel();
            self.append(Severity::Info, "Stop requested");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_stop_requested(&self) -> bool {
        lock(&self.stop).is_cancelled()
    }

    /// Snapshot of the current log.
    pub fn log(&self) -> ExecutionLog {
        lock(&self.log).clone()
    }

    /// Live feed of entries as they are appended.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe()
    }

    pub(crate) fn append(&self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry::new(severity, message);
        match severity {
            Severity::Info | Severity::Success => info!("{}", entry.message),
            Severity::Error => error!("{}", entry.message),
        }
        lock(&self.log).push(entry.clone());
        // No subscribers is fine.
        let _ = self.events.send(entry);
    }

    fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the running flag however the run ends, including when the run
/// future is dropped mid-flight.
struct RunningGuard<'a>(&'a ExecutionSession);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Stopped,
    /// Another session was already running; nothing was dispatched.
    AlreadyRunning,
}

/// Located coordinate produced by an image-search step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub dispatched: usize,
    pub results: Vec<StepResult>,
}

impl RunReport {
    /// Result of the most recent image-search step, if any.
    pub fn last_location(&self) -> Option<Location> {
        self.results.last().map(|r| r.location)
    }
}

enum Flow {
    Finished,
    Stopped,
}

struct RunState {
    token: CancellationToken,
    dispatched: usize,
    results: Vec<StepResult>,
}

pub struct ExecutionEngine<E> {
    executor: Arc<E>,
    session: Arc<ExecutionSession>,
    failsafe: bool,
}

impl<E: CommandExecutor> ExecutionEngine<E> {
    pub fn new(executor: Arc<E>, session: Arc<ExecutionSession>) -> Self {
        Self {
            executor,
            session,
            failsafe: true,
        }
    }

    /// Failsafe setting pushed to the remote side before each run.
    pub fn with_failsafe(mut self, enabled: bool) -> Self {
        self.failsafe = enabled;
        self
    }

    pub fn session(&self) -> &Arc<ExecutionSession> {
        &self.session
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Runs `script` to completion, to a stop request, or to the first failure.
    #[instrument(skip_all, fields(instructions = script.len(), failsafe = self.failsafe))]
    pub async fn run(&self, script: &CommandScript) -> Result<RunReport, EngineError> {
        let Some(token) = self.session.start() else {
            warn!("Execution already in progress, ignoring start request");
            return Ok(RunReport {
                status: RunStatus::AlreadyRunning,
                dispatched: 0,
                results: Vec::new(),
            });
        };
        let _running = RunningGuard(&self.session);

        if let Err(e) = self.executor.set_failsafe(self.failsafe).await {
            warn!("Failed to set failsafe: {}", e);
        }

        let mut state = RunState {
            token,
            dispatched: 0,
            results: Vec::new(),
        };

        let status = match self.run_script(script, &mut state).await {
            Ok(Flow::Finished) => {
                self.session.append(Severity::Success, "Execution completed");
                RunStatus::Completed
            }
            Ok(Flow::Stopped) => {
                self.session.append(
                    Severity::Info,
                    format!("Execution stopped after {} steps", state.dispatched),
                );
                RunStatus::Stopped
            }
            Err(e) => {
                self.session
                    .append(Severity::Error, format!("Error: {}", e.source));
                return Err(e);
            }
        };

        Ok(RunReport {
            status,
            dispatched: state.dispatched,
            results: state.results,
        })
    }

    fn run_script<'a>(
        &'a self,
        script: &'a CommandScript,
        state: &'a mut RunState,
    ) -> Pin<Box<dyn Future<Output = Result<Flow, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            for instruction in script {
                if state.token.is_cancelled() {
                    return Ok(Flow::Stopped);
                }
                let step = state.dispatched;
                state.dispatched += 1;
                self.session.append(Severity::Info, instruction.to_string());

                match instruction {
                    Instruction::Command { command } => {
                        match self.executor.execute(command).await {
                            Ok(Some(location)) => {
                                info!(
                                    "Step {} found image at ({}, {})",
                                    step, location.x, location.y
                                );
                                state.results.push(StepResult { step, location });
                            }
                            Ok(None) => {}
                            Err(source) => {
                                return Err(EngineError {
                                    step,
                                    action: command.label().to_string(),
                                    source,
                                })
                            }
                        }
                    }
                    Instruction::Wait { seconds } => {
                        let pause = Duration::try_from_secs_f64(*seconds).unwrap_or(Duration::ZERO);
                        tokio::time::sleep(pause).await;
                    }
                    Instruction::Repeat { times, body } => {
                        for _ in 0..*times {
                            if state.token.is_cancelled() {
                                return Ok(Flow::Stopped);
                            }
                            if let Flow::Stopped = self.run_script(body, state).await? {
                                return Ok(Flow::Stopped);
                            }
                        }
                    }
                }
            }
            Ok(Flow::Finished)
        })
    }
}
