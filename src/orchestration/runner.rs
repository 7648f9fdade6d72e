//! Agent process runner.
//!
//! `AgentRunner` spawns the configured agent command once per iteration inside
//! a task workspace, captures its transcript and turns the result into a
//! [`Signal`]. Each run is bounded by a wall-clock timeout and can be cancelled
//! through a [`CancellationToken`]; both escalate from a graceful terminate to
//! a hard kill after a grace period.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::task::Task;
use crate::error::AgentProcessError;
use crate::orchestration::signal::{self, Signal};
use crate::util::tail_chars;
use crate::workspace::Workspace;
use crate::{llog, llog_debug, llog_trace, llog_warn};

/// Reason reported when an iteration hits its wall-clock limit.
pub const TIMEOUT_REASON: &str = "timeout";

/// Reason reported when the agent dies without emitting a signal.
pub const TERMINATED_REASON: &str = "agent_terminated_unexpectedly";

/// How long to wait for output readers after the process is gone.
const READER_DRAIN: Duration = Duration::from_secs(2);

const STDERR_TAIL_CHARS: usize = 2048;

/// Why the runner killed a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Cancelled,
}

/// Lifecycle of one agent process.
///
/// Transitions only move forward: `NotStarted -> Running -> Exited | Killed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: Option<u32> },
    /// Exit code, `None` when the process was ended by a signal we did not send.
    Exited(Option<i32>),
    Killed(KillReason),
}

impl ProcessState {
    fn rank(&self) -> u8 {
        match self {
            ProcessState::NotStarted => 0,
            ProcessState::Running { .. } => 1,
            ProcessState::Exited(_) | ProcessState::Killed(_) => 2,
        }
    }

    /// Move to `next` if it is a later state. Returns false and stays put
    /// otherwise.
    pub fn advance(&mut self, next: ProcessState) -> bool {
        if next.rank() <= self.rank() {
            llog_debug!("Ignoring process state change {:?} -> {:?}", self, next);
            return false;
        }
        *self = next;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// True for a clean `exit 0`.
    pub fn success(&self) -> bool {
        matches!(self, ProcessState::Exited(Some(0)))
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self, ProcessState::Killed(KillReason::Cancelled))
    }
}

impl From<ExitStatus> for ProcessState {
    fn from(status: ExitStatus) -> Self {
        ProcessState::Exited(status.code())
    }
}

/// Everything one iteration produced.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub transcript: String,
    pub signal: Signal,
    pub exit_status: ProcessState,
    pub stderr_tail: String,
    pub duration: Duration,
}

/// Spawns and supervises agent processes.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    program: String,
    args: Vec<String>,
    project_root: PathBuf,
    kill_grace: Duration,
}

impl AgentRunner {
    /// Create a runner from a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns [`AgentProcessError::EmptyCommand`] if `command` has no words.
    pub fn new(
        command: &str,
        project_root: &Path,
        kill_grace: Duration,
    ) -> Result<Self, AgentProcessError> {
        let mut words = command.split_whitespace().map(String::from);
        let program = words.next().ok_or(AgentProcessError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
            project_root: project_root.to_path_buf(),
            kill_grace,
        })
    }

    pub fn from_config(config: &Config, project_root: &Path) -> Result<Self, AgentProcessError> {
        Self::new(config.effective_command(), project_root, config.kill_grace())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for a prompt, program first.
    pub fn command_line(&self, prompt: &str) -> Vec<String> {
        let mut cmd = Vec::with_capacity(self.args.len() + 2);
        cmd.push(self.program.clone());
        cmd.extend(self.args.iter().cloned());
        cmd.push(prompt.to_string());
        cmd
    }

    /// Run one agent iteration in `workspace`.
    ///
    /// The agent receives the prompt as its last argument and the
    /// `LANEKEEPER_*` environment variables describing the task. Its stdout
    /// is the transcript.
    ///
    /// # Arguments
    ///
    /// * `task` - The task being worked on.
    /// * `workspace` - Worktree the agent runs in.
    /// * `iteration` - 1-based iteration number within the current run.
    /// * `prompt` - Rendered prompt for this iteration.
    /// * `timeout` - Wall-clock limit before the process is terminated.
    /// * `cancel` - Stops the process early when triggered.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be started or waited
    /// on. Timeouts, crashes and cancellations are reported in the result.
    pub async fn run_iteration(
        &self,
        task: &Task,
        workspace: &Workspace,
        iteration: u32,
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IterationResult, AgentProcessError> {
        let binary = which::which(&self.program)
            .map_err(|_| AgentProcessError::BinaryNotFound(self.program.clone()))?;
        llog_debug!(
            "AgentRunner::run_iteration task={} iteration={} binary={} cwd={}",
            task.id.short(),
            iteration,
            binary.display(),
            workspace.path.display()
        );

        let started = Instant::now();
        let mut state = ProcessState::NotStarted;
        let mut command = Command::new(&binary);
        command
            .args(&self.args)
            .arg(prompt)
            .current_dir(&workspace.path)
            .env("LANEKEEPER_TASK_ID", task.id.to_string())
            .env("LANEKEEPER_TASK_TITLE", &task.title)
            .env("LANEKEEPER_WORKSPACE", &workspace.path)
            .env("LANEKEEPER_PROJECT_ROOT", &self.project_root)
            .env("LANEKEEPER_ITERATION", iteration.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so tools the agent starts are stopped with it.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|source| AgentProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let group = child.id();
        state.advance(ProcessState::Running { pid: group });
        llog!(
            "Agent started for task {} (iteration {}, pid {:?})",
            task.id.short(),
            iteration,
            child.id()
        );

        let transcript = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let readers = [
            child
                .stdout
                .take()
                .map(|out| spawn_reader(out, Arc::clone(&transcript), true)),
            child
                .stderr
                .take()
                .map(|err| spawn_reader(err, Arc::clone(&stderr), false)),
        ];

        let finished = tokio::select! {
            status = child.wait() => ProcessState::from(status.map_err(AgentProcessError::Wait)?),
            _ = tokio::time::sleep(timeout) => {
                llog_warn!("Agent for task {} timed out after {:?}", task.id.short(), timeout);
                self.terminate(&mut child, group).await;
                ProcessState::Killed(KillReason::Timeout)
            }
            _ = cancel.cancelled() => {
                llog!("Agent for task {} cancelled", task.id.short());
                self.terminate(&mut child, group).await;
                ProcessState::Killed(KillReason::Cancelled)
            }
        };
        state.advance(finished);
        // Nothing the agent left running may keep writing to the workspace.
        if let Some(group) = group {
            kill_group(group);
        }

        for reader in readers.into_iter().flatten() {
            if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                llog_debug!("Output reader for task {} did not drain", task.id.short());
            }
        }

        let transcript = transcript.lock().clone();
        let stderr_tail = tail_chars(&stderr.lock(), STDERR_TAIL_CHARS).to_string();
        let signal = classify(&state, &transcript, &stderr_tail);
        llog!(
            "Agent for task {} finished: state={:?} signal={}",
            task.id.short(),
            state,
            signal
        );

        Ok(IterationResult {
            transcript,
            signal,
            exit_status: state,
            stderr_tail,
            duration: started.elapsed(),
        })
    }

    /// Ask the agent's process group to stop, then kill it once the grace
    /// period runs out.
    async fn terminate(&self, child: &mut Child, group: Option<u32>) {
        if let Some(group) = group {
            if terminate_group(group)
                && tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok()
            {
                return;
            }
            kill_group(group);
        }
        llog_debug!("Force killing agent process");
        if let Err(e) = child.kill().await {
            llog_warn!("Failed to kill agent process: {}", e);
        }
    }
}

#[cfg(unix)]
fn terminate_group(group: u32) -> bool {
    llog_debug!("Sending SIGTERM to process group {}", group);
    // SAFETY: kill(2) on the process group created for the agent.
    unsafe { libc::kill(-(group as i32), libc::SIGTERM) == 0 }
}

#[cfg(unix)]
fn kill_group(group: u32) {
    // SAFETY: as above. ESRCH once the group is empty is expected.
    unsafe {
        libc::kill(-(group as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_group(_group: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn kill_group(_group: u32) {}

/// Copy `reader` into `sink` line by line. Bytes that are not UTF-8 are
/// replaced rather than ending the read, so the pipe is always drained.
fn spawn_reader<R>(reader: R, sink: Arc<Mutex<String>>, trace: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    llog_debug!("Agent output read failed: {}", e);
                    break;
                }
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if trace {
                llog_trace!("agent> {}", line);
            }
            let mut buf = sink.lock();
            buf.push_str(line);
            buf.push('\n');
        }
    })
}

/// Map the process outcome and transcript to a signal.
fn classify(state: &ProcessState, transcript: &str, stderr_tail: &str) -> Signal {
    if let ProcessState::Killed(KillReason::Timeout) = state {
        return Signal::Blocked(TIMEOUT_REASON.to_string());
    }
    let parsed = signal::parse(transcript);
    if let ProcessState::Exited(code) = state {
        if parsed.is_ambiguous() && *code != Some(0) {
            llog_warn!(
                "Agent exited with {:?} and no signal. stderr: {}",
                code,
                stderr_tail.trim()
            );
            return Signal::Blocked(TERMINATED_REASON.to_string());
        }
    }
    parsed
}
