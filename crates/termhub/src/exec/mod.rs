//! Command execution.
//!
//! [`CommandExecutor`] runs one command at a time per session inside the
//! session's isolation handle, streaming output as it is produced. Built-in
//! file operations are path-checked against the session root before anything
//! is spawned.

pub(crate) mod builtins;
mod output;
mod policy;

pub use output::{OutputBuffer, Utf8Chunker};
pub use policy::CommandPolicy;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ExecConfig;
use crate::error::{Error, Result};
use crate::isolation::{ExecProgram, ExecRequest, IsolationBackend, IsolationHandle};
use crate::session::Session;
use builtins::Builtin;

/// Size of a single read from a job's stdout or stderr.
const READ_CHUNK_SIZE: usize = 4096;

/// How long output is still collected after a command has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Exit code reported for commands stopped by the hard time limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for cancelled commands.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub policy: CommandPolicy,
    /// Upper bound on retained output per command.
    pub max_output_bytes: usize,
    /// Log a warning once a command runs this long.
    pub warn_after: Option<Duration>,
    /// Terminate commands running this long.
    pub kill_after: Option<Duration>,
}

impl ExecutorConfig {
    pub fn from_config(config: &ExecConfig) -> Self {
        Self {
            policy: CommandPolicy::from_config(config),
            max_output_bytes: config.max_output_bytes,
            warn_after: config.warn_after_secs.map(Duration::from_secs),
            kill_after: config.kill_after_secs.map(Duration::from_secs),
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed { exit_code: i32 },
    Cancelled,
    TimedOut,
}

/// Result of running a command. A non-zero exit code is a normal outcome.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Retained output (the most recent bytes, up to the configured cap).
    pub output: String,
    /// Whether older output was dropped.
    pub truncated: bool,
    /// Session working directory after the command, e.g. `~/t`.
    pub working_directory: String,
}

impl JobOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            JobStatus::Completed { exit_code } => exit_code,
            JobStatus::Cancelled => CANCELLED_EXIT_CODE,
            JobStatus::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }
}

/// The live job of a session.
#[derive(Debug)]
struct RunningJob {
    job_id: String,
    cancel: CancellationToken,
}

/// Removes the job entry when the job ends, however it ends.
struct JobGuard<'a> {
    jobs: &'a DashMap<String, RunningJob>,
    session_id: String,
    job_id: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.jobs
            .remove_if(&self.session_id, |_, job| job.job_id == self.job_id);
    }
}

/// What a command turns into once parsed and checked.
enum Plan {
    Spawn(ExecProgram),
    ChangeDir { program: ExecProgram, target: PathBuf, arg: String },
    Immediate { output: String },
}

pub struct CommandExecutor {
    backend: Arc<dyn IsolationBackend>,
    config: ExecutorConfig,
    jobs: DashMap<String, RunningJob>,
    /// Working directory per session, absolute. Missing means the root.
    cwds: DashMap<String, PathBuf>,
}

impl CommandExecutor {
    pub fn new(backend: Arc<dyn IsolationBackend>, config: ExecutorConfig) -> Self {
        Self {
            backend,
            config,
            jobs: DashMap::new(),
            cwds: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether a command is running in the session.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.jobs.contains_key(session_id)
    }

    /// Cancel the session's running command. Returns whether there was one.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.jobs.get(session_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running command.
    pub fn cancel_all(&self) {
        for job in self.jobs.iter() {
            job.cancel.cancel();
        }
    }

    /// Drop per-session state and cancel its command.
    pub fn forget(&self, session_id: &str) {
        self.cancel(session_id);
        self.cwds.remove(session_id);
    }

    fn cwd(&self, session: &Session) -> PathBuf {
        self.cwds
            .get(&session.id)
            .map(|cwd| cwd.clone())
            .unwrap_or_else(|| session.handle.root.clone())
    }

    /// Working directory as shown to clients (`~`, `~/t`).
    pub fn working_directory(&self, session: &Session) -> String {
        builtins::display_dir(&session.handle.root, &self.cwd(session))
    }

    /// Run `command` in the session.
    ///
    /// Output chunks go to `sink` as they are produced. `cancel` stops the
    /// command; [`cancel`](Self::cancel) triggers the same token. Fails with
    /// `Busy` when the session already runs a command.
    pub async fn execute(
        &self,
        session: &Session,
        command: &str,
        sink: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let _guard = self.claim(&session.id, &job_id, cancel.clone())?;

        self.config.policy.check(command)?;

        let handle = &session.handle;
        let cwd = self.cwd(session);
        let builtin = builtins::parse(command);

        // Lexical containment first: an escaping path never reaches the handle.
        let lexical = match builtin {
            Some(ref builtin) => builtin
                .path_args()
                .into_iter()
                .map(|arg| builtins::resolve_lexical(&handle.root, &cwd, arg))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        if matches!(builtin, Some(Builtin::Remove { .. })) && lexical.contains(&handle.root) {
            return Err(Error::validation("Refusing to remove the home directory"));
        }

        self.ensure_running(handle).await?;

        let plan = match builtin {
            Some(builtin) => {
                self.check_real_paths(handle, &lexical).await?;
                debug!("Built-in for session {}: {:?}", session.id, builtin);
                plan_builtin(&builtin, &lexical, &handle.root, &cwd)
            }
            None => Plan::Spawn(ExecProgram::Shell(command.to_string())),
        };

        let started = Instant::now();
        let (status, buffer) = match plan {
            Plan::Immediate { output } => {
                let mut buffer = OutputBuffer::new(self.config.max_output_bytes);
                buffer.push(&output);
                if let Some(sink) = sink {
                    let _ = sink.send(output).await;
                }
                (JobStatus::Completed { exit_code: 0 }, buffer)
            }
            Plan::Spawn(program) => {
                self.run(handle, program, &cwd, &job_id, sink, &cancel)
                    .await?
            }
            Plan::ChangeDir {
                program,
                target,
                arg,
            } => {
                let (status, mut buffer) = self
                    .run(handle, program, &cwd, &job_id, None, &cancel)
                    .await?;
                match status {
                    JobStatus::Completed { exit_code: 0 } => {
                        self.cwds.insert(session.id.clone(), target);
                        (status, buffer)
                    }
                    JobStatus::Completed { .. } => {
                        let message = format!("cd: {arg}: No such directory\n");
                        buffer.push(&message);
                        if let Some(sink) = sink {
                            let _ = sink.send(message).await;
                        }
                        (JobStatus::Completed { exit_code: 1 }, buffer)
                    }
                    other => (other, buffer),
                }
            }
        };

        let outcome = JobOutcome {
            status,
            truncated: buffer.truncated(),
            output: buffer.into_string(),
            working_directory: self.working_directory(session),
        };

        info!(
            target: "audit",
            "command: session={} user={} exit={} status={:?} elapsed={:?} command={:?}",
            session.id,
            session.user_id,
            outcome.exit_code(),
            outcome.status,
            started.elapsed(),
            command
        );
        Ok(outcome)
    }

    fn claim(
        &self,
        session_id: &str,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Result<JobGuard<'_>> {
        match self.jobs.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(Error::Busy(session_id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(RunningJob {
                    job_id: job_id.to_string(),
                    cancel,
                });
                Ok(JobGuard {
                    jobs: &self.jobs,
                    session_id: session_id.to_string(),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    /// Restart a stopped handle once before giving up.
    async fn ensure_running(&self, handle: &IsolationHandle) -> Result<()> {
        if self.backend.is_running(handle).await {
            return Ok(());
        }
        warn!(
            "Execution environment of {} is not running, restarting",
            handle.user_id
        );
        if let Err(e) = self.backend.restart(handle).await {
            return Err(Error::handle_unavailable(e.to_string()));
        }
        if !self.backend.is_running(handle).await {
            return Err(Error::handle_unavailable(format!(
                "environment of {} did not come back",
                handle.user_id
            )));
        }
        Ok(())
    }

    async fn check_real_paths(&self, handle: &IsolationHandle, paths: &[PathBuf]) -> Result<()> {
        check_real_paths(self.backend.as_ref(), handle, paths).await
    }

    /// Spawn a program and stream its output until it exits or is stopped.
    async fn run(
        &self,
        handle: &IsolationHandle,
        program: ExecProgram,
        cwd: &Path,
        job_id: &str,
        mut sink: Option<mpsc::Sender<String>>,
        cancel: &CancellationToken,
    ) -> Result<(JobStatus, OutputBuffer)> {
        let request = ExecRequest {
            program,
            cwd: cwd.to_path_buf(),
            job_id: job_id.to_string(),
        };
        let mut child = self.backend.spawn(handle, &request).await?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let mut buffer = OutputBuffer::new(self.config.max_output_bytes);
        let started = Instant::now();
        let warn_at = self.config.warn_after.map(|d| started + d);
        let kill_at = self.config.kill_after.map(|d| started + d);
        let mut warned = false;

        let mut eof = false;
        let stopped = loop {
            tokio::select! {
                chunk = rx.recv(), if !eof => match chunk {
                    Some(chunk) => forward(&mut buffer, &mut sink, chunk).await,
                    None => eof = true,
                },
                exit = child.wait() => break Stop::Exited(exit?),
                _ = cancel.cancelled() => break Stop::Halted(JobStatus::Cancelled),
                _ = sleep_until_opt(kill_at) => break Stop::Halted(JobStatus::TimedOut),
                _ = sleep_until_opt(warn_at), if !warned => {
                    warned = true;
                    warn!(
                        "Job {} of {} still running after {:?}",
                        job_id,
                        handle.user_id,
                        started.elapsed()
                    );
                }
            }
        };

        let status = match stopped {
            Stop::Halted(status) => {
                info!("Terminating job {} of {} ({:?})", job_id, handle.user_id, status);
                self.backend.terminate(handle, job_id, &mut child).await;
                if status == JobStatus::TimedOut {
                    let notice = format!(
                        "\nCommand timed out after {}s\n",
                        started.elapsed().as_secs()
                    );
                    buffer.push(&notice);
                    if let Some(ref tx) = sink {
                        let _ = tx.send(notice).await;
                    }
                }
                status
            }
            Stop::Exited(exit) => {
                // Background children may keep the pipes open after the
                // command itself has exited.
                let drain_until = Instant::now() + PIPE_DRAIN_GRACE;
                while !eof {
                    match tokio::time::timeout_at(drain_until, rx.recv()).await {
                        Ok(Some(chunk)) => forward(&mut buffer, &mut sink, chunk).await,
                        Ok(None) => eof = true,
                        Err(_) => {
                            debug!(
                                "Job {} of {} exited with its pipes still open",
                                job_id, handle.user_id
                            );
                            break;
                        }
                    }
                }
                JobStatus::Completed {
                    exit_code: exit_code(exit),
                }
            }
        };

        Ok((status, buffer))
    }
}

fn plan_builtin(builtin: &Builtin, resolved: &[PathBuf], root: &Path, cwd: &Path) -> Plan {
    match builtin {
        Builtin::PrintDir => Plan::Immediate {
            output: format!("{}\n", builtins::display_dir(root, cwd)),
        },
        Builtin::ChangeDir { path } => {
            let target = resolved.first().cloned().unwrap_or_else(|| cwd.to_path_buf());
            Plan::ChangeDir {
                program: builtin
                    .program(resolved, cwd)
                    .unwrap_or_else(|| ExecProgram::Argv(vec!["true".to_string()])),
                target,
                arg: path.clone().unwrap_or_else(|| "~".to_string()),
            }
        }
        other => match other.program(resolved, cwd) {
            Some(program) => Plan::Spawn(program),
            None => Plan::Immediate {
                output: String::new(),
            },
        },
    }
}

/// Resolve symlinks and require every path to stay under the handle root.
pub(crate) async fn check_real_paths(
    backend: &dyn IsolationBackend,
    handle: &IsolationHandle,
    paths: &[PathBuf],
) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let real_root = backend.resolve_real_path(handle, &handle.root).await?;
    for path in paths {
        let real = backend.resolve_real_path(handle, path).await?;
        if !real.starts_with(&real_root) {
            warn!(
                "Path {} of user {} resolves outside the root to {}",
                path.display(),
                handle.user_id,
                real.display()
            );
            return Err(Error::AccessDenied(path.display().to_string()));
        }
    }
    Ok(())
}

/// Why the output loop of a job ended.
enum Stop {
    Exited(ExitStatus),
    Halted(JobStatus),
}

/// Retain a chunk and pass it on to the live sink, if any.
async fn forward(buffer: &mut OutputBuffer, sink: &mut Option<mpsc::Sender<String>>, chunk: String) {
    buffer.push(&chunk);
    let Some(tx) = sink.as_ref() else {
        return;
    };
    if tx.send(chunk).await.is_err() {
        *sink = None;
    }
}

/// Forward a pipe to the job's chunk channel.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut chunker = Utf8Chunker::default();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = chunker.push(&buf[..n]);
                if !text.is_empty() && tx.send(text).await.is_err() {
                    return;
                }
            }
        }
    }
    let rest = chunker.finish();
    if !rest.is_empty() {
        let _ = tx.send(rest).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Exit code of a finished process; `128 + signal` when killed by a signal.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
