//! Build environment that runs a local command per job.
//!
//! The payload is written to the command's stdin as JSON and is also
//! available in `BUILDIT_PAYLOAD`. The exit status decides success.

use async_trait::async_trait;
use buildit_core::executor::*;
use buildit_core::{Error, JobId, Result};
use chrono::Utc;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::build_env;

struct Run {
    seq: u64,
    kill: CancellationToken,
    exit: Option<oneshot::Receiver<Result<Option<i32>>>>,
    logs: Option<mpsc::UnboundedReceiver<LogLine>>,
}

type Runs = Arc<Mutex<HashMap<JobId, Run>>>;

fn lock(runs: &Mutex<HashMap<JobId, Run>>) -> std::sync::MutexGuard<'_, HashMap<JobId, Run>> {
    runs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs each build as a child process of the worker.
///
/// Every build gets its own process group, so cancelling a build also
/// takes down anything it forked.
pub struct ProcessEnvironment {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    runs: Runs,
    next_seq: AtomicU64,
}

impl ProcessEnvironment {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::InvalidPayload(
                "process environment needs a command".to_string(),
            ));
        }
        Ok(Self {
            command,
            workdir: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Run>> {
        lock(&self.runs)
    }
}

/// Sends SIGKILL to every process in the build's group.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>, job_id: JobId) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to kill build process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>, _job_id: JobId) {}

fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(content)) => {
                    let line = LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content,
                    };
                    // Keep draining after the reader goes away so the child never blocks.
                    let _ = tx.send(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Error reading build output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl BuildEnvironment for ProcessEnvironment {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle> {
        let payload = serde_json::to_vec(&spec.payload)
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .envs(build_env(&spec)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        info!(job_id = %spec.job_id, command = ?self.command, "Starting build process");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start build: {}", e)))?;
        let pgid = child.id();
        let pid = pgid.map(|p| p.to_string()).unwrap_or_default();

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, LogStream::Stdout, log_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, LogStream::Stderr, log_tx);
        }
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Build did not read its payload");
                }
            });
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let token = kill.clone();
        let job_id = spec.job_id;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.runs().insert(
            spec.job_id,
            Run {
                seq,
                kill,
                exit: Some(exit_rx),
                logs: Some(log_rx),
            },
        );

        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => status
                    .map(|s| s.code())
                    .map_err(|e| Error::ExecutionFailed(e.to_string())),
                _ = token.cancelled() => {
                    kill_group(pgid, job_id);
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job_id, error = %e, "Failed to kill build process");
                    }
                    Err(Error::ExecutionFailed("build was killed".to_string()))
                }
            };
            // Leftover background processes do not outlive the build.
            kill_group(pgid, job_id);

            if exit_tx.send(outcome).is_err() {
                // Nobody is waiting any more, so nobody will remove the entry.
                let mut runs = lock(&runs);
                if runs.get(&job_id).is_some_and(|run| run.seq == seq) {
                    runs.remove(&job_id);
                }
                debug!(job_id = %job_id, "Dropped abandoned build");
            }
        });

        Ok(BuildHandle {
            job_id: spec.job_id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &BuildHandle) -> Result<BoxStream<'static, LogLine>> {
        let rx = self
            .runs()
            .get_mut(&handle.job_id)
            .and_then(|run| run.logs.take())
            .ok_or_else(|| Error::NotFound(format!("logs for build {}", handle.job_id)))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn wait(&self, handle: &BuildHandle) -> Result<BuildOutput> {
        let rx = self
            .runs()
            .get_mut(&handle.job_id)
            .and_then(|run| run.exit.take())
            .ok_or_else(|| Error::NotFound(format!("build {}", handle.job_id)))?;

        let outcome = rx
            .await
            .map_err(|_| Error::ExecutionFailed("build supervisor vanished".to_string()))?;
        self.runs().remove(&handle.job_id);

        let exit_code = outcome?;
        Ok(BuildOutput {
            exit_code,
            log_ref: None,
            artifact_ref: None,
        })
    }

    async fn cancel(&self, handle: &BuildHandle) -> Result<()> {
        if let Some(run) = self.runs().get(&handle.job_id) {
            run.kill.cancel();
        }
        Ok(())
    }
}
