//! Build environment trait and build types.
//!
//! A build environment runs one job's payload in isolation (container,
//! chroot wrapper, ...). It is provisioned outside of BuildIt; the worker
//! agent only starts, watches and, when its lease is lost, kills builds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{JobId, Result, Target};

/// Specification for a build to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub job_id: JobId,
    pub target: Target,
    /// Opaque payload handed to the environment as-is.
    pub payload: serde_json::Value,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Maximum execution time. Enforced by the worker agent.
    pub timeout: Option<Duration>,
}

/// Handle to a running or completed build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildHandle {
    pub job_id: JobId,
    /// Environment-specific identifier (container ID, process ID).
    pub executor_id: String,
    /// Name of the environment running this build.
    pub executor_name: String,
}

/// Outcome of a build that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub exit_code: Option<i32>,
    pub log_ref: Option<String>,
    pub artifact_ref: Option<String>,
}

impl BuildOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[async_trait]
pub trait BuildEnvironment: Send + Sync {
    /// Name of this environment.
    fn name(&self) -> &'static str;

    /// Start a build.
    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle>;

    /// Stream log lines from a build. May be called at most once per handle.
    async fn logs(&self, handle: &BuildHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Wait for the build to finish. Must be safe to run concurrently with `cancel`.
    async fn wait(&self, handle: &BuildHandle) -> Result<BuildOutput>;

    /// Forcefully terminate a build.
    async fn cancel(&self, handle: &BuildHandle) -> Result<()>;
}
