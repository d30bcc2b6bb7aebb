//! Docker build environment.
//!
//! Each job runs in its own container named after the job id. The payload
//! reaches the build through `BUILDIT_PAYLOAD`. Containers are removed once
//! the build has been waited for, and a leftover container from an earlier
//! attempt at the same job is cleared before a new one is created.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use buildit_core::executor::*;
use buildit_core::{Error, JobId, Result};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::build_env;

/// Runs builds in containers on the local Docker daemon.
pub struct DockerEnvironment {
    docker: Docker,
    image: String,
    command: Vec<String>,
}

impl DockerEnvironment {
    /// Connect to the local Docker daemon.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self::with_client(docker, image, command))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            docker,
            image: image.into(),
            command,
        }
    }

    fn container_name(job_id: &JobId) -> String {
        format!("buildit-job-{}", job_id)
    }

    async fn pull_image(&self) {
        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }
    }

    /// Force-remove a container. A container that is already gone is not an error.
    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl BuildEnvironment for DockerEnvironment {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle> {
        let container_name = Self::container_name(&spec.job_id);
        self.pull_image().await;

        let env: Vec<String> = build_env(&spec)?
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(self.image.clone()),
            cmd: (!self.command.is_empty()).then(|| self.command.clone()),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        // A worker that died mid-build leaves its container behind under the
        // same name; the job has been re-claimed, so that build is dead.
        self.remove(&container_name).await?;

        info!(container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(BuildHandle {
            job_id: spec.job_id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &BuildHandle) -> Result<BoxStream<'static, LogLine>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(&Self::container_name(&handle.job_id), Some(options));

        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });
        Ok(Box::pin(mapped))
    }

    async fn wait(&self, handle: &BuildHandle) -> Result<BuildOutput> {
        let container_name = Self::container_name(&handle.job_id);
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Some(code as i32)
            }
            Some(Err(e)) => {
                return Err(Error::ExecutionFailed(format!(
                    "Failed to wait for container: {}",
                    e
                )));
            }
            None => None,
        };

        if let Err(e) = self.remove(&container_name).await {
            warn!(container = %container_name, error = %e, "Failed to clean up container");
        }

        Ok(BuildOutput {
            exit_code,
            log_ref: None,
            artifact_ref: None,
        })
    }

    async fn cancel(&self, handle: &BuildHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.job_id);
        if let Err(e) = self.docker.stop_container(&container_name, None).await {
            debug!(container = %container_name, error = %e, "Stop failed, removing anyway");
        }
        self.remove(&container_name).await
    }
}
