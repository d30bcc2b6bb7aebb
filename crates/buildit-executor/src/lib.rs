//! Build environments for BuildIt workers.
//!
//! Provides:
//! - Local process (a configured command per job)
//! - Docker (one container per job)

pub mod docker;
pub mod process;

pub use buildit_core::executor::{
    BuildEnvironment, BuildHandle, BuildOutput, BuildSpec, LogLine, LogStream,
};
pub use docker::DockerEnvironment;
pub use process::ProcessEnvironment;

use buildit_core::{Error, Result};

/// Environment variables every build receives, merged with `spec.env`.
pub(crate) fn build_env(spec: &BuildSpec) -> Result<Vec<(String, String)>> {
    let payload =
        serde_json::to_string(&spec.payload).map_err(|e| Error::InvalidPayload(e.to_string()))?;
    let mut env: Vec<(String, String)> = vec![
        ("BUILDIT_JOB_ID".to_string(), spec.job_id.to_string()),
        ("BUILDIT_TARGET".to_string(), spec.target.to_string()),
        ("BUILDIT_PAYLOAD".to_string(), payload),
    ];
    let mut extra: Vec<_> = spec
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    extra.sort();
    env.extend(extra);
    Ok(env)
}
