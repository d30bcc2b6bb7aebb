//! Job commands against the API server.

use super::ApiClient;
use anyhow::Result;
use buildit_core::Job;
use buildit_core::payload::BuildRequest;
use buildit_scheduler::{FleetStatus, Submitted};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct BatchResponse {
    jobs: Vec<Submitted>,
}

pub async fn submit(
    client: &ApiClient,
    targets: Vec<String>,
    packages: Vec<String>,
    git_ref: String,
    pr: Option<u64>,
) -> Result<()> {
    let request = BuildRequest {
        packages,
        git_ref,
        github_pr: pr,
        reply_to: None,
    };
    let body = json!({ "targets": targets, "payload": request });
    let response: BatchResponse = client.post("/api/v1/jobs/batch", &body).await?;

    for submitted in response.jobs {
        println!("{:<12} {}", submitted.target.as_str(), submitted.job_id);
    }
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let job: Job = client.get(&format!("/api/v1/jobs/{}", id)).await?;

    println!("Job:      {}", job.id);
    println!("Target:   {}", job.target);
    println!("Status:   {}", job.status);
    println!("Attempts: {}", job.attempt_count);
    if let Some(owner) = &job.owner {
        println!("Owner:    {}", owner);
    }
    if let Some(expiry) = job.lease_expiry {
        println!("Lease:    until {}", expiry);
    }
    println!("Created:  {}", job.created_at);
    if let Some(result) = &job.result {
        if let Some(code) = result.exit_code {
            println!("Exit:     {}", code);
        }
        if let Some(cause) = &result.cause {
            println!("Cause:    {:?}", cause);
        }
        println!("Elapsed:  {}s", result.elapsed_ms / 1000);
        if let Some(log) = &result.log_ref {
            println!("Log:      {}", log);
        }
        if let Some(artifact) = &result.artifact_ref {
            println!("Artifact: {}", artifact);
        }
    }
    println!("Payload:  {}", job.payload);
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    client
        .post_empty(&format!("/api/v1/jobs/{}/cancel", id))
        .await?;
    println!("Cancelled {}", id);
    Ok(())
}

pub async fn status(client: &ApiClient) -> Result<()> {
    let status: FleetStatus = client.get("/api/v1/status").await?;

    println!("{:<14} {:>7} {:>7}", "TARGET", "QUEUED", "RUNNING");
    for summary in &status.targets {
        println!(
            "{:<14} {:>7} {:>7}",
            summary.target.as_str(), summary.queued, summary.running
        );
    }

    println!();
    if status.workers.is_empty() {
        println!("No workers online");
    }
    for worker in &status.workers {
        println!(
            "{:<40} {:<12} last seen {}",
            worker.id.as_str(),
            worker.target.as_str(),
            worker.last_seen
        );
    }
    Ok(())
}
