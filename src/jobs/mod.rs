//! Sandbox jobs consumed from the Redis queue and the results sent back

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SandboxError;
use crate::sandbox::{SandboxManager, SandboxView};

/// Sandbox job enum - represents the commands the instancer accepts
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum SandboxJob {
    /// Start (or fetch the running) sandbox for a team
    #[serde(rename = "start")]
    Start(StartJob),
    /// Stop a team's sandbox
    #[serde(rename = "stop")]
    Stop(TargetJob),
    /// Extend a team's sandbox TTL
    #[serde(rename = "extend")]
    Extend(TargetJob),
    /// Replace a team's sandbox with a fresh resource
    #[serde(rename = "regenerate")]
    Regenerate(TargetJob),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJob {
    pub request_id: String,
    pub user_id: i64,
    pub team_id: i64,
    pub challenge_id: i64,
}

/// A job addressing an existing sandbox
#[derive(Debug, Serialize, Deserialize)]
pub struct TargetJob {
    pub request_id: String,
    pub team_id: i64,
    pub challenge_id: i64,
}

impl SandboxJob {
    pub fn request_id(&self) -> &str {
        match self {
            SandboxJob::Start(job) => &job.request_id,
            SandboxJob::Stop(job) | SandboxJob::Extend(job) | SandboxJob::Regenerate(job) => {
                &job.request_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SandboxJob::Start(_) => "start",
            SandboxJob::Stop(_) => "stop",
            SandboxJob::Extend(_) => "extend",
            SandboxJob::Regenerate(_) => "regenerate",
        }
    }
}

/// Result of a sandbox job
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub request_id: String,
    pub success: bool,
    /// Failure was transient ("service temporarily unavailable")
    #[serde(default)]
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    fn ok(request_id: &str, sandbox: Option<SandboxView>) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: true,
            retryable: false,
            sandbox,
            error_message: None,
        }
    }

    fn failed(request_id: &str, error: &SandboxError) -> Self {
        let message = if error.is_retryable() {
            format!("Service temporarily unavailable: {}", error)
        } else {
            error.to_string()
        };
        Self {
            request_id: request_id.to_string(),
            success: false,
            retryable: error.is_retryable(),
            sandbox: None,
            error_message: Some(message),
        }
    }
}

/// Run one job against the manager
pub async fn handle_job(manager: &SandboxManager, job: SandboxJob) -> JobResult {
    let request_id = job.request_id().to_string();
    let kind = job.kind();

    let outcome = match job {
        SandboxJob::Start(job) => manager
            .start_sandbox(job.user_id, job.team_id, job.challenge_id)
            .await
            .map(Some),
        SandboxJob::Stop(job) => manager
            .stop_sandbox(job.team_id, job.challenge_id)
            .await
            .map(|()| None),
        SandboxJob::Extend(job) => manager
            .extend_sandbox_ttl(job.team_id, job.challenge_id)
            .await
            .map(Some),
        SandboxJob::Regenerate(job) => manager
            .regenerate_sandbox(job.team_id, job.challenge_id)
            .await
            .map(Some),
    };

    match outcome {
        Ok(sandbox) => {
            info!("{} job completed: request_id={}", kind, request_id);
            JobResult::ok(&request_id, sandbox)
        }
        Err(e) => {
            warn!("{} job failed: request_id={}, error={}", kind, request_id, e);
            JobResult::failed(&request_id, &e)
        }
    }
}
