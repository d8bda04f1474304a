use axum::{Extension, Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use super::super::error::{ApiResult, JsonBody};
use crate::core::auth::Identity;
use crate::core::error::CoreError;
use crate::core::store::ADMIN_TENANT;
use crate::core::store::types::{JobRecord, JobStatus};

#[derive(Debug, Deserialize)]
pub struct JobControl {
    job_id: String,
}

/// Admins control every job; a tenant caller needs `x` on `job` within its own tenant.
fn may_control(identity: &Identity, job: &JobRecord) -> bool {
    identity.tenant_id == ADMIN_TENANT || (identity.tenant_id == job.project_id && identity.allows("job", "x"))
}

async fn toggle(state: &AppState, identity: &Identity, job_id: &str, to: JobStatus) -> ApiResult<Json<Value>> {
    let job = state
        .store
        .find_job(job_id)
        .await?
        .filter(|job| identity.tenant_id == ADMIN_TENANT || job.project_id == identity.tenant_id)
        .ok_or_else(|| CoreError::NotFound(format!("Job '{}' not found", job_id)))?;
    if !may_control(identity, &job) {
        return Err(CoreError::access_denied().into());
    }

    let from = match to {
        JobStatus::Running => JobStatus::Stopped,
        JobStatus::Stopped => JobStatus::Running,
    };
    let changed = state.store.set_job_status(&job.id, from, to).await?;
    if let Some(scheduler) = &state.scheduler {
        scheduler.sync_job(&job.id).await?;
    }
    if changed {
        info!("Job {} set to {} by {}", job.id, to.as_str(), identity.subject_code);
    }

    Ok(Json(json!({
        "job_id": job.id,
        "status": to.as_str(),
        "changed": changed,
    })))
}

pub async fn start_job_endpoint(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    body: JsonBody<JobControl>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    toggle(&state, &identity, &body.job_id, JobStatus::Running).await
}

pub async fn stop_job_endpoint(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    body: JsonBody<JobControl>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    toggle(&state, &identity, &body.job_id, JobStatus::Stopped).await
}

pub async fn list_jobs_endpoint(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Value>> {
    let jobs = state.store.list_jobs(None).await?;
    let mut listed = Vec::new();
    for job in jobs
        .into_iter()
        .filter(|job| identity.tenant_id == ADMIN_TENANT || job.project_id == identity.tenant_id)
    {
        let registered = match &state.scheduler {
            Some(scheduler) => Some(scheduler.is_registered(&job.id).await),
            None => None,
        };
        listed.push(json!({
            "id": job.id,
            "project_id": job.project_id,
            "name": job.name,
            "mode": job.mode,
            "cron": job.cron,
            "status": job.status.as_str(),
            "registered": registered,
        }));
    }
    Ok(Json(json!({ "jobs": listed })))
}
