//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::client::{JobClient, JobRequest};
use crate::core::job::{JobFilter, JobState};
use crate::core::types::{JobId, QueueName, RecurringKey};
use crate::demo;
use crate::scheduler::{RecurringJobRequest, RecurringScheduler, SchedulerHandle};
use crate::storage::JobStore;

use super::errors::ApiError;
use super::responses::{
    CreatedResponse, HealthResponse, JobListResponse, JobResponse, MessageResponse,
    RecurringListResponse, RecurringResponse, SchedulerStateResponse, StatsResponse,
};

/// Delay before the job submitted by `/api/people/schedule` runs.
const PEOPLE_SCHEDULE_DELAY: Duration = Duration::from_secs(5);

/// Shared application state for API handlers.
pub struct ApiState<S: JobStore> {
    pub handle: SchedulerHandle,
    pub client: JobClient<S>,
    pub recurring: RecurringScheduler<S>,
}

impl<S: JobStore> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            client: self.client.clone(),
            recurring: self.recurring.clone(),
        }
    }
}

/// Query parameters for the list_jobs endpoint.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub queue: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, ApiError> {
        let mut filter = JobFilter::default().with_limit(self.limit);
        if let Some(state) = self.state {
            let state = state
                .parse::<JobState>()
                .map_err(|e| ApiError::Validation(e.to_string()))?;
            filter = filter.with_state(state);
        }
        if let Some(queue) = self.queue {
            filter = filter.with_queue(QueueName::new(queue));
        }
        if let Some(job_type) = self.job_type {
            filter = filter.with_job_type(job_type);
        }
        Ok(filter)
    }
}

/// Query parameters for the people endpoints.
#[derive(Debug, Deserialize)]
pub struct PersonQuery {
    #[serde(rename = "personName")]
    pub person_name: String,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|_| ApiError::NotFound(format!("invalid job id: {}", raw)))
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Get scheduler state.
pub async fn get_scheduler_state<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Json<SchedulerStateResponse> {
    let scheduler_state = state.handle.state().await;
    Json(SchedulerStateResponse::from(scheduler_state))
}

/// Pause the scheduler.
pub async fn pause_scheduler<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.pause().await?;
    Ok(Json(MessageResponse::new("scheduler paused")))
}

/// Resume the scheduler.
pub async fn resume_scheduler<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.resume().await?;
    Ok(Json(MessageResponse::new("scheduler resumed")))
}

/// Submit a job.
pub async fn create_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let job = state.client.create(request).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse::from(&job))))
}

/// List jobs.
pub async fn list_jobs<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = query.into_filter()?;
    let jobs: Vec<JobResponse> = state
        .client
        .list(&filter)
        .await?
        .into_iter()
        .map(JobResponse::from)
        .collect();
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Get a specific job.
pub async fn get_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.client.get(&job_id).await?;
    Ok(Json(JobResponse::from(job)))
}

/// Cancel a job that has not started.
pub async fn delete_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.client.delete(&job_id).await?;
    Ok(Json(JobResponse::from(job)))
}

/// Job counts by state.
pub async fn stats<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.client.counts().await?;
    let recurring = state.recurring.list().await?.len();
    Ok(Json(StatsResponse {
        counts,
        total: counts.total(),
        recurring,
    }))
}

/// Register or update a recurring job.
pub async fn upsert_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<RecurringJobRequest>,
) -> Result<Json<RecurringResponse>, ApiError> {
    let definition = state.recurring.add_or_update(request).await?;
    Ok(Json(RecurringResponse::from(definition)))
}

/// List recurring jobs.
pub async fn list_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<RecurringListResponse>, ApiError> {
    let recurring: Vec<RecurringResponse> = state
        .recurring
        .list()
        .await?
        .into_iter()
        .map(RecurringResponse::from)
        .collect();
    let count = recurring.len();
    Ok(Json(RecurringListResponse { recurring, count }))
}

/// Remove a recurring job.
pub async fn delete_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(key): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let key = RecurringKey::new(key);
    state.recurring.remove(&key).await?;
    Ok(Json(MessageResponse::new(format!(
        "recurring job '{}' removed",
        key
    ))))
}

/// Fire a recurring job now.
pub async fn trigger_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let job = state.recurring.trigger(&RecurringKey::new(key)).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse::from(&job))))
}

/// Enqueue `create-person`.
pub async fn create_person<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<PersonQuery>,
) -> Result<Json<CreatedResponse>, ApiError> {
    let job = state
        .client
        .enqueue(demo::CREATE_PERSON, &query.person_name)
        .await?;
    Ok(Json(CreatedResponse::from(&job)))
}

/// Schedule `print` in five seconds with a continuation reporting it finished.
pub async fn schedule_person<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<PersonQuery>,
) -> Result<Json<CreatedResponse>, ApiError> {
    let job = state
        .client
        .schedule(demo::PRINT, &query.person_name, PEOPLE_SCHEDULE_DELAY)
        .await?;
    state
        .client
        .continue_with(
            &job.id,
            demo::PRINT,
            &json!({ "message": format!("The job {} has finished", job.id) }),
        )
        .await?;
    Ok(Json(CreatedResponse::from(&job)))
}
