use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::geo::Geocoder;
use crate::jobs::{prepare_base, JobService, JobView};

pub struct AppState {
    pub config: AppConfig,
    pub geocoder: Arc<dyn Geocoder>,
    pub jobs: JobService,
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    property: Value,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/job", post(submit_job))
        .route("/job/{job_id}", get(job_status))
        .with_state(state)
}

async fn heartbeat(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "ok": true, "config": state.config.public_profile() }))
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "rejected job submission");
            return unprocessable(rejection.body_text());
        }
    };

    let base = match prepare_base(request.property, state.geocoder.as_ref()).await {
        Ok(base) => base,
        Err(err) => {
            warn!(error = %err, "rejected job submission");
            return unprocessable(err.to_string());
        }
    };

    let job_id = state.jobs.submit(base);
    info!(%job_id, "job submitted");
    Json(json!({ "job_id": job_id })).into_response()
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Json<JobView> {
    match Uuid::parse_str(&job_id) {
        Ok(id) => Json(state.jobs.query(&id)),
        Err(_) => Json(JobView::unknown()),
    }
}

fn unprocessable(message: String) -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": message })),
    )
        .into_response()
}
