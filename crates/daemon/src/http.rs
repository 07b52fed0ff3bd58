use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use builder_core::{
    api::{
        ClaimRequest, ClaimResponse, CompleteRequest, CompleteResponse, CreateMessageRequest,
        CreateProjectRequest, ErrorBody, FindMessagesRequest, FindMessagesResponse,
        GetStepResponse, HeartbeatRequest, HeartbeatResponse, JobView, PersistMessageRequest,
        PutStepRequest, SendEventRequest, SendEventResponse, UsageStatus, LEASE_TOKEN_HEADER,
    },
    model::{Message, Project},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::ServiceError;
use crate::service::{BuilderService, Caller};
use crate::usage::{Plan, UsageError};

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the caller's plan name.
pub const PLAN_HEADER: &str = "x-user-plan";

#[derive(Clone)]
pub struct AppState {
    svc: Arc<BuilderService>,
}

pub fn router(svc: Arc<BuilderService>) -> Router {
    let state = AppState { svc };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/projects", post(create_project).get(list_projects))
        .route("/v1/projects/{project_id}", get(get_project))
        .route("/v1/projects/{project_id}/messages", get(list_messages))
        .route("/v1/messages", post(create_message))
        .route("/v1/usage", get(usage_status))
        .route("/v1/events", post(send_event))
        .route("/v1/jobs/{job_id}", get(get_job))
        .route("/v1/agent/claim", post(agent_claim))
        .route("/v1/agent/heartbeat", post(agent_heartbeat))
        .route("/v1/agent/complete", post(agent_complete))
        .route("/v1/agent/messages", post(agent_persist_message))
        .route("/v1/agent/messages/find", post(agent_find_messages))
        .route(
            "/v1/agent/jobs/{job_id}/steps/{key}",
            get(agent_get_step).put(agent_put_step),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ServiceError::Unauthorized)?;
        let plan = parts
            .headers
            .get(PLAN_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Plan>().ok())
            .unwrap_or_default();
        Ok(Caller {
            user_id: user_id.to_string(),
            plan,
        })
    }
}

async fn create_project(
    State(st): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, AppError> {
    Ok(Json(st.svc.create_project(&caller, req).await?))
}

async fn list_projects(
    State(st): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(st.svc.list_projects(&caller).await?))
}

async fn get_project(
    State(st): State<AppState>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, AppError> {
    Ok(Json(st.svc.get_project(&caller, &project_id).await?))
}

async fn list_messages(
    State(st): State<AppState>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    Ok(Json(st.svc.list_messages(&caller, &project_id).await?))
}

async fn create_message(
    State(st): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateMessageRequest>,
) -> Result<Json<Message>, AppError> {
    Ok(Json(st.svc.create_message(&caller, req).await?))
}

async fn usage_status(
    State(st): State<AppState>,
    caller: Caller,
) -> Result<Json<UsageStatus>, AppError> {
    Ok(Json(st.svc.usage_status(&caller).await?))
}

async fn send_event(
    State(st): State<AppState>,
    caller: Caller,
    Json(req): Json<SendEventRequest>,
) -> Result<Json<SendEventResponse>, AppError> {
    let job_id = st.svc.send_raw_event(&caller, req).await?;
    Ok(Json(SendEventResponse { job_id }))
}

async fn get_job(
    State(st): State<AppState>,
    caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(st.svc.get_job(&caller, &job_id).await?))
}

async fn agent_claim(
    State(st): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    let lease = st.svc.claim_job(req.agent_id).await?;
    Ok(Json(ClaimResponse { lease }))
}

async fn agent_heartbeat(
    State(st): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    Ok(Json(st.svc.heartbeat(req).await?))
}

async fn agent_complete(
    State(st): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, AppError> {
    Ok(Json(st.svc.complete_job(req).await?))
}

async fn agent_persist_message(
    State(st): State<AppState>,
    Json(req): Json<PersistMessageRequest>,
) -> Result<Json<Message>, AppError> {
    Ok(Json(st.svc.persist_message(req).await?))
}

async fn agent_find_messages(
    State(st): State<AppState>,
    Json(req): Json<FindMessagesRequest>,
) -> Result<Json<FindMessagesResponse>, AppError> {
    let messages = st.svc.find_job_messages(req).await?;
    Ok(Json(FindMessagesResponse { messages }))
}

async fn agent_get_step(
    State(st): State<AppState>,
    headers: HeaderMap,
    Path((job_id, key)): Path<(String, String)>,
) -> Result<Json<GetStepResponse>, AppError> {
    let lease_token = lease_token(&headers)?;
    let output = st.svc.get_step(&job_id, &key, lease_token).await?;
    Ok(Json(GetStepResponse { output }))
}

async fn agent_put_step(
    State(st): State<AppState>,
    Path((job_id, key)): Path<(String, String)>,
    Json(req): Json<PutStepRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    st.svc
        .put_step(&job_id, &key, &req.lease_token, req.output)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

fn lease_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(LEASE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(AppError(ServiceError::Unauthorized))
}

#[derive(Debug)]
pub struct AppError(ServiceError);

impl<E: Into<ServiceError>> From<E> for AppError {
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Validation(_)
            | ServiceError::UnsupportedEvent(_)
            | ServiceError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Usage(UsageError::Exhausted { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Db(_) | ServiceError::Payload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use builder_core::validation::ValidationError;

    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (
                AppError::from(ValidationError::Empty("message")),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(ServiceError::Unauthorized),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::from(ServiceError::NotFound("project p1".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(ServiceError::Conflict("lease mismatch".into())),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(UsageError::Exhausted { ms_before_next: 10 }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                AppError::from(ServiceError::UnsupportedEvent("x".into())),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn caller_comes_from_headers() {
        let req = axum::http::Request::builder()
            .header(USER_HEADER, "user_1")
            .header(PLAN_HEADER, "pro")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let caller = Caller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller.user_id, "user_1");
        assert_eq!(caller.plan, Plan::Pro);
    }

    #[test]
    fn step_reads_need_a_lease_token() {
        let mut headers = HeaderMap::new();
        let err = lease_token(&headers).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        headers.insert(LEASE_TOKEN_HEADER, "  ".parse().unwrap());
        assert!(lease_token(&headers).is_err());

        headers.insert(LEASE_TOKEN_HEADER, "tok-1".parse().unwrap());
        assert_eq!(lease_token(&headers).unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let req = axum::http::Request::builder().body(()).unwrap();
        let (mut parts, _) = req.into_parts();
        let err = Caller::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
