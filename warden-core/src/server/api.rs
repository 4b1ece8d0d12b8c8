//! HTTP admin API over the remediation service

use crate::error::RemediationError;
use crate::models::{Actor, AuditFilter, PlaybookStatus, RemediationRequest, Role};
use crate::workflow::RemediationService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_depth: usize,
    pub running_tasks: usize,
}

/// Body of approve, reject and execute calls
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub actor: String,
    pub role: Role,
    #[serde(default)]
    pub comment: Option<String>,
}

impl DecisionRequest {
    /// The system role belongs to the built-in worker and is refused here
    fn actor(&self) -> Result<Actor, String> {
        if self.role == Role::System {
            return Err("role 'system' is reserved for the built-in worker".to_string());
        }
        Ok(Actor::new(self.actor.clone(), self.role))
    }
}

/// Query parameters for playbook listing
#[derive(Debug, Deserialize)]
struct PlaybooksQuery {
    status: Option<String>,
}

type ApiReply = WithStatus<Json>;

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> ApiReply {
    warp::reply::with_status(warp::reply::json(value), status)
}

fn status_for(error: &RemediationError) -> StatusCode {
    match error {
        RemediationError::PlaybookNotFound(_) => StatusCode::NOT_FOUND,
        RemediationError::PermissionDenied { .. } | RemediationError::SeparationOfDuties { .. } => {
            StatusCode::FORBIDDEN
        }
        RemediationError::PolicyViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RemediationError::ApprovalRequired { .. }
        | RemediationError::ApprovalExpired { .. }
        | RemediationError::DuplicateAction { .. }
        | RemediationError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RemediationError::CircuitOpenFailFast { .. } | RemediationError::QueueSaturated { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RemediationError::TransientExecutionFailure { .. }
        | RemediationError::PermanentExecutionFailure { .. }
        | RemediationError::AuditAppendFailure(_)
        | RemediationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: &RemediationError) -> ApiReply {
    json_reply(
        &serde_json::json!({
            "error": error.code(),
            "message": error.to_string(),
        }),
        status_for(error),
    )
}

fn bad_request(message: String) -> ApiReply {
    json_reply(
        &serde_json::json!({ "error": "BAD_REQUEST", "message": message }),
        StatusCode::BAD_REQUEST,
    )
}

/// Create HTTP API routes
pub fn create_api_routes(
    service: Arc<RemediationService>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let service_filter = warp::any().map(move || Arc::clone(&service));

    // GET /api/health
    let get_health = warp::path!("api" / "health")
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_health);

    // GET /api/playbooks?status=pending_approval
    let list_playbooks = warp::path!("api" / "playbooks")
        .and(warp::get())
        .and(warp::query::<PlaybooksQuery>())
        .and(service_filter.clone())
        .and_then(handle_list_playbooks);

    // GET /api/playbooks/:id
    let get_playbook = warp::path!("api" / "playbooks" / Uuid)
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_playbook);

    // GET /api/approvals/pending
    let get_pending = warp::path!("api" / "approvals" / "pending")
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_pending);

    // POST /api/requests - enqueue a remediation request
    let post_request = warp::path!("api" / "requests")
        .and(warp::post())
        .and(warp::body::json())
        .and(service_filter.clone())
        .and_then(handle_post_request);

    // POST /api/playbooks/:id/approve
    let post_approve = warp::path!("api" / "playbooks" / Uuid / "approve")
        .and(warp::post())
        .and(warp::body::json())
        .and(service_filter.clone())
        .and_then(handle_post_approve);

    // POST /api/playbooks/:id/reject
    let post_reject = warp::path!("api" / "playbooks" / Uuid / "reject")
        .and(warp::post())
        .and(warp::body::json())
        .and(service_filter.clone())
        .and_then(handle_post_reject);

    // POST /api/playbooks/:id/execute
    let post_execute = warp::path!("api" / "playbooks" / Uuid / "execute")
        .and(warp::post())
        .and(warp::body::json())
        .and(service_filter.clone())
        .and_then(handle_post_execute);

    // GET /api/audit?since=&until=&actor=&event_type=
    let get_audit = warp::path!("api" / "audit")
        .and(warp::get())
        .and(warp::query::<AuditFilter>())
        .and(service_filter.clone())
        .and_then(handle_get_audit);

    // GET /api/audit/verify
    let get_audit_verify = warp::path!("api" / "audit" / "verify")
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_audit_verify);

    // GET /api/circuits
    let get_circuits = warp::path!("api" / "circuits")
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_circuits);

    // GET /api/circuits/:target
    let get_circuit = warp::path!("api" / "circuits" / String)
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_circuit);

    // GET /api/status - queue, circuits, tracker and worker counters
    let get_status = warp::path!("api" / "status")
        .and(warp::get())
        .and(service_filter.clone())
        .and_then(handle_get_status);

    get_health
        .or(list_playbooks)
        .or(get_playbook)
        .or(get_pending)
        .or(post_request)
        .or(post_approve)
        .or(post_reject)
        .or(post_execute)
        .or(get_audit)
        .or(get_audit_verify)
        .or(get_circuits)
        .or(get_circuit)
        .or(get_status)
}

async fn handle_get_health(
    service: Arc<RemediationService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let status = service.status();
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth: status.queue.depth,
        running_tasks: status.running_tasks,
    };
    Ok(warp::reply::json(&response))
}

async fn handle_list_playbooks(
    query: PlaybooksQuery,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let status = match query.status.as_deref().map(str::parse::<PlaybookStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return Ok(bad_request(e)),
    };

    Ok(json_reply(
        &service.workflow().list_playbooks(status),
        StatusCode::OK,
    ))
}

async fn handle_get_playbook(
    playbook_id: Uuid,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let workflow = service.workflow();
    Ok(match workflow.get_playbook(playbook_id) {
        Ok(playbook) => json_reply(
            &serde_json::json!({
                "playbook": playbook,
                "approvals": workflow.approvals_for(playbook_id),
                "executions": workflow.executions_for(playbook_id),
            }),
            StatusCode::OK,
        ),
        Err(e) => error_reply(&e),
    })
}

async fn handle_get_pending(
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        &service.workflow().pending_approvals(),
        StatusCode::OK,
    ))
}

async fn handle_post_request(
    request: RemediationRequest,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let alert_id = request.alert_id.clone();
    Ok(match service.submit(request, None).await {
        Ok(()) => json_reply(
            &serde_json::json!({
                "status": "queued",
                "alert_id": alert_id,
                "queue": service.queue().metrics(),
            }),
            StatusCode::ACCEPTED,
        ),
        Err(e) => error_reply(&e),
    })
}

async fn handle_post_approve(
    playbook_id: Uuid,
    body: DecisionRequest,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let actor = match body.actor() {
        Ok(actor) => actor,
        Err(message) => return Ok(bad_request(message)),
    };
    Ok(
        match service
            .workflow()
            .approve(playbook_id, &actor, body.comment.clone())
        {
            Ok(outcome) => json_reply(&outcome, StatusCode::OK),
            Err(e) => error_reply(&e),
        },
    )
}

async fn handle_post_reject(
    playbook_id: Uuid,
    body: DecisionRequest,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let actor = match body.actor() {
        Ok(actor) => actor,
        Err(message) => return Ok(bad_request(message)),
    };
    Ok(
        match service
            .workflow()
            .reject(playbook_id, &actor, body.comment.clone())
        {
            Ok(outcome) => json_reply(&outcome, StatusCode::OK),
            Err(e) => error_reply(&e),
        },
    )
}

async fn handle_post_execute(
    playbook_id: Uuid,
    body: DecisionRequest,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    let actor = match body.actor() {
        Ok(actor) => actor,
        Err(message) => return Ok(bad_request(message)),
    };
    Ok(
        match service.workflow().execute(playbook_id, &actor).await {
            Ok(outcome) => json_reply(&outcome, StatusCode::OK),
            Err(e) => error_reply(&e),
        },
    )
}

async fn handle_get_audit(
    filter: AuditFilter,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(match service.workflow().audit().export(&filter) {
        Ok(entries) => json_reply(&entries, StatusCode::OK),
        Err(e) => error_reply(&RemediationError::Storage(e)),
    })
}

async fn handle_get_audit_verify(
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(match service.workflow().audit().verify() {
        Ok(result) if result.valid => json_reply(&result, StatusCode::OK),
        Ok(result) => json_reply(&result, StatusCode::CONFLICT),
        Err(e) => error_reply(&RemediationError::Storage(e)),
    })
}

async fn handle_get_circuits(
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        &service.workflow().circuit_snapshots(),
        StatusCode::OK,
    ))
}

async fn handle_get_circuit(
    target: String,
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(match service.workflow().circuit_snapshot(&target) {
        Some(snapshot) => json_reply(&snapshot, StatusCode::OK),
        None => json_reply(
            &serde_json::json!({
                "error": "Circuit not found",
                "target": target,
            }),
            StatusCode::NOT_FOUND,
        ),
    })
}

async fn handle_get_status(
    service: Arc<RemediationService>,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(&service.status(), StatusCode::OK))
}
