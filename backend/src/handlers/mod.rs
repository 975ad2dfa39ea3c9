use axum::{
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::automations::InvocationRequest;
use crate::error::{ApiResult, AppError};
use crate::AppState;
use relay_shared::{Run, StepDefinition, StepRecord};

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/automations/invoke", post(invoke_automation))
        .route("/runs/cancel", post(cancel_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/steps", get(list_run_steps))
}

/// Tenant scope for every automation endpoint, taken from the
/// `X-Tenant-Id` header.
pub struct Tenant(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| Tenant(v.to_string()))
            .ok_or_else(|| AppError::BadRequest("missing X-Tenant-Id header".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct InvokeBody {
    /// Stored automation template id or alias. When set, inline `steps`
    /// are ignored.
    pub automation: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    pub defaults: Option<Value>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub profile: Value,
    #[serde(default)]
    pub recipient: Value,
    /// Default message template for send steps, reachable from accessors
    /// as the `template` context member.
    #[serde(default)]
    pub template: Value,
    #[serde(default)]
    pub brand: Value,
    #[serde(default)]
    pub source: Vec<String>,
    pub cancelation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub run_id: Uuid,
}

async fn invoke_automation(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Json(body): Json<InvokeBody>,
) -> ApiResult<Json<InvokeResponse>> {
    if body.automation.is_none() && body.steps.is_empty() {
        return Err(AppError::BadRequest(
            "either 'automation' or 'steps' is required".to_string(),
        ));
    }

    let request = InvocationRequest {
        tenant_id,
        automation: body.automation,
        steps: body.steps,
        defaults: body.defaults,
        data: body.data,
        profile: body.profile,
        recipient: body.recipient,
        template: body.template,
        brand: body.brand,
        source: body.source,
        cancelation_token: body.cancelation_token,
    };
    let run_id = state.engine.invoke(request).await?;
    Ok(Json(InvokeResponse { run_id }))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub run_id: Option<Uuid>,
    pub cancelation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<CancelResponse>> {
    match (body.run_id, body.cancelation_token) {
        (Some(run_id), _) => {
            let canceled = state.engine.cancel_run(&tenant_id, run_id).await?;
            Ok(Json(CancelResponse {
                canceled,
                run_id: Some(run_id),
            }))
        }
        (None, Some(token)) => {
            let run_id = state.engine.cancel_by_token(&tenant_id, &token).await?;
            Ok(Json(CancelResponse {
                canceled: run_id.is_some(),
                run_id,
            }))
        }
        (None, None) => Err(AppError::BadRequest(
            "either 'run_id' or 'cancelation_token' is required".to_string(),
        )),
    }
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    let run = state.engine.run(&tenant_id, run_id).await?;
    Ok(Json(run))
}

async fn list_run_steps(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<Vec<StepRecord>>> {
    let steps = state.engine.run_steps(&tenant_id, run_id).await?;
    Ok(Json(steps))
}
