//! MCP-style facade: tool calls over a single POST endpoint, translated
//! onto the shared operation set with the same envelopes and codes the
//! REST surface uses.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::api_envelope::{ApiError, EnvelopeMeta, ErrorCode, ok_with_meta};
use crate::auth::Principal;
use crate::context::OpContext;
use crate::ops::{self, OPERATIONS};
use crate::pipeline::request_id_of;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(alias = "method")]
    tool: String,
    #[serde(default, alias = "params")]
    arguments: Value,
    #[serde(default)]
    dry_run: bool,
}

pub async fn tool_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    principal: axum::Extension<Principal>,
    Json(request): Json<ToolCallRequest>,
) -> Response {
    let request_id = request_id_of(&headers);
    let ctx = if request.dry_run {
        OpContext::dry_run(request_id)
    } else {
        OpContext::new(request_id)
    };

    if request.tool == "tools/list" {
        let tools: Vec<Value> = OPERATIONS
            .iter()
            .map(|(name, scope)| json!({"name": name, "requiredScope": scope}))
            .collect();
        return ok_with_meta(
            axum::http::StatusCode::OK,
            json!({"tools": tools}),
            EnvelopeMeta::next("call any listed tool with {\"tool\": ..., \"arguments\": ...}"),
        )
        .into_response();
    }

    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments
    };
    if !arguments.is_object() {
        return ApiError::new(
            ErrorCode::InvalidRequest,
            "arguments must be a JSON object",
        )
        .into_response();
    }

    match ops::dispatch(&state, &principal.0, &ctx, &request.tool, arguments).await {
        Ok(result) => ok_with_meta(
            axum::http::StatusCode::OK,
            json!({"tool": request.tool, "result": result}),
            EnvelopeMeta::default(),
        )
        .into_response(),
        Err(error) => error.into_response(),
    }
}
