//! Wordclaw: a headless, payment-gated content runtime.
//!
//! The library assembles four subsystems behind one request pipeline:
//! the content lifecycle engine, the L402 payment state machine, the
//! entitlement/revenue ledger, and the audit/event plumbing. Protocol
//! facades (REST here, tool calls in [`rpc`]) translate onto the shared
//! operation set in [`ops`].

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod auth;
pub mod config;
pub mod content;
pub mod context;
pub mod db;
pub mod entitlements;
pub mod events;
pub mod idempotency;
pub mod metrics;
pub mod migrations;
pub mod ops;
pub mod payments;
pub mod pipeline;
pub mod policy;
pub mod provider;
pub mod rate_limit;
pub mod revenue;
pub mod rpc;
pub mod schema;
pub mod store;
pub mod webhooks;
pub mod workers;

#[cfg(test)]
mod tests;

use crate::api_envelope::{ApiError, EnvelopeMeta, ErrorCode, created, ok_data, ok_with_meta};
use crate::auth::{AuthService, Principal};
use crate::config::Config;
use crate::content::{
    BatchOperationInput, ContentService, CreateItemInput, CreateTypeInput, UpdateItemInput,
    UpdateTypeInput,
};
use crate::context::OpContext;
use crate::db::Db;
use crate::entitlements::{DelegateInput, EntitlementService};
use crate::events::EventBus;
use crate::idempotency::IdempotencyCache;
use crate::metrics::Metrics;
use crate::payments::{PaymentService, PricedResource, WebhookIngestError, WebhookIngestOutcome, effective_price};
use crate::pipeline::{
    AGENT_PROFILE_HEADER, PROPOSED_PRICE_HEADER, PROVIDER_SIGNATURE_HEADER, request_id_of,
};
use crate::policy::PolicyDecisionRecorder;
use crate::provider::PaymentProvider;
use crate::rate_limit::RateLimiter;
use crate::revenue::RevenueService;
use crate::schema::SchemaCache;
use crate::store::{
    AuditFilter, ContentItemFilter, ContentStatus, OfferKind, PaymentState, Store,
};
use crate::webhooks::{CreateWebhookInput, UpdateWebhookInput, WebhookService};

const SERVICE_NAME: &str = "wordclaw-service";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub db: Option<Db>,
    pub provider: Arc<dyn PaymentProvider>,
    pub auth: AuthService,
    pub content: ContentService,
    pub payments: PaymentService,
    pub entitlements: EntitlementService,
    pub revenue: RevenueService,
    pub webhooks: WebhookService,
    pub policy: PolicyDecisionRecorder,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: RateLimiter,
    pub idempotency: IdempotencyCache,
    pub started_at: SystemTime,
}

impl AppState {
    /// Assemble the state from explicit collaborators so tests can
    /// substitute fakes (memory store, mock provider).
    pub fn build(
        config: Config,
        store: Arc<dyn Store>,
        db: Option<Db>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let auth = AuthService::new(store.clone());
        let content = ContentService::new(store.clone(), SchemaCache::new(), bus.clone());
        let revenue = RevenueService::new(&config, store.clone(), bus.clone(), metrics.clone());
        let payments = PaymentService::new(
            &config,
            store.clone(),
            provider.clone(),
            revenue.clone(),
            bus.clone(),
            metrics.clone(),
        );
        let entitlements = EntitlementService::new(store.clone(), bus.clone(), metrics.clone());
        let webhooks = WebhookService::new(
            store.clone(),
            metrics.clone(),
            config.webhook_max_attempts,
            config.webhook_backoff_base_ms,
            config.webhook_backoff_cap_ms,
            config.webhook_timeout_ms,
        );
        let policy = PolicyDecisionRecorder::new(store.clone());
        let rate_limiter = RateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window_seconds,
        );
        let idempotency = IdempotencyCache::new(config.idempotency_ttl_seconds);

        Self {
            config: Arc::new(config),
            store,
            db,
            provider,
            auth,
            content,
            payments,
            entitlements,
            revenue,
            webhooks,
            policy,
            bus,
            metrics,
            rate_limiter,
            idempotency,
            started_at: SystemTime::now(),
        }
    }

    /// Spawn the event-bus subscriber that feeds webhook deliveries.
    pub fn spawn_webhook_dispatcher(&self) {
        let webhooks = self.webhooks.clone();
        let bus = self.bus.clone();
        tokio::spawn(webhooks.run_dispatcher(bus));
    }
}

pub fn build_router(state: AppState) -> Router {
    let request_timeout =
        std::time::Duration::from_secs(state.config.request_timeout_seconds.max(1));
    let public = Router::new()
        .route("/healthz", get(health))
        .route(
            "/api/v1/payments/webhooks/:provider",
            post(payment_settlement_webhook),
        )
        .with_state(state.clone());

    let protected = Router::new()
        .route("/api/v1/content-types", get(list_types).post(create_type))
        .route(
            "/api/v1/content-types/:id",
            get(get_type).put(update_type).delete(delete_type),
        )
        .route("/api/v1/content-items", get(list_items).post(create_item))
        .route(
            "/api/v1/content-items/:id",
            get(get_item).put(update_item).delete(delete_item),
        )
        .route("/api/v1/content-items/batch", post(batch_items))
        .route("/api/v1/content-items/:id/versions", get(list_versions))
        .route("/api/v1/content-items/:id/rollback", post(rollback_item))
        .route("/api/v1/webhooks", get(list_webhooks).post(create_webhook))
        .route(
            "/api/v1/webhooks/:id",
            get(get_webhook).put(update_webhook).delete(delete_webhook),
        )
        .route("/api/v1/auth/keys", get(list_keys).post(create_key))
        .route("/api/v1/auth/keys/:id/rotate", post(rotate_key))
        .route("/api/v1/auth/keys/:id/revoke", post(revoke_key))
        .route("/api/v1/audit-logs", get(list_audit_logs))
        .route("/api/v1/payments", get(list_payments))
        .route("/api/v1/payments/:id", get(get_payment))
        .route("/api/v1/offers/:id/purchase", post(purchase_offer))
        .route(
            "/api/v1/offers/:id/purchase/confirm",
            post(confirm_purchase),
        )
        .route("/api/v1/entitlements", get(list_entitlements))
        .route(
            "/api/v1/entitlements/:id",
            get(get_entitlement).delete(revoke_entitlement),
        )
        .route("/api/v1/entitlements/:id/delegate", post(delegate_entitlement))
        .route("/api/v1/revenue/allocations", get(list_allocations))
        .route("/api/v1/revenue/payouts", get(list_payout_batches))
        .route("/api/v1/policy-decisions", get(list_policy_decisions))
        .route("/mcp", post(rpc::tool_call))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::payment_gate_stage,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::auth_stage,
        ))
        .with_state(state.clone());

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::idempotency_stage,
        ))
        .layer(middleware::from_fn_with_state(
            state,
            pipeline::rate_limit_stage,
        ))
        .layer(middleware::from_fn(pipeline::stamp_request_context))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

#[derive(Debug, Deserialize, Default)]
struct MutationQuery {
    #[serde(default, alias = "dryRun")]
    dry_run: Option<bool>,
}

impl MutationQuery {
    fn ctx(&self, headers: &HeaderMap) -> OpContext {
        let request_id = request_id_of(headers);
        if self.dry_run.unwrap_or(false) {
            OpContext::dry_run(request_id)
        } else {
            OpContext::new(request_id)
        }
    }
}

fn agent_profile_of(headers: &HeaderMap, principal: &Principal) -> String {
    headers
        .get(AGENT_PROFILE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| principal.actor_id.clone())
}

async fn health(State(state): State<AppState>) -> Response {
    let uptime_seconds = state
        .started_at
        .elapsed()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => "ok",
            Err(_) => "unavailable",
        },
        None => "memory",
    };
    let status = if database == "unavailable" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime_seconds,
            "database": database,
            "payment_provider": state.payments.provider_name(),
            "metrics": state.metrics.snapshot(),
        })),
    )
        .into_response()
}

// --- Content types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTypeBody {
    name: String,
    #[serde(default)]
    slug: Option<String>,
    schema: Value,
    #[serde(default)]
    base_price: Option<i64>,
}

async fn create_type(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Query(query): Query<MutationQuery>,
    Json(body): Json<CreateTypeBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let row = state
        .content
        .create_type(
            &principal,
            &ctx,
            CreateTypeInput {
                name: body.name,
                slug: body.slug,
                schema: body.schema,
                base_price_sats: body.base_price,
            },
        )
        .await?;
    Ok(ok_with_meta(
        StatusCode::CREATED,
        json!(row),
        EnvelopeMeta::next("POST /api/v1/content-items to create items of this type"),
    )
    .into_response())
}

async fn list_types(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, ApiError> {
    let rows = state.content.list_types(&principal).await?;
    Ok(ok_data(json!(rows)).into_response())
}

async fn get_type(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let row = state.content.get_type(&principal, id).await?;
    Ok(ok_data(json!(row)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTypeBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    base_price: Option<i64>,
}

async fn update_type(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<MutationQuery>,
    Json(body): Json<UpdateTypeBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let row = state
        .content
        .update_type(
            &principal,
            &ctx,
            id,
            UpdateTypeInput {
                name: body.name,
                slug: body.slug,
                schema: body.schema,
                base_price_sats: body.base_price,
            },
        )
        .await?;
    Ok(ok_data(json!(row)).into_response())
}

async fn delete_type(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<MutationQuery>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    state.content.delete_type(&principal, &ctx, id).await?;
    Ok(ok_data(json!({"deleted": true})).into_response())
}

// --- Content items ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateItemBody {
    content_type_id: i64,
    data: Value,
    #[serde(default)]
    status: Option<String>,
}

async fn create_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Query(query): Query<MutationQuery>,
    Json(body): Json<CreateItemBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let row = state
        .content
        .create_item(
            &principal,
            &ctx,
            CreateItemInput {
                content_type_id: body.content_type_id,
                data: body.data,
                status: body.status,
            },
        )
        .await?;
    Ok(ok_with_meta(
        StatusCode::CREATED,
        json!(row),
        EnvelopeMeta::next(format!("GET /api/v1/content-items/{} to read it back", row.id)),
    )
    .into_response())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListItemsQuery {
    #[serde(default)]
    content_type_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_after: Option<String>,
    #[serde(default)]
    created_before: Option<String>,
    #[serde(default)]
    after_id: Option<i64>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    limit: Option<u32>,
}

fn parse_date_filter(
    raw: Option<&str>,
    code: ErrorCode,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|value| Some(value.with_timezone(&Utc)))
            .map_err(|_| {
                ApiError::new(code, format!("{field} is not a valid RFC 3339 timestamp"))
            }),
    }
}

async fn list_items(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListItemsQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(ContentStatus::parse(raw).ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidRequest, format!("unknown status '{raw}'"))
        })?),
    };
    let filter = ContentItemFilter {
        content_type_id: query.content_type_id,
        status,
        created_after: parse_date_filter(
            query.created_after.as_deref(),
            ErrorCode::InvalidCreatedAfter,
            "createdAfter",
        )?,
        created_before: parse_date_filter(
            query.created_before.as_deref(),
            ErrorCode::InvalidCreatedBefore,
            "createdBefore",
        )?,
        after_id: query.after_id,
        offset: query.offset,
        limit: query.limit.unwrap_or(0),
    };
    let rows = state.content.list_items(&principal, filter).await?;
    let next_cursor = rows.last().map(|row| row.id);
    Ok(ok_data(json!({"items": rows, "nextAfterId": next_cursor})).into_response())
}

async fn get_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let row = state.content.get_item(&principal, id).await?;
    Ok(ok_data(json!(row)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateItemBody {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    expected_version: Option<i64>,
}

async fn update_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<MutationQuery>,
    Json(body): Json<UpdateItemBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let row = state
        .content
        .update_item(
            &principal,
            &ctx,
            id,
            UpdateItemInput {
                data: body.data,
                status: body.status,
                expected_version: body.expected_version,
            },
        )
        .await?;
    Ok(ok_data(json!(row)).into_response())
}

async fn delete_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<MutationQuery>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    state.content.delete_item(&principal, &ctx, id).await?;
    Ok(ok_data(json!({"deleted": true})).into_response())
}

async fn list_versions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let rows = state.content.list_versions(&principal, id).await?;
    Ok(ok_data(json!(rows)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackBody {
    version: i64,
}

async fn rollback_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<MutationQuery>,
    Json(body): Json<RollbackBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let row = state
        .content
        .rollback_item(&principal, &ctx, id, body.version)
        .await?;
    Ok(ok_data(json!(row)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody {
    #[serde(default)]
    atomic: bool,
    operations: Vec<BatchEntryBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
enum BatchEntryBody {
    Create {
        content_type_id: i64,
        data: Value,
        #[serde(default)]
        status: Option<String>,
    },
    Update {
        id: i64,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        expected_version: Option<i64>,
    },
    Delete {
        id: i64,
    },
}

async fn batch_items(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Query(query): Query<MutationQuery>,
    Json(body): Json<BatchBody>,
) -> Result<Response, ApiError> {
    let ctx = query.ctx(&headers);
    let operations = body
        .operations
        .into_iter()
        .map(|entry| match entry {
            BatchEntryBody::Create {
                content_type_id,
                data,
                status,
            } => BatchOperationInput::Create(CreateItemInput {
                content_type_id,
                data,
                status,
            }),
            BatchEntryBody::Update {
                id,
                data,
                status,
                expected_version,
            } => BatchOperationInput::Update {
                id,
                patch: UpdateItemInput {
                    data,
                    status,
                    expected_version,
                },
            },
            BatchEntryBody::Delete { id } => BatchOperationInput::Delete { id },
        })
        .collect();

    let entries = state
        .content
        .batch(&principal, &ctx, operations, body.atomic)
        .await?;
    let results: Vec<Value> = entries
        .into_iter()
        .map(|entry| match entry.result {
            Ok(Some(row)) => {
                json!({"index": entry.index, "ok": true, "id": row.id, "version": row.version})
            }
            Ok(None) => json!({"index": entry.index, "ok": true}),
            Err(error) => {
                let api: ApiError = error.into();
                json!({
                    "index": entry.index,
                    "ok": false,
                    "code": api.code.as_str(),
                    "error": api.message,
                })
            }
        })
        .collect();
    Ok(ok_data(json!({"atomic": body.atomic, "results": results})).into_response())
}

// --- Webhook subscriptions ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebhookBody {
    url: String,
    event_patterns: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

async fn create_webhook(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateWebhookBody>,
) -> Result<Response, ApiError> {
    let row = state
        .webhooks
        .create(
            &principal,
            CreateWebhookInput {
                url: body.url,
                event_patterns: body.event_patterns,
                secret: body.secret,
                active: body.active,
            },
        )
        .await?;
    Ok(created(json!(row)).into_response())
}

async fn list_webhooks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, ApiError> {
    Ok(ok_data(json!(state.webhooks.list(&principal).await?)).into_response())
}

async fn get_webhook(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    Ok(ok_data(json!(state.webhooks.get(&principal, id).await?)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWebhookBody {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    event_patterns: Option<Vec<String>>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

async fn update_webhook(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateWebhookBody>,
) -> Result<Response, ApiError> {
    let row = state
        .webhooks
        .update(
            &principal,
            id,
            UpdateWebhookInput {
                url: body.url,
                event_patterns: body.event_patterns,
                secret: body.secret,
                active: body.active,
            },
        )
        .await?;
    Ok(ok_data(json!(row)).into_response())
}

async fn delete_webhook(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    state.webhooks.delete(&principal, id).await?;
    Ok(ok_data(json!({"deleted": true})).into_response())
}

// --- API keys ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn create_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response, ApiError> {
    let issued = state
        .auth
        .issue_key(
            principal.tenant_id,
            body.name,
            body.scopes,
            body.ttl_seconds,
            &principal.actor_id,
        )
        .await
        .map_err(auth_to_api_error)?;
    Ok(ok_with_meta(
        StatusCode::CREATED,
        json!(issued),
        EnvelopeMeta::next("store the secret now; it is never shown again"),
    )
    .into_response())
}

async fn list_keys(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, ApiError> {
    let keys = state
        .auth
        .list_keys(principal.tenant_id)
        .await
        .map_err(auth_to_api_error)?;
    Ok(ok_data(json!(keys)).into_response())
}

async fn rotate_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let rotated = state
        .auth
        .rotate_key(principal.tenant_id, id)
        .await
        .map_err(auth_to_api_error)?
        .ok_or_else(|| ApiError::new(ErrorCode::ApiKeyNotFound, "API key not found"))?;
    Ok(ok_with_meta(
        StatusCode::OK,
        json!(rotated),
        EnvelopeMeta::next("store the fresh secret; the old one is now invalid"),
    )
    .into_response())
}

async fn revoke_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let revoked = state
        .auth
        .revoke_key(principal.tenant_id, id)
        .await
        .map_err(auth_to_api_error)?
        .ok_or_else(|| ApiError::new(ErrorCode::ApiKeyNotFound, "API key not found"))?;
    Ok(ok_data(json!(revoked)).into_response())
}

fn auth_to_api_error(error: auth::AuthError) -> ApiError {
    tracing::error!(reason = %error, "auth backend failure");
    ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
}

// --- Audit logs ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AuditLogQuery {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    before_id: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Response, ApiError> {
    let action = match query.action.as_deref() {
        None => None,
        Some(raw) => Some(crate::store::AuditAction::parse(raw).ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidRequest, format!("unknown action '{raw}'"))
        })?),
    };
    let rows = state
        .store
        .list_audit_logs(
            principal.tenant_id,
            &AuditFilter {
                action,
                entity_type: query.entity_type,
                before_id: query.before_id,
                limit: query.limit.unwrap_or(50).clamp(1, 200),
            },
        )
        .await
        .map_err(store_to_api_error)?;
    let next_cursor = rows.last().map(|row| row.id);
    Ok(ok_data(json!({"logs": rows, "nextBeforeId": next_cursor})).into_response())
}

fn store_to_api_error(error: crate::store::StoreError) -> ApiError {
    tracing::error!(reason = %error, "store failure");
    ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
}

// --- Payments ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PaymentListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    before_id: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_payments(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PaymentListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(PaymentState::parse(raw).ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidRequest, format!("unknown status '{raw}'"))
        })?),
    };
    let rows = state
        .payments
        .list(
            &principal,
            status,
            query.before_id,
            query.limit.unwrap_or(50).clamp(1, 200),
        )
        .await?;
    Ok(ok_data(json!(rows)).into_response())
}

async fn get_payment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let payment = state
        .payments
        .get(&principal, id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::PaymentNotFound, "payment not found"))?;
    Ok(ok_data(json!(payment)).into_response())
}

async fn payment_settlement_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_of(&headers);
    let signature = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    match state
        .payments
        .ingest_webhook(&provider, signature, &body, &request_id)
        .await
    {
        Ok(WebhookIngestOutcome::Applied(status)) => {
            ok_data(json!({"outcome": "applied", "status": status.as_str()})).into_response()
        }
        Ok(WebhookIngestOutcome::Replay) => {
            ok_data(json!({"outcome": "replay"})).into_response()
        }
        Ok(WebhookIngestOutcome::Ignored { from }) => {
            ok_data(json!({"outcome": "ignored", "currentStatus": from.as_str()})).into_response()
        }
        Err(WebhookIngestError::BadSignature) => ApiError::new(
            ErrorCode::AuthInvalidApiKey,
            "settlement signature missing or invalid",
        )
        .into_response(),
        Err(WebhookIngestError::BadPayload(reason)) => {
            ApiError::new(ErrorCode::InvalidRequest, reason).into_response()
        }
        Err(WebhookIngestError::UnknownPayment) => {
            ApiError::new(ErrorCode::PaymentNotFound, "unknown payment hash").into_response()
        }
        Err(WebhookIngestError::NotConfigured) => ApiError::new(
            ErrorCode::DependencyUnavailable,
            "settlement webhook secret is not configured",
        )
        .into_response(),
        Err(WebhookIngestError::Store(error)) => {
            tracing::error!(reason = %error, "settlement ingest store failure");
            ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable").into_response()
        }
    }
}

// --- Offers (L402 purchase flow) ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PurchaseBody {
    #[serde(default)]
    reads: Option<i64>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    amount_sats: Option<i64>,
}

async fn purchase_offer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(offer_id): Path<i64>,
    body: Option<Json<PurchaseBody>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let ctx = OpContext::new(request_id_of(&headers));
    let agent_profile_id = agent_profile_of(&headers, &principal);

    let item = state
        .content
        .get_item(&principal, offer_id)
        .await
        .map_err(|_| ApiError::new(ErrorCode::OfferNotFound, "offer not found"))?;
    let kind = state.content.get_type(&principal, item.content_type_id).await?;

    let proposed = headers
        .get(PROPOSED_PRICE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .or(body.amount_sats);
    let amount_sats = effective_price(kind.base_price_sats, proposed);
    if amount_sats <= 0 {
        return Err(ApiError::new(
            ErrorCode::InvalidRequest,
            "offer has no price; read it directly",
        ));
    }

    let path = format!("/api/v1/offers/{offer_id}/purchase");
    let challenge = state
        .payments
        .issue_challenge(
            &principal,
            &ctx,
            "POST",
            &path,
            &PricedResource {
                offer_kind: OfferKind::ContentItem,
                offer_id,
                amount_sats,
                grant_reads: body.reads,
                grant_ttl_seconds: body.ttl_seconds,
            },
            &agent_profile_id,
        )
        .await?;

    let error = ApiError::new(ErrorCode::PaymentRequired, "pay the invoice to purchase this offer")
        .with_details(json!({
            "amountSatoshis": challenge.amount_sats,
            "invoice": challenge.invoice,
            "macaroon": challenge.macaroon,
            "paymentHash": challenge.payment_hash,
            "expiresAt": challenge.expires_at,
        }))
        .with_meta(EnvelopeMeta::next(format!(
            "POST /api/v1/offers/{offer_id}/purchase/confirm with the macaroon and preimage"
        )));
    let www = challenge.www_authenticate();
    let mut response = error.into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&www) {
        response
            .headers_mut()
            .insert(axum::http::header::WWW_AUTHENTICATE, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmPurchaseBody {
    #[serde(alias = "token")]
    macaroon: String,
    preimage: String,
}

async fn confirm_purchase(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(offer_id): Path<i64>,
    Json(body): Json<ConfirmPurchaseBody>,
) -> Result<Response, ApiError> {
    let ctx = OpContext::new(request_id_of(&headers));
    let purchase_path = format!("/api/v1/offers/{offer_id}/purchase");
    let redeemed = state
        .payments
        .verify_and_redeem(
            &ctx,
            &body.macaroon,
            &body.preimage,
            "POST",
            &purchase_path,
            principal.tenant_id,
        )
        .await?;
    Ok(ok_with_meta(
        StatusCode::OK,
        json!({
            "payment": redeemed.payment,
            "entitlement": redeemed.entitlement,
        }),
        EnvelopeMeta::next(format!(
            "GET /api/v1/content-items/{offer_id} to read the purchased content"
        )),
    )
    .into_response())
}

// --- Entitlements ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EntitlementListQuery {
    #[serde(default)]
    agent_profile_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_entitlements(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<EntitlementListQuery>,
) -> Result<Response, ApiError> {
    let rows = state
        .entitlements
        .list(
            &principal,
            query.agent_profile_id.as_deref(),
            query.limit.unwrap_or(50),
        )
        .await?;
    Ok(ok_data(json!(rows)).into_response())
}

async fn get_entitlement(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    Ok(ok_data(json!(state.entitlements.get(&principal, id).await?)).into_response())
}

async fn revoke_entitlement(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let ctx = OpContext::new(request_id_of(&headers));
    let row = state.entitlements.revoke(&principal, &ctx, id).await?;
    Ok(ok_data(json!(row)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateBody {
    agent_profile_id: String,
    #[serde(default)]
    reads: Option<i64>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn delegate_entitlement(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<DelegateBody>,
) -> Result<Response, ApiError> {
    let ctx = OpContext::new(request_id_of(&headers));
    let child = state
        .entitlements
        .delegate(
            &principal,
            &ctx,
            DelegateInput {
                parent_id: id,
                agent_profile_id: body.agent_profile_id,
                reads: body.reads,
                ttl_seconds: body.ttl_seconds,
            },
        )
        .await?;
    Ok(created(json!(child)).into_response())
}

// --- Revenue introspection ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AllocationQuery {
    #[serde(default)]
    payment_hash: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_allocations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<AllocationQuery>,
) -> Result<Response, ApiError> {
    let rows = state
        .revenue
        .list_allocations(
            principal.tenant_id,
            query.payment_hash.as_deref(),
            query.limit.unwrap_or(50).clamp(1, 200),
        )
        .await
        .map_err(store_to_api_error)?;
    Ok(ok_data(json!(rows)).into_response())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PayoutQuery {
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_payout_batches(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PayoutQuery>,
) -> Result<Response, ApiError> {
    let batches = state
        .revenue
        .list_batches(principal.tenant_id, query.limit.unwrap_or(20).clamp(1, 100))
        .await
        .map_err(store_to_api_error)?;
    let rows: Vec<Value> = batches
        .into_iter()
        .map(|(batch, transfers)| json!({"batch": batch, "transfers": transfers}))
        .collect();
    Ok(ok_data(json!(rows)).into_response())
}

// --- Policy decisions ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PolicyDecisionQuery {
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_policy_decisions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PolicyDecisionQuery>,
) -> Result<Response, ApiError> {
    let rows = state
        .policy
        .list(principal.tenant_id, query.limit.unwrap_or(50))
        .await
        .map_err(store_to_api_error)?;
    Ok(ok_data(json!(rows)).into_response())
}
