//! The request pipeline: correlation id, rate limit, idempotency cache,
//! authentication, payment gate. Stages are small functions composed as
//! axum middleware; each may short-circuit with a finished response.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use wordclaw_l402::Credential;

use crate::AppState;
use crate::api_envelope::{ApiError, EnvelopeMeta, ErrorCode};
use crate::auth::{AuthError, Principal, required_scope};
use crate::context::OpContext;
use crate::idempotency::{CachedResponse, IdempotencyCache};
use crate::payments::{PaymentError, PricedResource, effective_price};
use crate::policy::{DECISION_ALLOW, DECISION_DENY};
use crate::rate_limit::RateDecision;
use crate::store::OfferKind;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const PROPOSED_PRICE_HEADER: &str = "x-proposed-price-sats";
pub const AGENT_PROFILE_HEADER: &str = "x-agent-profile-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAY_HEADER: &str = "idempotent-replayed";
pub const PROVIDER_SIGNATURE_HEADER: &str = "x-provider-signature";

const BODY_LIMIT: usize = 1024 * 1024;

/// Correlation id as set by the request-id layer.
pub fn request_id_of(req_headers: &axum::http::HeaderMap) -> String {
    req_headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn caller_identity(req: &Request) -> String {
    let headers = req.headers();
    let presented_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().to_ascii_lowercase().starts_with("l402 "))
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok()));
    if let Some(key) = presented_key {
        return format!("key:{}", hex::encode(Sha256::digest(key.trim().as_bytes())));
    }
    let ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string())
        .unwrap_or_else(|| "local".to_string());
    format!("ip:{ip}")
}

fn is_mutating(method: &axum::http::Method) -> bool {
    matches!(
        method.as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

/// Stamp `context.requestId` into error envelopes on the way out.
pub async fn stamp_request_context(req: Request, next: Next) -> Response {
    let request_id = request_id_of(req.headers());
    let response = next.run(req).await;
    if response.status().is_success() || response.status().is_redirection() {
        return response;
    }
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, BODY_LIMIT).await else {
        return (parts.status, "").into_response();
    };
    let stamped = match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut value) if value.get("code").is_some() => {
            value["context"]["requestId"] = Value::String(request_id);
            serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec())
        }
        _ => bytes.to_vec(),
    };
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(stamped))
}

/// Per-identity rate limiting; per-key when a key is presented, per-IP
/// otherwise.
pub async fn rate_limit_stage(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let identity = caller_identity(&req);
    match state.rate_limiter.check(&identity, Utc::now()).await {
        RateDecision::Allowed => next.run(req).await,
        RateDecision::Limited {
            retry_after_seconds,
        } => {
            state
                .metrics
                .rate_limited_requests
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut response = ApiError::new(
                ErrorCode::RateLimitExceeded,
                "request rate limit exceeded",
            )
            .with_remediation(format!("Retry after {retry_after_seconds} seconds."))
            .with_details(json!({"retryAfterSeconds": retry_after_seconds}))
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Replay memoized responses for retried mutations; memoize fresh ones.
pub async fn idempotency_stage(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }
    let Some(idempotency_key) = req
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return next.run(req).await;
    };

    let identity = caller_identity(&req);
    let cache_key = IdempotencyCache::cache_key(
        &identity,
        req.method().as_str(),
        req.uri().path(),
        &idempotency_key,
    );

    if let Some(cached) = state.idempotency.get(&cache_key, Utc::now()).await {
        state
            .metrics
            .idempotent_replays
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut response = Response::builder()
            .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
        if let Some(content_type) = &cached.content_type {
            response = response.header(header::CONTENT_TYPE, content_type);
        }
        return response
            .header(IDEMPOTENT_REPLAY_HEADER, "true")
            .body(Body::from(cached.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let response = next.run(req).await;
    let status = response.status();
    let (parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, BODY_LIMIT).await else {
        return (status, "").into_response();
    };
    // 5xx responses are never memoized.
    if status.as_u16() < 500 {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        state
            .idempotency
            .put(
                cache_key,
                CachedResponse {
                    status: status.as_u16(),
                    body: bytes.to_vec(),
                    content_type,
                },
                Utc::now(),
            )
            .await;
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Authenticate the API key, derive the principal, enforce scope.
pub async fn auth_stage(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let request_id = request_id_of(req.headers());
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let trimmed = value.trim();
            trimmed
                .strip_prefix("Bearer ")
                .or_else(|| trimmed.strip_prefix("bearer "))
        })
        .map(|value| value.to_string())
        .or_else(|| {
            req.headers()
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
        });

    let Some(presented) = presented else {
        return ApiError::new(ErrorCode::AuthMissingApiKey, "no API key presented")
            .into_response();
    };

    let principal = match state.auth.authenticate(&presented).await {
        Ok(principal) => principal,
        Err(AuthError::MissingKey) => {
            return ApiError::new(ErrorCode::AuthMissingApiKey, "no API key presented")
                .into_response();
        }
        Err(AuthError::InvalidKey) => {
            return ApiError::new(
                ErrorCode::AuthInvalidApiKey,
                "API key is unknown, revoked, or expired",
            )
            .into_response();
        }
        Err(error) => {
            tracing::error!(reason = %error, "authentication backend failure");
            return ApiError::new(ErrorCode::DependencyUnavailable, "authentication unavailable")
                .into_response();
        }
    };

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    if let Some(scope) = required_scope(&method, &path) {
        if !principal.has_scope(scope) {
            state.policy.record(
                principal.tenant_id,
                &principal.actor_id,
                &format!("{method} {path}"),
                &path,
                DECISION_DENY,
                &format!("missing scope {scope}"),
                &request_id,
            );
            return ApiError::new(
                ErrorCode::AuthInsufficientScope,
                format!("operation requires the '{scope}' scope"),
            )
            .into_response();
        }
        if is_mutating(req.method()) {
            state.policy.record(
                principal.tenant_id,
                &principal.actor_id,
                &format!("{method} {path}"),
                &path,
                DECISION_ALLOW,
                &format!("scope {scope}"),
                &request_id,
            );
        }
    }

    req.extensions_mut().insert(principal);
    next.run(req).await
}

/// Payment gate: price the target resource, honor active entitlements,
/// verify presented L402 credentials, or answer with a 402 challenge.
pub async fn payment_gate_stage(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let proposed_price = req
        .headers()
        .get(PROPOSED_PRICE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok());
    let agent_profile_id = req
        .headers()
        .get(AGENT_PROFILE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| principal.actor_id.clone());
    let credential = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Credential::parse(Some(value)));
    let request_id = request_id_of(req.headers());
    let ctx = OpContext::new(request_id.clone());

    // Price the target. Only content-item paths are gated here; purchase
    // endpoints drive the same machinery explicitly.
    let (resource, req) = match price_request(&state, &principal, &method, &path, req).await {
        Ok((resource, req)) => (resource, req),
        Err(response) => return response,
    };
    let Some(mut resource) = resource else {
        return next.run(req).await;
    };
    resource.amount_sats = effective_price(resource.amount_sats, proposed_price);
    if resource.amount_sats <= 0 {
        return next.run(req).await;
    }

    // An active entitlement for the offer satisfies the gate; each pass
    // consumes one read.
    if credential.is_none() {
        match state
            .entitlements
            .find_active(
                principal.tenant_id,
                resource.offer_kind,
                resource.offer_id,
                &agent_profile_id,
            )
            .await
        {
            Ok(Some(grant)) => {
                match state.entitlements.consume(&grant, &ctx).await {
                    Ok(_) => {
                        // First fulfillment moves the backing payment to
                        // consumed; later passes are no-ops.
                        if let Err(error) = state
                            .payments
                            .mark_consumed(&grant.payment_hash, &request_id)
                            .await
                        {
                            tracing::debug!(reason = %error, "consumed mark skipped");
                        }
                        return next.run(req).await;
                    }
                    Err(error) => {
                        tracing::debug!(reason = %error, "entitlement consume refused; issuing challenge");
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(reason = %error, "entitlement lookup failed");
                return ApiError::new(
                    ErrorCode::DependencyUnavailable,
                    "entitlement ledger unavailable",
                )
                .into_response();
            }
        }
    }

    if let Some(credential) = credential {
        match state
            .payments
            .verify_and_redeem(
                &ctx,
                &credential.token,
                &credential.preimage,
                method.as_str(),
                &path,
                principal.tenant_id,
            )
            .await
        {
            Ok(redeemed) => {
                let response = next.run(req).await;
                if response.status().is_success() {
                    // First fulfillment: consume the payment and one read.
                    if let Some(entitlement) = &redeemed.entitlement {
                        if let Err(error) = state.entitlements.consume(entitlement, &ctx).await {
                            tracing::debug!(reason = %error, "post-fulfillment consume refused");
                        }
                    }
                    if let Err(error) = state
                        .payments
                        .mark_consumed(&redeemed.payment.payment_hash, &request_id)
                        .await
                    {
                        tracing::debug!(reason = %error, "consumed transition skipped");
                    }
                }
                return response;
            }
            Err(PaymentError::NotPaid) => {
                // Fall through to a fresh challenge below.
            }
            Err(error) => {
                let code = match &error {
                    PaymentError::TokenExpired => ErrorCode::PaymentExpired,
                    PaymentError::InvoiceExpired => ErrorCode::PaymentExpired,
                    PaymentError::Failed(_) => ErrorCode::PaymentFailed,
                    PaymentError::ProviderDown(_) => ErrorCode::DependencyUnavailable,
                    PaymentError::Store(_) => ErrorCode::DependencyUnavailable,
                    _ => ErrorCode::PaymentInvalidToken,
                };
                if matches!(
                    code,
                    ErrorCode::PaymentInvalidToken | ErrorCode::PaymentExpired | ErrorCode::PaymentFailed
                ) {
                    // Invalid or expired credentials get the same 402 with a
                    // fresh invoice.
                    return issue_challenge_response(
                        &state,
                        &principal,
                        &ctx,
                        method.as_str(),
                        &path,
                        &resource,
                        &agent_profile_id,
                        code,
                    )
                    .await;
                }
                return ApiError::new(code, error.to_string()).into_response();
            }
        }
    }

    issue_challenge_response(
        &state,
        &principal,
        &ctx,
        method.as_str(),
        &path,
        &resource,
        &agent_profile_id,
        ErrorCode::PaymentRequired,
    )
    .await
}

/// Decide whether this request targets a priced resource. Re-buffers the
/// body when it had to be read for pricing.
async fn price_request(
    state: &AppState,
    principal: &Principal,
    method: &axum::http::Method,
    path: &str,
    req: Request,
) -> Result<(Option<PricedResource>, Request), Response> {
    // Item creation: price comes from the item's type.
    if method == axum::http::Method::POST && path == "/api/v1/content-items" {
        let (parts, body) = req.into_parts();
        let Ok(bytes) = to_bytes(body, BODY_LIMIT).await else {
            return Err(
                ApiError::new(ErrorCode::InvalidRequest, "request body too large").into_response(),
            );
        };
        let content_type_id = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|value| {
                value
                    .get("contentTypeId")
                    .or_else(|| value.get("content_type_id"))
                    .and_then(Value::as_i64)
            });
        let req = Request::from_parts(parts, Body::from(bytes));

        let Some(content_type_id) = content_type_id else {
            return Ok((None, req));
        };
        let kind = state
            .content
            .get_type(principal, content_type_id)
            .await
            .ok();
        let resource = kind.and_then(|kind| {
            if kind.base_price_sats > 0 {
                Some(PricedResource {
                    offer_kind: OfferKind::ContentType,
                    offer_id: kind.id,
                    amount_sats: kind.base_price_sats,
                    grant_reads: Some(1),
                    grant_ttl_seconds: None,
                })
            } else {
                None
            }
        });
        return Ok((resource, req));
    }

    // Priced item reads.
    if method == axum::http::Method::GET {
        if let Some(item_id) = path
            .strip_prefix("/api/v1/content-items/")
            .and_then(|rest| rest.parse::<i64>().ok())
        {
            let Ok(item) = state.content.get_item(principal, item_id).await else {
                // Let the handler produce its uniform 404.
                return Ok((None, req));
            };
            let Ok(kind) = state.content.get_type(principal, item.content_type_id).await else {
                return Ok((None, req));
            };
            if kind.base_price_sats > 0 {
                return Ok((
                    Some(PricedResource {
                        offer_kind: OfferKind::ContentItem,
                        offer_id: item.id,
                        amount_sats: kind.base_price_sats,
                        grant_reads: Some(1),
                        grant_ttl_seconds: None,
                    }),
                    req,
                ));
            }
            return Ok((None, req));
        }
    }

    Ok((None, req))
}

#[allow(clippy::too_many_arguments)]
async fn issue_challenge_response(
    state: &AppState,
    principal: &Principal,
    ctx: &OpContext,
    method: &str,
    path: &str,
    resource: &PricedResource,
    agent_profile_id: &str,
    code: ErrorCode,
) -> Response {
    match state
        .payments
        .issue_challenge(principal, ctx, method, path, resource, agent_profile_id)
        .await
    {
        Ok(challenge) => {
            let error = ApiError::new(code, "payment required to access this resource")
                .with_details(json!({
                    "amountSatoshis": challenge.amount_sats,
                    "invoice": challenge.invoice,
                    "macaroon": challenge.macaroon,
                    "paymentHash": challenge.payment_hash,
                    "expiresAt": challenge.expires_at,
                }))
                .with_meta(EnvelopeMeta::next(
                    "pay the invoice, then retry with Authorization: L402 <macaroon>:<preimage>",
                ));
            let www = challenge.www_authenticate();
            let mut response = error.into_response();
            if let Ok(value) = HeaderValue::from_str(&www) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
            response
        }
        Err(error) => {
            tracing::error!(reason = %error, "challenge issuance failed");
            ApiError::new(
                ErrorCode::DependencyUnavailable,
                "payment provider unavailable",
            )
            .into_response()
        }
    }
}
