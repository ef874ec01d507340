use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::config::Config;
use crate::payments::sign_hmac_hex;
use crate::provider::MockPaymentProvider;
use crate::store::Store as _;
use crate::{AppState, build_router, store};

struct TestApp {
    router: Router,
    state: AppState,
    provider: Arc<MockPaymentProvider>,
    admin_key: String,
    tenant_id: i64,
}

async fn test_app() -> TestApp {
    test_app_with_config(Config::for_tests()).await
}

async fn test_app_with_config(config: Config) -> TestApp {
    let store = store::memory();
    let provider = Arc::new(MockPaymentProvider::new());
    let state = AppState::build(config, store, None, provider.clone());
    let (tenant, issued) = state
        .auth
        .bootstrap_tenant("Acme", "acme")
        .await
        .expect("bootstrap tenant");
    TestApp {
        router: build_router(state.clone()),
        state,
        provider,
        admin_key: issued.secret,
        tenant_id: tenant.id,
    }
}

impl TestApp {
    async fn second_tenant(&self) -> (i64, String) {
        let (tenant, issued) = self
            .state
            .auth
            .bootstrap_tenant("Rival", "rival")
            .await
            .expect("bootstrap second tenant");
        (tenant.id, issued.secret)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body, headers)
    }
}

fn request(method: &str, path: &str, key: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-api-key", key);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    builder
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .expect("request")
}

async fn create_blog_type(app: &TestApp, base_price: i64, slug: &str) -> i64 {
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types",
            &app.admin_key,
            Some(json!({
                "name": "Blog Post",
                "slug": slug,
                "schema": {
                    "type": "object",
                    "required": ["title"],
                    "properties": {"title": {"type": "string"}}
                },
                "basePrice": base_price,
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "type creation failed: {body}");
    body["data"]["id"].as_i64().expect("type id")
}

async fn create_item(app: &TestApp, type_id: i64, title: &str) -> i64 {
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items",
            &app.admin_key,
            Some(json!({"contentTypeId": type_id, "data": {"title": title}})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "item creation failed: {body}");
    body["data"]["id"].as_i64().expect("item id")
}

#[tokio::test]
async fn health_reports_ok_with_memory_store() {
    let app = test_app().await;
    let (status, body, _) = app
        .send(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "wordclaw-service");
    assert_eq!(body["database"], "memory");
    assert!(body["metrics"].is_object());
}

#[tokio::test]
async fn create_type_create_item_update_rollback_round_trip() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items",
            &app.admin_key,
            Some(json!({"contentTypeId": type_id, "data": {"title": "v1"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let item_id = body["data"]["id"].as_i64().expect("id");
    assert_eq!(body["data"]["version"], 1);

    let (status, body, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-items/{item_id}"),
            &app.admin_key,
            Some(json!({"data": {"title": "v2"}, "status": "published"})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 2);
    assert_eq!(body["data"]["status"], "published");

    // An audit record with action "update" now exists.
    let (status, body, _) = app
        .send(request(
            "GET",
            "/api/v1/audit-logs?action=update",
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        body["data"]["logs"]
            .as_array()
            .is_some_and(|logs| !logs.is_empty())
    );

    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/content-items/{item_id}/rollback"),
            &app.admin_key,
            Some(json!({"version": 1})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 3);
    assert_eq!(body["data"]["data"]["title"], "v1");

    // Version history is gapless: snapshots 1 and 2 plus live head 3.
    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/content-items/{item_id}/versions"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let versions: Vec<i64> = body["data"]
        .as_array()
        .expect("versions")
        .iter()
        .map(|v| v["version"].as_i64().expect("version"))
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn schema_validation_failure_is_a_422_with_pointer() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items",
            &app.admin_key,
            Some(json!({"contentTypeId": type_id, "data": {}})),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "CONTENT_SCHEMA_VALIDATION_FAILED");
    assert!(
        body["remediation"]
            .as_str()
            .is_some_and(|r| r.contains("title"))
    );
    assert_eq!(body["details"]["violations"][0]["pointer"], "/title");
}

#[tokio::test]
async fn invalid_schema_json_and_slug_conflicts_are_rejected() {
    let app = test_app().await;

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types",
            &app.admin_key,
            Some(json!({"name": "Broken", "schema": "{not json"})),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CONTENT_SCHEMA_JSON");

    create_blog_type(&app, 0, "blog-post").await;
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types",
            &app.admin_key,
            Some(json!({
                "name": "Blog Post",
                "slug": "blog-post",
                "schema": {"type": "object"},
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONTENT_TYPE_SLUG_CONFLICT");
}

#[tokio::test]
async fn payment_challenge_and_settlement_flow() {
    let app = test_app().await;
    let priced_type = create_blog_type(&app, 500, "paid-post").await;

    // No credential: 402 challenge with macaroon and invoice.
    let (status, body, headers) = app
        .send(request(
            "POST",
            "/api/v1/content-items",
            &app.admin_key,
            Some(json!({"contentTypeId": priced_type, "data": {"title": "paid"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_REQUIRED");
    assert_eq!(body["details"]["amountSatoshis"], 500);
    let macaroon = body["details"]["macaroon"].as_str().expect("macaroon").to_string();
    let payment_hash = body["details"]["paymentHash"]
        .as_str()
        .expect("payment hash")
        .to_string();
    let www = headers
        .get("www-authenticate")
        .and_then(|value| value.to_str().ok())
        .expect("www-authenticate");
    assert!(www.starts_with("L402 macaroon=\""));
    assert!(www.contains("invoice=\""));

    // Pay the invoice, then retry with the L402 credential.
    let preimage = app
        .provider
        .settle(&payment_hash)
        .await
        .expect("settle invoice");
    let retry = Request::builder()
        .method("POST")
        .uri("/api/v1/content-items")
        .header("x-api-key", &app.admin_key)
        .header("authorization", format!("L402 {macaroon}:{preimage}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"contentTypeId": priced_type, "data": {"title": "paid"}}).to_string(),
        ))
        .expect("request");
    let (status, body, _) = app.send(retry).await;
    assert_eq!(status, StatusCode::CREATED, "gated retry failed: {body}");

    // Payment settled and was consumed by the fulfilled call; the
    // entitlement was activated on the way.
    let payment = app
        .state
        .store
        .get_payment_by_hash(&payment_hash)
        .await
        .expect("get payment")
        .expect("payment row");
    assert_eq!(payment.status, crate::store::PaymentState::Consumed);
    assert!(payment.settled_at.is_some());
    let entitlement = app
        .state
        .store
        .get_entitlement_by_payment_hash(&payment_hash)
        .await
        .expect("get entitlement")
        .expect("entitlement row");
    assert!(entitlement.activated_at.is_some());
}

#[tokio::test]
async fn invalid_l402_credential_gets_a_fresh_challenge() {
    let app = test_app().await;
    let priced_type = create_blog_type(&app, 500, "paid-post").await;

    let retry = Request::builder()
        .method("POST")
        .uri("/api/v1/content-items")
        .header("x-api-key", &app.admin_key)
        .header("authorization", "L402 v1.garbage.token:00ff")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"contentTypeId": priced_type, "data": {"title": "x"}}).to_string(),
        ))
        .expect("request");
    let (status, body, headers) = app.send(retry).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_INVALID_TOKEN");
    // The rejection still carries a fresh invoice to pay.
    assert!(body["details"]["invoice"].as_str().is_some());
    assert!(headers.contains_key("www-authenticate"));
}

#[tokio::test]
async fn idempotent_retry_replays_the_same_body() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;

    let make = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/content-items")
            .header("x-api-key", &app.admin_key)
            .header("idempotency-key", "k1")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"contentTypeId": type_id, "data": {"title": "once"}}).to_string(),
            ))
            .expect("request")
    };

    let (status, first_body, first_headers) = app.send(make()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!first_headers.contains_key("idempotent-replayed"));

    let (status, second_body, second_headers) = app.send(make()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second_headers.get("idempotent-replayed").map(|v| v.to_str().ok()), Some(Some("true")));
    assert_eq!(first_body, second_body);

    // Only one row exists in storage.
    let (status, body, _) = app
        .send(request("GET", "/api/v1/content-items", &app.admin_key, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn cross_tenant_reads_return_uniform_404() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;
    let item_id = create_item(&app, type_id, "mine").await;
    let (_, rival_key) = app.second_tenant().await;

    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/content-items/{item_id}"),
            &rival_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CONTENT_ITEM_NOT_FOUND");

    // Mutations across the boundary are equally invisible.
    let (status, body, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-items/{item_id}"),
            &rival_key,
            Some(json!({"data": {"title": "stolen"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CONTENT_ITEM_NOT_FOUND");
}

#[tokio::test]
async fn settlement_webhook_applies_once_and_replays_are_no_ops() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 500, "paid-post").await;

    // Kick off a challenge to get a pending payment row.
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items",
            &app.admin_key,
            Some(json!({"contentTypeId": type_id, "data": {"title": "x"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let payment_hash = body["details"]["paymentHash"]
        .as_str()
        .expect("hash")
        .to_string();

    let event = json!({
        "eventId": "e1",
        "paymentHash": payment_hash,
        "status": "paid",
    })
    .to_string();
    let signature = sign_hmac_hex("webhook-test-secret", event.as_bytes());
    let deliver = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/payments/webhooks/mock")
            .header("content-type", "application/json")
            .header("x-provider-signature", &signature)
            .body(Body::from(event.clone()))
            .expect("request")
    };

    let (status, body, _) = app.send(deliver()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "applied");

    let (status, body, _) = app.send(deliver()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "replay");

    let payment = app
        .state
        .store
        .get_payment_by_hash(&payment_hash)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(payment.status, crate::store::PaymentState::Paid);

    // Exactly one revenue event's allocations despite the replay.
    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/revenue/allocations?paymentHash={payment_hash}"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let allocations = body["data"].as_array().expect("allocations");
    assert_eq!(allocations.len(), 2);
    let total: i64 = allocations
        .iter()
        .map(|a| a["amount_sats"].as_i64().expect("sats"))
        .sum();
    assert_eq!(total, 500);
}

#[tokio::test]
async fn settlement_webhook_rejects_bad_signatures() {
    let app = test_app().await;
    let event = json!({"eventId": "e1", "paymentHash": "x", "status": "paid"}).to_string();
    let deliver = Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhooks/mock")
        .header("content-type", "application/json")
        .header("x-provider-signature", "deadbeef")
        .body(Body::from(event))
        .expect("request");
    let (status, body, _) = app.send(deliver).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID_API_KEY");
}

#[tokio::test]
async fn offer_purchase_confirm_and_quota_bounded_reads() {
    let app = test_app().await;
    let free_type = create_blog_type(&app, 0, "draft-post").await;
    let item_id = create_item(&app, free_type, "premium").await;
    // Price the type after creating the item: reads are now gated.
    let (status, _, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-types/{free_type}"),
            &app.admin_key,
            Some(json!({"basePrice": 300})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Purchase with a two-read grant.
    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/offers/{item_id}/purchase"),
            &app.admin_key,
            Some(json!({"reads": 2})),
        ))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["details"]["amountSatoshis"], 300);
    let macaroon = body["details"]["macaroon"].as_str().expect("macaroon").to_string();
    let payment_hash = body["details"]["paymentHash"]
        .as_str()
        .expect("hash")
        .to_string();

    let preimage = app.provider.settle(&payment_hash).await.expect("settle");
    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/offers/{item_id}/purchase/confirm"),
            &app.admin_key,
            Some(json!({"macaroon": macaroon, "preimage": preimage})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "confirm failed: {body}");
    assert_eq!(body["data"]["entitlement"]["status"], "active");
    assert_eq!(body["data"]["entitlement"]["remaining_reads"], 2);

    // Two entitled reads succeed, the third is challenged again.
    for _ in 0..2 {
        let (status, _, _) = app
            .send(request(
                "GET",
                &format!("/api/v1/content-items/{item_id}"),
                &app.admin_key,
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/content-items/{item_id}"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_REQUIRED");

    // The quota-bounded entitlement is now exhausted.
    let entitlement = app
        .state
        .store
        .get_entitlement_by_payment_hash(&payment_hash)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(entitlement.status, crate::store::EntitlementState::Exhausted);
    assert_eq!(entitlement.remaining_reads, Some(0));
}

#[tokio::test]
async fn auth_rejects_missing_invalid_and_underscoped_keys() {
    let app = test_app().await;

    let (status, body, _) = app
        .send(
            Request::builder()
                .method("GET")
                .uri("/api/v1/content-types")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_MISSING_API_KEY");

    let (status, body, _) = app
        .send(request("GET", "/api/v1/content-types", "wc_sk_nope", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID_API_KEY");

    // A read-only key cannot write.
    let limited = app
        .state
        .auth
        .issue_key(
            app.tenant_id,
            "reader".to_string(),
            vec!["content:read".to_string()],
            None,
            "test",
        )
        .await
        .expect("issue key");
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types",
            &limited.secret,
            Some(json!({"name": "X", "schema": {"type": "object"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "AUTH_INSUFFICIENT_SCOPE");
}

#[tokio::test]
async fn key_rotation_returns_fresh_secret_and_revokes_old() {
    let app = test_app().await;
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/auth/keys",
            &app.admin_key,
            Some(json!({"name": "ci", "scopes": ["content:read"]})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let key_id = body["data"]["key"]["id"].as_i64().expect("key id");
    let old_secret = body["data"]["secret"].as_str().expect("secret").to_string();

    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/auth/keys/{key_id}/rotate"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let new_secret = body["data"]["secret"].as_str().expect("secret").to_string();
    assert_ne!(old_secret, new_secret);

    let (status, _, _) = app
        .send(request("GET", "/api/v1/content-types", &old_secret, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = app
        .send(request("GET", "/api/v1/content-types", &new_secret, None))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Listing never exposes secrets, only prefixes.
    let (status, body, _) = app
        .send(request("GET", "/api/v1/auth/keys", &app.admin_key, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    for key in body["data"].as_array().expect("keys") {
        assert!(key.get("secret").is_none());
        assert!(key.get("secret_hash").is_none());
        assert!(key["prefix"].as_str().is_some_and(|p| p.len() <= 12));
    }
}

#[tokio::test]
async fn rate_limit_returns_429_with_retry_hint() {
    let mut config = Config::for_tests();
    config.rate_limit_max_requests = 2;
    let app = test_app_with_config(config).await;

    for _ in 0..2 {
        let (status, _, _) = app
            .send(request("GET", "/api/v1/content-types", &app.admin_key, None))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body, headers) = app
        .send(request("GET", "/api/v1/content-types", &app.admin_key, None))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn error_envelopes_carry_the_correlation_id() {
    let app = test_app().await;
    let mut req = request("GET", "/api/v1/content-items/99999", &app.admin_key, None);
    req.headers_mut().insert(
        "x-request-id",
        axum::http::HeaderValue::from_static("req-carried-1"),
    );
    let (status, body, headers) = app.send(req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["context"]["requestId"], "req-carried-1");
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-carried-1")
    );
    assert!(body["remediation"].as_str().is_some());
}

#[tokio::test]
async fn empty_update_and_version_conflicts_are_structured() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;
    let item_id = create_item(&app, type_id, "v1").await;

    let (status, body, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-items/{item_id}"),
            &app.admin_key,
            Some(json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "EMPTY_UPDATE_BODY");

    let (status, body, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-items/{item_id}"),
            &app.admin_key,
            Some(json!({"data": {"title": "v2"}, "expectedVersion": 9})),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "VERSION_CONFLICT");
    assert_eq!(body["details"]["headVersion"], 1);

    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/content-items/{item_id}/rollback"),
            &app.admin_key,
            Some(json!({"version": 42})),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "TARGET_VERSION_NOT_FOUND");
}

#[tokio::test]
async fn list_filters_validate_dates_and_paginate() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;
    for index in 0..3 {
        create_item(&app, type_id, &format!("post {index}")).await;
    }

    let (status, body, _) = app
        .send(request(
            "GET",
            "/api/v1/content-items?createdAfter=not-a-date",
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CREATED_AFTER");

    let (status, body, _) = app
        .send(request(
            "GET",
            "/api/v1/content-items?limit=2",
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"]["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    let cursor = body["data"]["nextAfterId"].as_i64().expect("cursor");

    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/content-items?afterId={cursor}"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn dry_run_mutations_write_nothing() {
    let app = test_app().await;
    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types?dry_run=true",
            &app.admin_key,
            Some(json!({"name": "Draft", "schema": {"type": "object"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], 0);

    let (status, body, _) = app
        .send(request("GET", "/api/v1/content-types", &app.admin_key, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().expect("types").is_empty());
}

#[tokio::test]
async fn batch_reports_per_item_outcomes_and_atomicity() {
    let app = test_app().await;
    let type_id = create_blog_type(&app, 0, "blog-post").await;

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items/batch",
            &app.admin_key,
            Some(json!({
                "atomic": false,
                "operations": [
                    {"op": "create", "contentTypeId": type_id, "data": {"title": "a"}},
                    {"op": "create", "contentTypeId": type_id, "data": {}},
                ],
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["data"]["results"].as_array().expect("results");
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[1]["ok"], false);
    assert_eq!(results[1]["code"], "CONTENT_SCHEMA_VALIDATION_FAILED");

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/content-items/batch",
            &app.admin_key,
            Some(json!({
                "atomic": true,
                "operations": [
                    {"op": "create", "contentTypeId": type_id, "data": {"title": "b"}},
                    {"op": "delete", "id": 424242},
                ],
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "atomic batch surfaces the failure: {body}");

    // Only the non-atomic success landed.
    let (status, body, _) = app
        .send(request("GET", "/api/v1/content-items", &app.admin_key, None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn mcp_facade_shares_operations_and_envelopes() {
    let app = test_app().await;

    let (status, body, _) = app
        .send(request(
            "POST",
            "/mcp",
            &app.admin_key,
            Some(json!({"tool": "tools/list"})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let tools = body["data"]["tools"].as_array().expect("tools");
    assert!(
        tools
            .iter()
            .any(|tool| tool["name"] == "content_type.create")
    );

    let (status, body, _) = app
        .send(request(
            "POST",
            "/mcp",
            &app.admin_key,
            Some(json!({
                "tool": "content_type.create",
                "arguments": {
                    "name": "Tool Made",
                    "schema": {"type": "object"},
                },
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "tool call failed: {body}");
    let type_id = body["data"]["result"]["id"].as_i64().expect("id");
    assert!(type_id > 0);

    // Same uniform error codes on the tool surface.
    let (status, body, _) = app
        .send(request(
            "POST",
            "/mcp",
            &app.admin_key,
            Some(json!({"tool": "content_item.get", "arguments": {"id": 777}})),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CONTENT_ITEM_NOT_FOUND");
}

#[tokio::test]
async fn webhook_subscription_receives_signed_delivery() {
    let app = test_app().await;

    // A real local listener to catch the delivery.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("addr");
    let (sent_tx, mut sent_rx) = tokio::sync::mpsc::channel::<(String, String)>(4);
    tokio::spawn(async move {
        let receiver = axum::Router::new().route(
            "/hook",
            axum::routing::post(
                move |headers: axum::http::HeaderMap, body: String| {
                    let sent_tx = sent_tx.clone();
                    async move {
                        let signature = headers
                            .get("x-wordclaw-signature")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let _ = sent_tx.send((signature, body)).await;
                        axum::http::StatusCode::OK
                    }
                },
            ),
        );
        let _ = axum::serve(listener, receiver).await;
    });

    let (status, body, _) = app
        .send(request(
            "POST",
            "/api/v1/webhooks",
            &app.admin_key,
            Some(json!({
                "url": format!("http://{addr}/hook"),
                "eventPatterns": ["content_type.*"],
                "secret": "hook-secret",
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "webhook create failed: {body}");

    // Drive the dispatcher by hand: enqueue a matching event and run one
    // delivery pass.
    create_blog_type(&app, 0, "blog-post").await;
    let event = crate::events::Event::new(
        "content_type.create",
        app.tenant_id,
        "content_type",
        "1",
        json!({"id": 1}),
        "req-hook",
    );
    let queued = app
        .state
        .webhooks
        .enqueue_for_event(&event)
        .await
        .expect("enqueue");
    assert_eq!(queued, 1);

    let summary = app.state.webhooks.deliver_due(10).await.expect("deliver");
    assert_eq!(summary.delivered, 1);

    let (signature, body) = sent_rx.recv().await.expect("delivery received");
    assert_eq!(signature, sign_hmac_hex("hook-secret", body.as_bytes()));
    let payload: Value = serde_json::from_str(&body).expect("payload json");
    assert_eq!(payload["event"], "content_type.create");
}

#[tokio::test]
async fn entitlement_delegation_over_rest() {
    let app = test_app().await;
    let free_type = create_blog_type(&app, 0, "free-post").await;
    let item_id = create_item(&app, free_type, "shared").await;
    let (status, _, _) = app
        .send(request(
            "PUT",
            &format!("/api/v1/content-types/{free_type}"),
            &app.admin_key,
            Some(json!({"basePrice": 100})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/offers/{item_id}/purchase"),
            &app.admin_key,
            Some(json!({"reads": 4})),
        ))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let macaroon = body["details"]["macaroon"].as_str().expect("macaroon").to_string();
    let payment_hash = body["details"]["paymentHash"].as_str().expect("hash").to_string();
    let preimage = app.provider.settle(&payment_hash).await.expect("settle");
    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/offers/{item_id}/purchase/confirm"),
            &app.admin_key,
            Some(json!({"macaroon": macaroon, "preimage": preimage})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let entitlement_id = body["data"]["entitlement"]["id"].as_i64().expect("id");

    let (status, body, _) = app
        .send(request(
            "POST",
            &format!("/api/v1/entitlements/{entitlement_id}/delegate"),
            &app.admin_key,
            Some(json!({"agentProfileId": "agent-b", "reads": 3})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "delegate failed: {body}");
    assert_eq!(body["data"]["remaining_reads"], 3);
    assert_eq!(body["data"]["delegated_from"], entitlement_id);
    assert_eq!(body["data"]["status"], "active");

    let (status, body, _) = app
        .send(request(
            "GET",
            &format!("/api/v1/entitlements/{entitlement_id}"),
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["remaining_reads"], 1);
}

#[tokio::test]
async fn policy_decisions_record_scope_denials() {
    let app = test_app().await;
    let limited = app
        .state
        .auth
        .issue_key(
            app.tenant_id,
            "reader".to_string(),
            vec!["content:read".to_string()],
            None,
            "test",
        )
        .await
        .expect("issue");

    let (status, _, _) = app
        .send(request(
            "POST",
            "/api/v1/content-types",
            &limited.secret,
            Some(json!({"name": "X", "schema": {"type": "object"}})),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (status, body, _) = app
        .send(request(
            "GET",
            "/api/v1/policy-decisions",
            &app.admin_key,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let decisions = body["data"].as_array().expect("decisions");
    assert!(
        decisions
            .iter()
            .any(|d| d["decision"] == "deny" && d["reason"].as_str().is_some_and(|r| r.contains("content:write")))
    );
}
