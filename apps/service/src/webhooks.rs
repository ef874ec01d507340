//! Outbound webhooks: subscription CRUD, event fan-in from the bus, and
//! signed HTTP delivery with exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::auth::Principal;
use crate::events::{Event, EventBus, pattern_matches};
use crate::metrics::Metrics;
use crate::payments::sign_hmac_hex;
use crate::store::{
    DeliveryStatus, NewWebhook, NewWebhookDelivery, Store, StoreError, WebhookDeliveryRow,
    WebhookPatch, WebhookRow,
};

pub const SIGNATURE_HEADER: &str = "x-wordclaw-signature";
pub const EVENT_KIND_HEADER: &str = "x-wordclaw-event";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook not found")]
    NotFound,
    #[error("webhook url must be http(s)")]
    InvalidUrl,
    #[error("at least one event pattern is required")]
    NoPatterns,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CreateWebhookInput {
    pub url: String,
    pub event_patterns: Vec<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWebhookInput {
    pub url: Option<String>,
    pub event_patterns: Option<Vec<String>>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeliverySummary {
    pub attempted: u64,
    pub delivered: u64,
    pub failed_terminal: u64,
    pub rescheduled: u64,
}

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
        timeout_ms: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_millis(timeout_ms.max(100)))
            .build()
            .unwrap_or_default();
        Self {
            store,
            metrics,
            http,
            max_attempts: max_attempts.max(1),
            backoff_base: Duration::milliseconds(backoff_base_ms.max(1) as i64),
            backoff_cap: Duration::milliseconds(backoff_cap_ms.max(1) as i64),
        }
    }

    pub async fn create(
        &self,
        principal: &Principal,
        input: CreateWebhookInput,
    ) -> Result<WebhookRow, WebhookError> {
        validate_url(&input.url)?;
        let patterns = normalize_patterns(input.event_patterns)?;
        let secret = input
            .secret
            .filter(|secret| !secret.trim().is_empty())
            .unwrap_or_else(|| format!("whsec_{}", uuid::Uuid::new_v4().simple()));
        Ok(self
            .store
            .insert_webhook(NewWebhook {
                tenant_id: principal.tenant_id,
                url: input.url,
                event_patterns: patterns,
                secret,
                active: input.active.unwrap_or(true),
                created_at: Utc::now(),
            })
            .await?)
    }

    pub async fn get(&self, principal: &Principal, id: i64) -> Result<WebhookRow, WebhookError> {
        self.store
            .get_webhook(principal.tenant_id, id)
            .await?
            .ok_or(WebhookError::NotFound)
    }

    pub async fn list(&self, principal: &Principal) -> Result<Vec<WebhookRow>, WebhookError> {
        Ok(self.store.list_webhooks(principal.tenant_id).await?)
    }

    pub async fn update(
        &self,
        principal: &Principal,
        id: i64,
        input: UpdateWebhookInput,
    ) -> Result<WebhookRow, WebhookError> {
        if let Some(url) = &input.url {
            validate_url(url)?;
        }
        let event_patterns = match input.event_patterns {
            Some(patterns) => Some(normalize_patterns(patterns)?),
            None => None,
        };
        match self
            .store
            .update_webhook(
                principal.tenant_id,
                id,
                WebhookPatch {
                    url: input.url,
                    event_patterns,
                    secret: input.secret,
                    active: input.active,
                },
                Utc::now(),
            )
            .await
        {
            Ok(row) => Ok(row),
            Err(StoreError::NotFound(_)) => Err(WebhookError::NotFound),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn delete(&self, principal: &Principal, id: i64) -> Result<(), WebhookError> {
        if !self.store.delete_webhook(principal.tenant_id, id).await? {
            return Err(WebhookError::NotFound);
        }
        Ok(())
    }

    /// Match an event against the tenant's active subscriptions and queue
    /// one delivery per match.
    pub async fn enqueue_for_event(&self, event: &Event) -> Result<usize, StoreError> {
        let hooks = self.store.list_active_webhooks(event.tenant_id).await?;
        let now = Utc::now();
        let mut queued = 0usize;
        for hook in hooks {
            if !hook
                .event_patterns
                .iter()
                .any(|pattern| pattern_matches(pattern, &event.kind))
            {
                continue;
            }
            self.store
                .enqueue_webhook_delivery(NewWebhookDelivery {
                    tenant_id: event.tenant_id,
                    webhook_id: hook.id,
                    event_kind: event.kind.clone(),
                    payload: json!({
                        "event": event.kind,
                        "entityType": event.entity_type,
                        "entityId": event.entity_id,
                        "payload": event.payload,
                        "occurredAt": event.occurred_at,
                        "requestId": event.request_id,
                    }),
                    next_attempt_at: now,
                    created_at: now,
                })
                .await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Drain the bus into the delivery queue. Runs on its own task; errors
    /// are recorded and never propagate to publishers.
    pub async fn run_dispatcher(self, bus: EventBus) {
        let mut receiver = bus.subscribe();
        while let Some(event) = bus.recv(&mut receiver).await {
            if let Err(error) = self.enqueue_for_event(&event).await {
                tracing::error!(kind = %event.kind, reason = %error, "webhook enqueue failed");
            }
        }
    }

    /// Attempt all due deliveries once.
    pub async fn deliver_due(&self, limit: u32) -> Result<DeliverySummary, StoreError> {
        let now = Utc::now();
        let mut summary = DeliverySummary::default();
        let due = self.store.due_webhook_deliveries(now, limit).await?;

        for delivery in due {
            summary.attempted += 1;
            let Some(hook) = self
                .store
                .get_webhook(delivery.tenant_id, delivery.webhook_id)
                .await?
            else {
                self.store
                    .mark_webhook_delivery(
                        delivery.id,
                        DeliveryStatus::Failed,
                        delivery.attempts + 1,
                        Some("webhook subscription no longer exists".to_string()),
                        None,
                        now,
                    )
                    .await?;
                summary.failed_terminal += 1;
                continue;
            };

            match self.attempt(&hook, &delivery).await {
                Ok(()) => {
                    self.store
                        .mark_webhook_delivery(
                            delivery.id,
                            DeliveryStatus::Delivered,
                            delivery.attempts + 1,
                            None,
                            None,
                            Utc::now(),
                        )
                        .await?;
                    self.metrics
                        .webhooks_delivered
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    summary.delivered += 1;
                }
                Err(reason) => {
                    let attempts = delivery.attempts + 1;
                    if attempts >= self.max_attempts as i32 {
                        self.store
                            .mark_webhook_delivery(
                                delivery.id,
                                DeliveryStatus::Failed,
                                attempts,
                                Some(reason.clone()),
                                None,
                                Utc::now(),
                            )
                            .await?;
                        self.metrics
                            .webhooks_failed
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        summary.failed_terminal += 1;
                        tracing::warn!(
                            delivery_id = delivery.id,
                            webhook_id = hook.id,
                            reason = %reason,
                            "webhook delivery permanently failed"
                        );
                    } else {
                        let next_attempt_at =
                            Utc::now() + self.backoff_delay(attempts as u32);
                        self.store
                            .mark_webhook_delivery(
                                delivery.id,
                                DeliveryStatus::Pending,
                                attempts,
                                Some(reason),
                                Some(next_attempt_at),
                                Utc::now(),
                            )
                            .await?;
                        summary.rescheduled += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn attempt(
        &self,
        hook: &WebhookRow,
        delivery: &WebhookDeliveryRow,
    ) -> Result<(), String> {
        let body = serde_json::to_vec(&delivery.payload)
            .map_err(|error| format!("payload serialization failed: {error}"))?;
        let signature = sign_hmac_hex(&hook.secret, &body);

        let response = self
            .http
            .post(&hook.url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_KIND_HEADER, &delivery.event_kind)
            .body(body)
            .send()
            .await
            .map_err(|error| format!("request failed: {error}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("subscriber returned {}", response.status()))
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.backoff_base.num_milliseconds().max(1);
        let delay_ms = base_ms.saturating_mul(1_i64 << exponent);
        let capped_ms = delay_ms.min(self.backoff_cap.num_milliseconds().max(1));
        let jitter_ms = (Utc::now().timestamp_subsec_nanos() as i64) % (capped_ms / 2 + 1);
        Duration::milliseconds(capped_ms + jitter_ms)
    }
}

impl From<WebhookError> for crate::api_envelope::ApiError {
    fn from(error: WebhookError) -> Self {
        use crate::api_envelope::{ApiError, ErrorCode};
        match error {
            WebhookError::NotFound => {
                ApiError::new(ErrorCode::WebhookNotFound, "webhook not found")
            }
            WebhookError::InvalidUrl => {
                ApiError::new(ErrorCode::InvalidRequest, "webhook url must be http(s)")
            }
            WebhookError::NoPatterns => ApiError::new(
                ErrorCode::InvalidRequest,
                "at least one event pattern is required",
            ),
            WebhookError::Store(error) => {
                tracing::error!(reason = %error, "webhook store failure");
                ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
            }
        }
    }
}

fn validate_url(url: &str) -> Result<(), WebhookError> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(WebhookError::InvalidUrl)
    }
}

fn normalize_patterns(patterns: Vec<String>) -> Result<Vec<String>, WebhookError> {
    let patterns: Vec<String> = patterns
        .into_iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .collect();
    if patterns.is_empty() {
        return Err(WebhookError::NoPatterns);
    }
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store;

    fn service(store: Arc<dyn Store>) -> WebhookService {
        WebhookService::new(store, Arc::new(Metrics::default()), 3, 1, 10, 1_000)
    }

    async fn principal(store: &Arc<dyn Store>) -> Principal {
        let tenant = store
            .create_tenant("Acme", "acme", Utc::now())
            .await
            .expect("tenant");
        Principal {
            tenant_id: tenant.id,
            key_id: 1,
            actor_id: "key_1".to_string(),
            scopes: vec!["admin".to_string()],
        }
    }

    #[tokio::test]
    async fn create_validates_url_and_patterns() {
        let store = store::memory();
        let service = service(store.clone());
        let principal = principal(&store).await;

        let bad_url = service
            .create(
                &principal,
                CreateWebhookInput {
                    url: "ftp://example.com".to_string(),
                    event_patterns: vec!["*".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await;
        assert!(matches!(bad_url, Err(WebhookError::InvalidUrl)));

        let no_patterns = service
            .create(
                &principal,
                CreateWebhookInput {
                    url: "https://example.com/hook".to_string(),
                    event_patterns: vec!["  ".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await;
        assert!(matches!(no_patterns, Err(WebhookError::NoPatterns)));

        let created = service
            .create(
                &principal,
                CreateWebhookInput {
                    url: "https://example.com/hook".to_string(),
                    event_patterns: vec!["content_item.*".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await
            .expect("create");
        assert!(created.secret.starts_with("whsec_"));
        assert!(created.active);
    }

    #[tokio::test]
    async fn matching_events_enqueue_one_delivery_per_subscription() {
        let store = store::memory();
        let service = service(store.clone());
        let principal = principal(&store).await;

        service
            .create(
                &principal,
                CreateWebhookInput {
                    url: "https://example.com/a".to_string(),
                    event_patterns: vec!["content_item.*".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await
            .expect("hook a");
        service
            .create(
                &principal,
                CreateWebhookInput {
                    url: "https://example.com/b".to_string(),
                    event_patterns: vec!["payment.paid".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await
            .expect("hook b");

        let queued = service
            .enqueue_for_event(&Event::new(
                "content_item.create",
                principal.tenant_id,
                "content_item",
                "10",
                serde_json::json!({"id": 10}),
                "req-1",
            ))
            .await
            .expect("enqueue");
        assert_eq!(queued, 1);

        let due = store
            .due_webhook_deliveries(Utc::now(), 10)
            .await
            .expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_kind, "content_item.create");
        assert_eq!(due[0].payload["payload"]["id"], 10);
    }

    #[tokio::test]
    async fn unreachable_target_reschedules_then_fails_terminally() {
        let store = store::memory();
        let service = service(store.clone());
        let principal = principal(&store).await;
        service
            .create(
                &principal,
                CreateWebhookInput {
                    // Nothing listens here; connection refused is immediate.
                    url: "http://127.0.0.1:1/hook".to_string(),
                    event_patterns: vec!["*".to_string()],
                    secret: None,
                    active: None,
                },
            )
            .await
            .expect("hook");
        service
            .enqueue_for_event(&Event::new(
                "content_item.create",
                principal.tenant_id,
                "content_item",
                "1",
                serde_json::json!({}),
                "req",
            ))
            .await
            .expect("enqueue");

        let first = service.deliver_due(10).await.expect("pass 1");
        assert_eq!(first.attempted, 1);
        assert_eq!(first.rescheduled, 1);

        // Backoff base is 1 ms in tests; wait it out and finish the attempts.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = service.deliver_due(10).await.expect("pass 2");
        assert_eq!(second.rescheduled, 1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let third = service.deliver_due(10).await.expect("pass 3");
        assert_eq!(third.failed_terminal, 1);
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let store = store::memory();
        let service = WebhookService::new(store, Arc::new(Metrics::default()), 8, 100, 1_000, 500);
        let first = service.backoff_delay(1).num_milliseconds();
        let fourth = service.backoff_delay(4).num_milliseconds();
        let tenth = service.backoff_delay(10).num_milliseconds();
        assert!(first >= 100);
        assert!(fourth >= 800);
        // Cap plus at most 50% jitter.
        assert!(tenth <= 1_500);
    }
}
