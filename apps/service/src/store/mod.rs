//! Durable store behind a single trait with a memory backend for tests and
//! development and a postgres backend for production.

pub mod memory;
pub mod postgres;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::Db;
pub use types::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("slug already in use for this tenant")]
    SlugConflict,
    #[error("version conflict: head is {head}")]
    VersionConflict { head: i64 },
    #[error("target version not found")]
    TargetVersionMissing,
    #[error("content type is still referenced by items")]
    TypeInUse,
    #[error("invalid payment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub tenant_id: i64,
    pub name: String,
    pub prefix: String,
    pub secret_hash: String,
    pub scopes: Vec<String>,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContentType {
    pub tenant_id: i64,
    pub name: String,
    pub slug: String,
    pub schema_json: String,
    pub base_price_sats: i64,
    pub created_at: DateTime<Utc>,
}

/// Partial patch for a content type. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ContentTypePatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub schema_json: Option<String>,
    pub base_price_sats: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewContentItem {
    pub tenant_id: i64,
    pub content_type_id: i64,
    pub data: Value,
    pub status: ContentStatus,
    pub created_at: DateTime<Utc>,
}

/// Head mutation: snapshot the current row, apply the patch, bump `version`.
#[derive(Debug, Clone)]
pub struct ContentItemChange {
    pub data: Option<Value>,
    pub status: Option<ContentStatus>,
    pub expected_version: Option<i64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentItemFilter {
    pub content_type_id: Option<i64>,
    pub status: Option<ContentStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub after_id: Option<i64>,
    pub offset: Option<u64>,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Create {
        content_type_id: i64,
        data: Value,
        status: ContentStatus,
    },
    Update {
        id: i64,
        data: Option<Value>,
        status: Option<ContentStatus>,
        expected_version: Option<i64>,
    },
    Delete {
        id: i64,
    },
}

/// Per-op result of a batch. `item` is `None` for deletes.
#[derive(Debug, Clone)]
pub struct BatchItemOutcome {
    pub index: usize,
    pub result: Result<Option<ContentItemRow>, StoreError>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub entity_type: Option<String>,
    pub before_id: Option<i64>,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub tenant_id: i64,
    pub url: String,
    pub event_patterns: Vec<String>,
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookPatch {
    pub url: Option<String>,
    pub event_patterns: Option<Vec<String>>,
    pub secret: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub tenant_id: i64,
    pub webhook_id: i64,
    pub event_kind: String,
    pub payload: Value,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: i64,
    pub payment_hash: String,
    pub provider: String,
    pub provider_invoice_id: Option<String>,
    pub payment_request: String,
    pub amount_sats: i64,
    pub expires_at: DateTime<Utc>,
    pub resource_path: String,
    pub actor_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEntitlement {
    pub tenant_id: i64,
    pub offer_kind: OfferKind,
    pub offer_id: i64,
    pub policy_id: String,
    pub policy_version: i64,
    pub agent_profile_id: String,
    pub payment_hash: String,
    pub status: EntitlementState,
    pub remaining_reads: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub delegated_from: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRevenueEvent {
    pub tenant_id: i64,
    pub payment_hash: String,
    pub gross_sats: i64,
    pub policy_id: String,
    pub policy_version: i64,
    pub settled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub agent_profile_id: String,
    pub amount_sats: i64,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub agent_profile_id: String,
    pub amount_sats: i64,
}

#[derive(Debug, Clone)]
pub struct NewPolicyDecision {
    pub tenant_id: i64,
    pub actor_id: String,
    pub operation: String,
    pub resource: String,
    pub decision: String,
    pub reason: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// The persistence adapter. Every method is tenant-scoped where the entity
/// is tenant-owned; cross-tenant ids simply come back as `NotFound`.
#[async_trait]
pub trait Store: Send + Sync {
    // Tenants
    async fn create_tenant(
        &self,
        name: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantRow, StoreError>;
    async fn get_tenant(&self, id: i64) -> Result<Option<TenantRow>, StoreError>;

    // API keys
    async fn insert_api_key(&self, input: NewApiKey) -> Result<ApiKeyRow, StoreError>;
    async fn find_api_key_by_hash(
        &self,
        secret_hash: &str,
    ) -> Result<Option<ApiKeyRow>, StoreError>;
    async fn get_api_key(&self, tenant_id: i64, id: i64) -> Result<Option<ApiKeyRow>, StoreError>;
    async fn list_api_keys(&self, tenant_id: i64) -> Result<Vec<ApiKeyRow>, StoreError>;
    async fn rotate_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        new_prefix: &str,
        new_secret_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError>;
    async fn revoke_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError>;
    async fn touch_api_key(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    // Content types
    async fn insert_content_type(
        &self,
        input: NewContentType,
        audit: AuditEntry,
    ) -> Result<ContentTypeRow, StoreError>;
    async fn get_content_type(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentTypeRow>, StoreError>;
    async fn list_content_types(&self, tenant_id: i64) -> Result<Vec<ContentTypeRow>, StoreError>;
    async fn update_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        patch: ContentTypePatch,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentTypeRow, StoreError>;
    async fn delete_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<(), StoreError>;

    // Content items
    async fn insert_content_item(
        &self,
        input: NewContentItem,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError>;
    async fn get_content_item(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentItemRow>, StoreError>;
    async fn list_content_items(
        &self,
        tenant_id: i64,
        filter: &ContentItemFilter,
    ) -> Result<Vec<ContentItemRow>, StoreError>;
    async fn update_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        change: ContentItemChange,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError>;
    async fn rollback_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        target_version: i64,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentItemRow, StoreError>;
    async fn delete_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<bool, StoreError>;
    async fn list_content_item_versions(
        &self,
        tenant_id: i64,
        item_id: i64,
    ) -> Result<Vec<ContentVersionRow>, StoreError>;
    async fn apply_content_batch(
        &self,
        tenant_id: i64,
        ops: Vec<BatchOp>,
        atomic: bool,
        audit_template: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchItemOutcome>, StoreError>;

    // Audit
    async fn append_audit(
        &self,
        tenant_id: i64,
        entry: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<AuditLogRow, StoreError>;
    async fn list_audit_logs(
        &self,
        tenant_id: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogRow>, StoreError>;

    // Webhook subscriptions and deliveries
    async fn insert_webhook(&self, input: NewWebhook) -> Result<WebhookRow, StoreError>;
    async fn get_webhook(&self, tenant_id: i64, id: i64) -> Result<Option<WebhookRow>, StoreError>;
    async fn list_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError>;
    async fn update_webhook(
        &self,
        tenant_id: i64,
        id: i64,
        patch: WebhookPatch,
        now: DateTime<Utc>,
    ) -> Result<WebhookRow, StoreError>;
    async fn delete_webhook(&self, tenant_id: i64, id: i64) -> Result<bool, StoreError>;
    async fn list_active_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError>;
    async fn enqueue_webhook_delivery(
        &self,
        input: NewWebhookDelivery,
    ) -> Result<WebhookDeliveryRow, StoreError>;
    async fn due_webhook_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDeliveryRow>, StoreError>;
    async fn mark_webhook_delivery(
        &self,
        id: i64,
        status: DeliveryStatus,
        attempts: i32,
        last_error: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Payments
    async fn insert_payment(&self, input: NewPayment) -> Result<PaymentRow, StoreError>;
    async fn get_payment(&self, tenant_id: i64, id: i64)
    -> Result<Option<PaymentRow>, StoreError>;
    async fn get_payment_by_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<PaymentRow>, StoreError>;
    async fn list_payments(
        &self,
        tenant_id: i64,
        status: Option<PaymentState>,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError>;
    async fn transition_payment(
        &self,
        payment_hash: &str,
        to: PaymentState,
        update: PaymentTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;
    async fn record_payment_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        payment_hash: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn list_stale_pending_payments(
        &self,
        provider: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError>;
    async fn count_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    // Entitlements
    async fn insert_entitlement(
        &self,
        input: NewEntitlement,
    ) -> Result<EntitlementRow, StoreError>;
    async fn get_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<EntitlementRow>, StoreError>;
    async fn get_entitlement_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<EntitlementRow>, StoreError>;
    async fn list_entitlements(
        &self,
        tenant_id: i64,
        agent_profile_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError>;
    async fn activate_entitlement(
        &self,
        payment_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError>;
    async fn find_active_entitlement(
        &self,
        tenant_id: i64,
        offer_kind: OfferKind,
        offer_id: i64,
        agent_profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError>;
    async fn consume_entitlement(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError>;
    async fn expire_entitlements(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError>;
    async fn revoke_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError>;
    async fn reduce_entitlement_quota(
        &self,
        id: i64,
        reads: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // Revenue and payouts
    async fn insert_revenue_event(
        &self,
        event: NewRevenueEvent,
        allocations: Vec<NewAllocation>,
    ) -> Result<Option<RevenueEventRow>, StoreError>;
    async fn list_allocations(
        &self,
        tenant_id: i64,
        payment_hash: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AllocationRow>, StoreError>;
    async fn clear_allocations_settled_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn cleared_balances(&self, min_balance: i64) -> Result<Vec<PartyBalance>, StoreError>;
    async fn create_payout_batch(
        &self,
        tenant_id: i64,
        transfers: Vec<NewTransfer>,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError>;
    async fn due_payout_transfers(
        &self,
        limit: u32,
    ) -> Result<Vec<PayoutTransferRow>, StoreError>;
    async fn update_payout_transfer(
        &self,
        id: i64,
        status: TransferState,
        attempts: i32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn refresh_payout_batch_status(
        &self,
        batch_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError>;
    async fn list_payout_batches(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<(PayoutBatchRow, Vec<PayoutTransferRow>)>, StoreError>;

    // Policy decisions
    async fn append_policy_decision(
        &self,
        input: NewPolicyDecision,
    ) -> Result<(), StoreError>;
    async fn list_policy_decisions(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<PolicyDecisionRow>, StoreError>;
}

/// In-memory backend for tests and development.
pub fn memory() -> Arc<dyn Store> {
    Arc::new(memory::MemoryStore::default())
}

/// Postgres-backed production store.
pub fn postgres_store(db: Db) -> Arc<dyn Store> {
    Arc::new(postgres::PostgresStore::new(db))
}
