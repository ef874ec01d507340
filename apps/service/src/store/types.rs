//! Row types for the durable store. Surrogate integer ids everywhere;
//! cross-entity links are explicit foreign keys, never object graphs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct TenantRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRow {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub scopes: Vec<String>,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRow {
    /// A key is valid iff not revoked and not expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    Published,
    Archived,
}

impl ContentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentTypeRow {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub slug: String,
    pub schema_json: String,
    pub schema_version: i64,
    pub base_price_sats: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentItemRow {
    pub id: i64,
    pub tenant_id: i64,
    pub content_type_id: i64,
    pub data: Value,
    pub status: ContentStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentVersionRow {
    pub id: i64,
    pub content_item_id: i64,
    pub data: Value,
    pub status: ContentStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Rollback,
    Error,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Rollback => "rollback",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "rollback" => Some(Self::Rollback),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogRow {
    pub id: i64,
    pub tenant_id: i64,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    pub actor_id: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// Audit payload recorded in the same transaction as the mutation it
/// describes.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    pub actor_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRow {
    pub id: i64,
    pub tenant_id: i64,
    pub url: String,
    pub event_patterns: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookDeliveryRow {
    pub id: i64,
    pub tenant_id: i64,
    pub webhook_id: i64,
    pub event_kind: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Paid,
    Consumed,
    Expired,
    Failed,
}

impl PaymentState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "consumed" => Some(Self::Consumed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// States a row may be in immediately before entering `to`.
    ///
    /// pending -> paid -> consumed, pending -> expired, pending -> failed.
    pub fn allowed_from(to: Self) -> &'static [Self] {
        match to {
            Self::Pending => &[],
            Self::Paid => &[Self::Pending],
            Self::Consumed => &[Self::Paid],
            Self::Expired | Self::Failed => &[Self::Pending],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRow {
    pub id: i64,
    pub tenant_id: i64,
    pub payment_hash: String,
    pub provider: String,
    pub provider_invoice_id: Option<String>,
    pub payment_request: String,
    pub amount_sats: i64,
    pub status: PaymentState,
    pub expires_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub last_event_id: Option<String>,
    pub resource_path: String,
    pub actor_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written alongside a payment state transition.
#[derive(Debug, Clone, Default)]
pub struct PaymentTransition {
    pub settled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub event_id: Option<String>,
}

/// Result of a conditional payment transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(PaymentRow),
    AlreadyInState(PaymentRow),
    Rejected { from: PaymentState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    PendingPayment,
    Active,
    Exhausted,
    Expired,
    Revoked,
}

impl EntitlementState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Active => "active",
            Self::Exhausted => "exhausted",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending_payment" => Some(Self::PendingPayment),
            "active" => Some(Self::Active),
            "exhausted" => Some(Self::Exhausted),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exhausted | Self::Expired | Self::Revoked)
    }
}

/// What the priced resource is: a type (pay-per-write) or an item
/// (pay-per-read offer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    ContentType,
    ContentItem,
}

impl OfferKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContentType => "content_type",
            Self::ContentItem => "content_item",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "content_type" => Some(Self::ContentType),
            "content_item" => Some(Self::ContentItem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitlementRow {
    pub id: i64,
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
    pub activated_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub delegated_from: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of the single conditional decrement-and-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Decremented; reads remain (or the grant is unlimited).
    Consumed { remaining: Option<i64> },
    /// Decremented to zero; the entitlement is now exhausted.
    ConsumedAndExhausted,
    /// The entitlement is not active (exhausted, expired, revoked, pending).
    NotActive { status: EntitlementState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Pending,
    Cleared,
    Reversed,
}

impl AllocationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cleared => "cleared",
            Self::Reversed => "reversed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "cleared" => Some(Self::Cleared),
            "reversed" => Some(Self::Reversed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RevenueEventRow {
    pub id: i64,
    pub tenant_id: i64,
    pub payment_hash: String,
    pub gross_sats: i64,
    pub policy_id: String,
    pub policy_version: i64,
    pub settled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationRow {
    pub id: i64,
    pub tenant_id: i64,
    pub revenue_event_id: i64,
    pub agent_profile_id: String,
    pub amount_sats: i64,
    pub status: AllocationState,
    pub cleared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Completed,
    FailedTransient,
    FailedPermanent,
}

impl TransferState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed_transient" => Some(Self::FailedTransient),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutBatchRow {
    pub id: i64,
    pub tenant_id: i64,
    pub status: String,
    pub total_sats: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutTransferRow {
    pub id: i64,
    pub tenant_id: i64,
    pub batch_id: i64,
    pub agent_profile_id: String,
    pub amount_sats: i64,
    pub status: TransferState,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cleared-minus-in-flight balance for one party in one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct PartyBalance {
    pub tenant_id: i64,
    pub agent_profile_id: String,
    pub balance_sats: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecisionRow {
    pub id: i64,
    pub tenant_id: i64,
    pub actor_id: String,
    pub operation: String,
    pub resource: String,
    pub decision: String,
    pub reason: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_transitions_follow_the_diagram() {
        assert_eq!(PaymentState::allowed_from(PaymentState::Paid), &[PaymentState::Pending]);
        assert_eq!(PaymentState::allowed_from(PaymentState::Consumed), &[PaymentState::Paid]);
        assert!(PaymentState::allowed_from(PaymentState::Pending).is_empty());
    }

    #[test]
    fn api_key_validity_checks_revocation_and_expiry() {
        let now = Utc::now();
        let key = ApiKeyRow {
            id: 1,
            tenant_id: 1,
            name: "k".to_string(),
            prefix: "wc_sk_abc".to_string(),
            secret_hash: "h".to_string(),
            scopes: vec!["admin".to_string()],
            created_by: "root".to_string(),
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
            created_at: now,
        };
        assert!(key.is_valid(now));

        let expired = ApiKeyRow {
            expires_at: Some(now - chrono::Duration::seconds(1)),
            ..key.clone()
        };
        assert!(!expired.is_valid(now));

        let revoked = ApiKeyRow {
            revoked_at: Some(now),
            ..key
        };
        assert!(!revoked.is_valid(now));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ContentStatus::Draft,
            ContentStatus::Published,
            ContentStatus::Archived,
        ] {
            assert_eq!(ContentStatus::parse(status.as_str()), Some(status));
        }
        for state in [
            EntitlementState::PendingPayment,
            EntitlementState::Active,
            EntitlementState::Exhausted,
            EntitlementState::Expired,
            EntitlementState::Revoked,
        ] {
            assert_eq!(EntitlementState::parse(state.as_str()), Some(state));
        }
        assert!(ContentStatus::parse("nope").is_none());
    }
}
