//! Entitlement ledger: durable, revocable, quota-bounded grants that
//! outlive individual HTTP transactions. Consumption is a single
//! conditional decrement in the store, so parallel reads cannot overshoot.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::auth::Principal;
use crate::context::OpContext;
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::payments::{DEFAULT_POLICY_ID, DEFAULT_POLICY_VERSION};
use crate::store::{
    ConsumeOutcome, EntitlementRow, EntitlementState, NewEntitlement, OfferKind, Store, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("entitlement not found")]
    NotFound,
    #[error("entitlement is {0:?}, not active")]
    NotActive(EntitlementState),
    #[error("entitlement quota exhausted")]
    Exhausted,
    #[error("parent entitlement cannot cover the delegation")]
    DelegationOverQuota,
    #[error("delegation requires a bounded parent quota or expiry inside the parent's")]
    DelegationUnbounded,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct DelegateInput {
    pub parent_id: i64,
    pub agent_profile_id: String,
    pub reads: Option<i64>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn Store>,
    bus: EventBus,
    metrics: Arc<Metrics>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            bus,
            metrics,
        }
    }

    pub async fn get(
        &self,
        principal: &Principal,
        id: i64,
    ) -> Result<EntitlementRow, EntitlementError> {
        self.store
            .get_entitlement(principal.tenant_id, id)
            .await?
            .ok_or(EntitlementError::NotFound)
    }

    pub async fn list(
        &self,
        principal: &Principal,
        agent_profile_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, EntitlementError> {
        Ok(self
            .store
            .list_entitlements(principal.tenant_id, agent_profile_id, limit.clamp(1, 200))
            .await?)
    }

    /// Find the buyer's active grant for an offer, if any.
    pub async fn find_active(
        &self,
        tenant_id: i64,
        offer_kind: OfferKind,
        offer_id: i64,
        agent_profile_id: &str,
    ) -> Result<Option<EntitlementRow>, EntitlementError> {
        Ok(self
            .store
            .find_active_entitlement(tenant_id, offer_kind, offer_id, agent_profile_id, Utc::now())
            .await?)
    }

    /// Decrement-and-check for one authorized read.
    pub async fn consume(
        &self,
        entitlement: &EntitlementRow,
        ctx: &OpContext,
    ) -> Result<ConsumeOutcome, EntitlementError> {
        let outcome = self
            .store
            .consume_entitlement(entitlement.id, Utc::now())
            .await?;
        match &outcome {
            ConsumeOutcome::Consumed { .. } => {}
            ConsumeOutcome::ConsumedAndExhausted => {
                self.bus.publish(Event::new(
                    "entitlement.exhausted",
                    entitlement.tenant_id,
                    "entitlement",
                    entitlement.id.to_string(),
                    json!({"id": entitlement.id}),
                    ctx.request_id.clone(),
                ));
            }
            ConsumeOutcome::NotActive { status } => {
                return Err(match status {
                    EntitlementState::Exhausted => EntitlementError::Exhausted,
                    other => EntitlementError::NotActive(*other),
                });
            }
        }
        Ok(outcome)
    }

    /// Administrative revocation of any non-terminal grant.
    pub async fn revoke(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
    ) -> Result<EntitlementRow, EntitlementError> {
        let row = self
            .store
            .revoke_entitlement(principal.tenant_id, id, Utc::now())
            .await?
            .ok_or(EntitlementError::NotFound)?;
        self.bus.publish(Event::new(
            "entitlement.revoked",
            row.tenant_id,
            "entitlement",
            row.id.to_string(),
            json!({"id": row.id}),
            ctx.request_id.clone(),
        ));
        Ok(row)
    }

    /// Delegate part of a parent grant to another agent profile. The child
    /// is capped by the parent's remaining quota and expiry; the delegated
    /// reads are deducted from the parent atomically.
    pub async fn delegate(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        input: DelegateInput,
    ) -> Result<EntitlementRow, EntitlementError> {
        let now = Utc::now();
        let parent = self.get(principal, input.parent_id).await?;
        if parent.status != EntitlementState::Active {
            return Err(EntitlementError::NotActive(parent.status));
        }

        let child_reads = match (parent.remaining_reads, input.reads) {
            // Bounded parent: child takes an explicit share, or everything left.
            (Some(remaining), Some(reads)) => {
                if reads <= 0 || reads > remaining {
                    return Err(EntitlementError::DelegationOverQuota);
                }
                Some(reads)
            }
            (Some(remaining), None) => Some(remaining),
            // Unlimited parent: child may be bounded or unlimited.
            (None, reads) => reads,
        };

        let child_expires_at = cap_expiry(
            parent.expires_at,
            input
                .ttl_seconds
                .map(|seconds| now + Duration::seconds(seconds as i64)),
        );
        if parent.expires_at.is_none() && parent.remaining_reads.is_none() {
            // A grant with no bounds at all can still delegate, but the
            // child must carry some bound of its own.
            if child_reads.is_none() && child_expires_at.is_none() {
                return Err(EntitlementError::DelegationUnbounded);
            }
        }

        if let Some(reads) = child_reads {
            if parent.remaining_reads.is_some() {
                let reduced = self
                    .store
                    .reduce_entitlement_quota(parent.id, reads, now)
                    .await?;
                if !reduced {
                    return Err(EntitlementError::DelegationOverQuota);
                }
            }
        }

        let child = self
            .store
            .insert_entitlement(NewEntitlement {
                tenant_id: parent.tenant_id,
                offer_kind: parent.offer_kind,
                offer_id: parent.offer_id,
                policy_id: DEFAULT_POLICY_ID.to_string(),
                policy_version: DEFAULT_POLICY_VERSION,
                agent_profile_id: input.agent_profile_id,
                payment_hash: format!("delegated_{}", uuid::Uuid::new_v4().simple()),
                status: EntitlementState::PendingPayment,
                remaining_reads: child_reads,
                expires_at: child_expires_at,
                delegated_from: Some(parent.id),
                created_at: now,
            })
            .await?;
        // Delegated grants ride on the parent's settled payment.
        let activated = self
            .store
            .activate_entitlement(&child.payment_hash, now)
            .await?
            .unwrap_or(child);

        self.bus.publish(Event::new(
            "entitlement.delegated",
            activated.tenant_id,
            "entitlement",
            activated.id.to_string(),
            json!({"id": activated.id, "parentId": parent.id}),
            ctx.request_id.clone(),
        ));
        Ok(activated)
    }

    /// Sweep: active grants past expiry become `expired`.
    pub async fn expire_due(&self, limit: u32) -> Result<u64, EntitlementError> {
        let expired = self.store.expire_entitlements(Utc::now(), limit).await?;
        let count = expired.len() as u64;
        for row in expired {
            self.metrics
                .entitlements_expired
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.bus.publish(Event::new(
                "entitlement.expired",
                row.tenant_id,
                "entitlement",
                row.id.to_string(),
                json!({"id": row.id}),
                "expiry-sweep",
            ));
        }
        Ok(count)
    }
}

impl From<EntitlementError> for crate::api_envelope::ApiError {
    fn from(error: EntitlementError) -> Self {
        use crate::api_envelope::{ApiError, ErrorCode};
        match error {
            EntitlementError::NotFound => {
                ApiError::new(ErrorCode::EntitlementNotFound, "entitlement not found")
            }
            EntitlementError::Exhausted => ApiError::new(
                ErrorCode::EntitlementExhausted,
                "entitlement quota exhausted",
            ),
            EntitlementError::NotActive(status) => ApiError::new(
                ErrorCode::PaymentRequired,
                format!("entitlement is {}, not active", status.as_str()),
            ),
            EntitlementError::DelegationOverQuota => ApiError::new(
                ErrorCode::InvalidRequest,
                "delegation exceeds the parent's remaining quota",
            ),
            EntitlementError::DelegationUnbounded => ApiError::new(
                ErrorCode::InvalidRequest,
                "delegation from an unbounded grant must set reads or a ttl",
            ),
            EntitlementError::Store(error) => {
                tracing::error!(reason = %error, "entitlement store failure");
                ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
            }
        }
    }
}

fn cap_expiry(
    parent: Option<DateTime<Utc>>,
    requested: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (parent, requested) {
        (Some(parent), Some(requested)) => Some(parent.min(requested)),
        (Some(parent), None) => Some(parent),
        (None, requested) => requested,
    }
}
