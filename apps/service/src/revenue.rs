//! Revenue allocation and payout sweeps.
//!
//! A settled payment becomes one revenue event split into allocations by
//! integer basis points summing to 10000; rounding residue goes to the
//! first-listed party. Allocations clear once the settlement window has
//! passed, and the payout worker batches cleared balances into transfers
//! executed with bounded retry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::store::{
    AllocationRow, NewAllocation, NewRevenueEvent, NewTransfer, PartyBalance, PayoutBatchRow,
    PayoutTransferRow, PaymentRow, Store, StoreError, TransferState,
};

pub const PARTY_CREATOR: &str = "creator";
pub const PARTY_PLATFORM: &str = "platform";

#[derive(Debug, Clone)]
pub struct PolicySplit {
    pub party: String,
    pub share_bps: u32,
}

/// Pinned split policy. Shares must sum to 10000; the first party absorbs
/// the rounding residual.
#[derive(Debug, Clone)]
pub struct RevenuePolicy {
    pub id: String,
    pub version: i64,
    pub splits: Vec<PolicySplit>,
}

impl RevenuePolicy {
    pub fn default_with_platform_fee(platform_fee_bps: u32) -> Self {
        let platform_fee_bps = platform_fee_bps.min(10_000);
        let mut splits = vec![PolicySplit {
            party: PARTY_CREATOR.to_string(),
            share_bps: 10_000 - platform_fee_bps,
        }];
        if platform_fee_bps > 0 {
            splits.push(PolicySplit {
                party: PARTY_PLATFORM.to_string(),
                share_bps: platform_fee_bps,
            });
        }
        Self {
            id: super::payments::DEFAULT_POLICY_ID.to_string(),
            version: super::payments::DEFAULT_POLICY_VERSION,
            splits,
        }
    }
}

/// Split `gross_sats` by basis points. Floor each share, then hand the
/// leftover sats to the first-listed party.
pub fn allocate_splits(gross_sats: i64, policy: &RevenuePolicy) -> Vec<NewAllocation> {
    if policy.splits.is_empty() || gross_sats <= 0 {
        return Vec::new();
    }
    let mut amounts: Vec<i64> = policy
        .splits
        .iter()
        .map(|split| gross_sats * i64::from(split.share_bps) / 10_000)
        .collect();
    let assigned: i64 = amounts.iter().sum();
    let residual = gross_sats - assigned;
    if residual > 0 {
        amounts[0] += residual;
    }
    policy
        .splits
        .iter()
        .zip(amounts)
        .map(|(split, amount_sats)| NewAllocation {
            agent_profile_id: split.party.clone(),
            amount_sats,
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transient transfer failure: {0}")]
    Transient(String),
    #[error("permanent transfer failure: {0}")]
    Permanent(String),
}

/// Executes one payout transfer. Value movement happens at the node; this
/// interface reports success or a retry classification.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, transfer: &PayoutTransferRow) -> Result<(), TransferError>;
}

/// Ledger-only executor: marks transfers completed and leaves settlement
/// to the operator's node tooling.
pub struct LedgerTransferExecutor;

#[async_trait]
impl TransferExecutor for LedgerTransferExecutor {
    async fn execute(&self, _transfer: &PayoutTransferRow) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Test executor with programmable outcomes per party.
#[derive(Default)]
pub struct MockTransferExecutor {
    failures: Mutex<std::collections::HashMap<String, TransferFailureMode>>,
}

#[derive(Debug, Clone, Copy)]
pub enum TransferFailureMode {
    Transient,
    Permanent,
}

impl MockTransferExecutor {
    pub async fn fail_party(&self, party: &str, mode: TransferFailureMode) {
        self.failures.lock().await.insert(party.to_string(), mode);
    }

    pub async fn clear_party(&self, party: &str) {
        self.failures.lock().await.remove(party);
    }
}

#[async_trait]
impl TransferExecutor for MockTransferExecutor {
    async fn execute(&self, transfer: &PayoutTransferRow) -> Result<(), TransferError> {
        let failures = self.failures.lock().await;
        match failures.get(&transfer.agent_profile_id) {
            Some(TransferFailureMode::Transient) => {
                Err(TransferError::Transient("injected".to_string()))
            }
            Some(TransferFailureMode::Permanent) => {
                Err(TransferError::Permanent("injected".to_string()))
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PayoutSummary {
    pub batches_created: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
}

#[derive(Clone)]
pub struct RevenueService {
    store: Arc<dyn Store>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    policy: RevenuePolicy,
    settlement_window: Duration,
    min_balance_sats: i64,
    max_attempts: u32,
    retry_backoff: std::time::Duration,
}

impl RevenueService {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        bus: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
            policy: RevenuePolicy::default_with_platform_fee(config.revenue_platform_fee_bps),
            settlement_window: Duration::seconds(config.revenue_settlement_window_seconds as i64),
            min_balance_sats: config.payout_min_balance_sats,
            max_attempts: config.payout_max_attempts.max(1),
            retry_backoff: std::time::Duration::from_millis(config.payout_retry_backoff_ms.max(1)),
        }
    }

    pub fn policy(&self) -> &RevenuePolicy {
        &self.policy
    }

    /// Record the revenue event and allocations for a settled payment.
    /// Idempotent by payment hash: a replayed settlement records nothing.
    pub async fn record_settlement(&self, payment: &PaymentRow) -> Result<(), StoreError> {
        let now = Utc::now();
        let allocations = allocate_splits(payment.amount_sats, &self.policy);
        let created = self
            .store
            .insert_revenue_event(
                NewRevenueEvent {
                    tenant_id: payment.tenant_id,
                    payment_hash: payment.payment_hash.clone(),
                    gross_sats: payment.amount_sats,
                    policy_id: self.policy.id.clone(),
                    policy_version: self.policy.version,
                    settled_at: payment.settled_at.unwrap_or(now),
                    created_at: now,
                },
                allocations,
            )
            .await?;
        if let Some(event) = created {
            self.bus.publish(Event::new(
                "revenue.recorded",
                payment.tenant_id,
                "revenue_event",
                event.id.to_string(),
                json!({"grossSats": event.gross_sats, "paymentHash": event.payment_hash}),
                "settlement",
            ));
        }
        Ok(())
    }

    /// Clear allocations whose settlement has aged past the window.
    pub async fn clear_pass(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        self.store
            .clear_allocations_settled_before(now - self.settlement_window, now)
            .await
    }

    /// Compute balances and open a payout batch per tenant for parties
    /// above the minimum.
    pub async fn open_batches(&self) -> Result<Vec<PayoutBatchRow>, StoreError> {
        let now = Utc::now();
        let balances = self.store.cleared_balances(self.min_balance_sats).await?;
        let mut by_tenant: std::collections::BTreeMap<i64, Vec<PartyBalance>> =
            std::collections::BTreeMap::new();
        for balance in balances {
            by_tenant.entry(balance.tenant_id).or_default().push(balance);
        }

        let mut batches = Vec::new();
        for (tenant_id, parties) in by_tenant {
            let transfers: Vec<NewTransfer> = parties
                .into_iter()
                .map(|party| NewTransfer {
                    agent_profile_id: party.agent_profile_id,
                    amount_sats: party.balance_sats,
                })
                .collect();
            let batch = self
                .store
                .create_payout_batch(tenant_id, transfers, now)
                .await?;
            self.bus.publish(Event::new(
                "payout_batch.created",
                tenant_id,
                "payout_batch",
                batch.id.to_string(),
                json!({"totalSats": batch.total_sats}),
                "payout",
            ));
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Execute due transfers with bounded attempts. Transient failures are
    /// retried on later passes; exhaustion or a permanent classification
    /// marks `failed_permanent`.
    pub async fn execute_due_transfers(
        &self,
        executor: &dyn TransferExecutor,
        limit: u32,
    ) -> Result<PayoutSummary, StoreError> {
        let now = Utc::now();
        let mut summary = PayoutSummary::default();
        let due = self.store.due_payout_transfers(limit).await?;
        let mut touched_batches = std::collections::BTreeSet::new();

        for transfer in due {
            let attempts = transfer.attempts + 1;
            if transfer.attempts > 0 {
                // Linear backoff between retry attempts of the same transfer.
                tokio::time::sleep(self.retry_backoff * transfer.attempts as u32).await;
            }
            let outcome = executor.execute(&transfer).await;
            let (status, error_text) = match outcome {
                Ok(()) => (TransferState::Completed, None),
                Err(TransferError::Transient(reason)) => {
                    if attempts >= self.max_attempts as i32 {
                        (TransferState::FailedPermanent, Some(reason))
                    } else {
                        (TransferState::FailedTransient, Some(reason))
                    }
                }
                Err(TransferError::Permanent(reason)) => {
                    (TransferState::FailedPermanent, Some(reason))
                }
            };

            self.store
                .update_payout_transfer(transfer.id, status, attempts, error_text.clone(), now)
                .await?;
            touched_batches.insert(transfer.batch_id);

            match status {
                TransferState::Completed => {
                    summary.transfers_completed += 1;
                    self.metrics
                        .payout_transfers_completed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                TransferState::FailedPermanent => {
                    summary.transfers_failed += 1;
                    self.metrics
                        .payout_transfers_failed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(
                        transfer_id = transfer.id,
                        party = %transfer.agent_profile_id,
                        reason = error_text.as_deref().unwrap_or("unknown"),
                        "payout transfer permanently failed"
                    );
                }
                _ => {}
            }
        }

        for batch_id in touched_batches {
            self.store.refresh_payout_batch_status(batch_id, now).await?;
        }
        Ok(summary)
    }

    /// One full payout sweep: clear, batch, execute.
    pub async fn payout_pass(
        &self,
        executor: &dyn TransferExecutor,
        limit: u32,
    ) -> Result<PayoutSummary, StoreError> {
        self.clear_pass().await?;
        let batches = self.open_batches().await?;
        let mut summary = self.execute_due_transfers(executor, limit).await?;
        summary.batches_created = batches.len() as u64;
        Ok(summary)
    }

    pub async fn list_allocations(
        &self,
        tenant_id: i64,
        payment_hash: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AllocationRow>, StoreError> {
        self.store
            .list_allocations(tenant_id, payment_hash, limit)
            .await
    }

    pub async fn list_batches(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<(PayoutBatchRow, Vec<PayoutTransferRow>)>, StoreError> {
        self.store.list_payout_batches(tenant_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::{self, NewPayment, PaymentState, PaymentTransition};

    fn policy(splits: &[(&str, u32)]) -> RevenuePolicy {
        RevenuePolicy {
            id: "default".to_string(),
            version: 1,
            splits: splits
                .iter()
                .map(|(party, share_bps)| PolicySplit {
                    party: (*party).to_string(),
                    share_bps: *share_bps,
                })
                .collect(),
        }
    }

    #[test]
    fn splits_sum_to_gross_with_residual_to_first_party() {
        let policy = policy(&[("creator", 9_000), ("platform", 1_000)]);
        let allocations = allocate_splits(501, &policy);
        let total: i64 = allocations.iter().map(|a| a.amount_sats).sum();
        assert_eq!(total, 501);
        // 501 * 0.9 = 450.9 -> 450, 501 * 0.1 = 50.1 -> 50, residual 1 to creator.
        assert_eq!(allocations[0].amount_sats, 451);
        assert_eq!(allocations[1].amount_sats, 50);
    }

    #[test]
    fn three_way_split_assigns_all_residue() {
        let policy = policy(&[("a", 3_333), ("b", 3_333), ("c", 3_334)]);
        for gross in [1, 7, 100, 999, 12_345] {
            let allocations = allocate_splits(gross, &policy);
            let total: i64 = allocations.iter().map(|a| a.amount_sats).sum();
            assert_eq!(total, gross, "gross {gross} must be fully allocated");
        }
    }

    async fn settled_payment(store: &Arc<dyn Store>, tenant_id: i64, hash: &str) -> PaymentRow {
        let now = Utc::now();
        store
            .insert_payment(NewPayment {
                tenant_id,
                payment_hash: hash.to_string(),
                provider: "mock".to_string(),
                provider_invoice_id: None,
                payment_request: "lnbc5u1x".to_string(),
                amount_sats: 1_000,
                expires_at: now + Duration::hours(1),
                resource_path: "/x".to_string(),
                actor_id: "key_1".to_string(),
                details: json!({}),
                created_at: now,
            })
            .await
            .expect("payment");
        let outcome = store
            .transition_payment(hash, PaymentState::Paid, PaymentTransition::default(), now)
            .await
            .expect("paid");
        match outcome {
            crate::store::TransitionOutcome::Applied(row) => row,
            _ => unreachable!("fresh payment must transition"),
        }
    }

    #[tokio::test]
    async fn settlement_recording_is_idempotent() {
        let config = Config::for_tests();
        let store = store::memory();
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let revenue = RevenueService::new(&config, store.clone(), bus, metrics);
        let tenant = store
            .create_tenant("Acme", "acme", Utc::now())
            .await
            .expect("tenant");
        let payment = settled_payment(&store, tenant.id, "hash-r").await;

        revenue.record_settlement(&payment).await.expect("record");
        revenue.record_settlement(&payment).await.expect("replay");

        let allocations = store
            .list_allocations(tenant.id, Some("hash-r"), 10)
            .await
            .expect("allocations");
        let total: i64 = allocations.iter().map(|a| a.amount_sats).sum();
        assert_eq!(total, 1_000);
        assert_eq!(allocations.len(), 2);
    }

    #[tokio::test]
    async fn payout_pass_batches_and_completes_transfers() {
        let config = Config::for_tests();
        let store = store::memory();
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let revenue = RevenueService::new(&config, store.clone(), bus, metrics);
        let tenant = store
            .create_tenant("Acme", "acme", Utc::now())
            .await
            .expect("tenant");
        let payment = settled_payment(&store, tenant.id, "hash-p").await;
        revenue.record_settlement(&payment).await.expect("record");

        let executor = MockTransferExecutor::default();
        let summary = revenue.payout_pass(&executor, 50).await.expect("payout");
        assert_eq!(summary.batches_created, 1);
        assert_eq!(summary.transfers_completed, 2);

        let batches = revenue.list_batches(tenant.id, 10).await.expect("batches");
        assert_eq!(batches.len(), 1);
        let (batch, transfers) = &batches[0];
        assert_eq!(batch.status, "completed");
        assert_eq!(batch.total_sats, 1_000);
        assert!(transfers
            .iter()
            .all(|transfer| transfer.status == TransferState::Completed));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_go_permanent() {
        let mut config = Config::for_tests();
        config.payout_max_attempts = 2;
        let store = store::memory();
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let revenue = RevenueService::new(&config, store.clone(), bus, metrics);
        let tenant = store
            .create_tenant("Acme", "acme", Utc::now())
            .await
            .expect("tenant");
        let payment = settled_payment(&store, tenant.id, "hash-t").await;
        revenue.record_settlement(&payment).await.expect("record");

        let executor = MockTransferExecutor::default();
        executor
            .fail_party(PARTY_CREATOR, TransferFailureMode::Transient)
            .await;

        let first = revenue.payout_pass(&executor, 50).await.expect("first");
        assert_eq!(first.transfers_completed, 1); // platform went through
        assert_eq!(first.transfers_failed, 0);

        // Second pass exhausts the creator's attempts.
        let second = revenue
            .execute_due_transfers(&executor, 50)
            .await
            .expect("second");
        assert_eq!(second.transfers_failed, 1);

        let batches = revenue.list_batches(tenant.id, 10).await.expect("batches");
        assert_eq!(batches[0].0.status, "partially_failed");
    }
}
