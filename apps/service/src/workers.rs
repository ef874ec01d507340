//! Background workers: each is a loop with a shutdown channel and a
//! configurable interval. `start`/`stop` are safe to call repeatedly;
//! workers never share cancellation scope with request handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::entitlements::EntitlementService;
use crate::payments::PaymentService;
use crate::revenue::{LedgerTransferExecutor, RevenueService, TransferExecutor};
use crate::webhooks::WebhookService;

const WORKER_BATCH_LIMIT: u32 = 100;

struct WorkerTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Workers {
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<WorkerTask>>,
}

impl Workers {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            started: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn all enabled workers. A second call is a no-op.
    pub async fn start(
        self: &Arc<Self>,
        config: &Config,
        payments: PaymentService,
        entitlements: EntitlementService,
        revenue: RevenueService,
        webhooks: WebhookService,
    ) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;

        if config.reconcile_enabled {
            let payments = payments.clone();
            let pending_age = chrono::Duration::seconds(config.reconcile_pending_age_seconds as i64);
            let batch_limit = config.reconcile_batch_limit.max(1);
            tasks.push(self.spawn_loop(
                "payment-reconciliation",
                Duration::from_secs(config.reconcile_interval_seconds.max(1)),
                move || {
                    let payments = payments.clone();
                    async move {
                        match payments.reconcile_once(pending_age, batch_limit).await {
                            Ok(summary) if summary.checked > 0 => {
                                tracing::info!(
                                    checked = summary.checked,
                                    corrected = summary.corrected,
                                    failures = summary.failures,
                                    "reconciliation tick"
                                );
                            }
                            Ok(_) => {}
                            Err(error) => {
                                tracing::warn!(reason = %error, "reconciliation tick failed");
                            }
                        }
                    }
                },
            ));
        }

        if config.entitlement_sweep_enabled {
            let entitlements = entitlements.clone();
            tasks.push(self.spawn_loop(
                "entitlement-expiry",
                Duration::from_secs(config.entitlement_sweep_interval_seconds.max(1)),
                move || {
                    let entitlements = entitlements.clone();
                    async move {
                        match entitlements.expire_due(WORKER_BATCH_LIMIT).await {
                            Ok(0) => {}
                            Ok(expired) => {
                                tracing::info!(expired, "entitlement expiry tick");
                            }
                            Err(error) => {
                                tracing::warn!(reason = %error, "entitlement expiry tick failed");
                            }
                        }
                    }
                },
            ));
        }

        if config.payout_enabled {
            let revenue = revenue.clone();
            let executor: Arc<dyn TransferExecutor> = Arc::new(LedgerTransferExecutor);
            tasks.push(self.spawn_loop(
                "payout-sweep",
                Duration::from_secs(config.payout_interval_seconds.max(1)),
                move || {
                    let revenue = revenue.clone();
                    let executor = executor.clone();
                    async move {
                        match revenue.payout_pass(executor.as_ref(), WORKER_BATCH_LIMIT).await {
                            Ok(summary)
                                if summary.batches_created > 0
                                    || summary.transfers_completed > 0 =>
                            {
                                tracing::info!(
                                    batches = summary.batches_created,
                                    completed = summary.transfers_completed,
                                    failed = summary.transfers_failed,
                                    "payout tick"
                                );
                            }
                            Ok(_) => {}
                            Err(error) => {
                                tracing::warn!(reason = %error, "payout tick failed");
                            }
                        }
                    }
                },
            ));
        }

        if config.webhook_delivery_enabled {
            let webhooks = webhooks.clone();
            tasks.push(self.spawn_loop(
                "webhook-delivery",
                Duration::from_secs(config.webhook_interval_seconds.max(1)),
                move || {
                    let webhooks = webhooks.clone();
                    async move {
                        match webhooks.deliver_due(WORKER_BATCH_LIMIT).await {
                            Ok(summary) if summary.attempted > 0 => {
                                tracing::info!(
                                    attempted = summary.attempted,
                                    delivered = summary.delivered,
                                    failed = summary.failed_terminal,
                                    "webhook delivery tick"
                                );
                            }
                            Ok(_) => {}
                            Err(error) => {
                                tracing::warn!(reason = %error, "webhook delivery tick failed");
                            }
                        }
                    }
                },
            ));
        }

        tracing::info!(count = tasks.len(), "background workers started");
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        tick: F,
    ) -> WorkerTask
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(worker = name, "worker loop stopping");
                            return;
                        }
                    }
                }
            }
        });
        WorkerTask { name, handle }
    }

    /// Signal every worker and wait for the loops to finish. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(error) = task.handle.await {
                if !error.is_cancelled() {
                    tracing::warn!(worker = task.name, reason = %error, "worker join failed");
                }
            }
        }
        let _ = self.shutdown.send(false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::EventBus;
    use crate::metrics::Metrics;
    use crate::provider::MockPaymentProvider;
    use crate::store;

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut config = Config::for_tests();
        config.reconcile_enabled = true;
        config.reconcile_interval_seconds = 3600;
        config.entitlement_sweep_enabled = true;
        config.entitlement_sweep_interval_seconds = 3600;

        let store = store::memory();
        let metrics = Arc::new(Metrics::default());
        let bus = EventBus::new(metrics.clone());
        let revenue = RevenueService::new(&config, store.clone(), bus.clone(), metrics.clone());
        let payments = PaymentService::new(
            &config,
            store.clone(),
            Arc::new(MockPaymentProvider::new()),
            revenue.clone(),
            bus.clone(),
            metrics.clone(),
        );
        let entitlements = EntitlementService::new(store.clone(), bus, metrics.clone());
        let webhooks = WebhookService::new(store, metrics, 3, 1, 10, 1_000);

        let workers = Workers::new();
        workers
            .start(
                &config,
                payments.clone(),
                entitlements.clone(),
                revenue.clone(),
                webhooks.clone(),
            )
            .await;
        // Second start is a no-op rather than doubling the loops.
        workers
            .start(&config, payments, entitlements, revenue, webhooks)
            .await;
        assert_eq!(workers.tasks.lock().await.len(), 2);

        workers.stop().await;
        assert!(workers.tasks.lock().await.is_empty());
        workers.stop().await;
    }
}
