//! Immutable log of authorization decisions. Recording is fire-and-forget
//! so the hot path never waits on it.

use std::sync::Arc;

use chrono::Utc;

use crate::store::{NewPolicyDecision, PolicyDecisionRow, Store, StoreError};

pub const DECISION_ALLOW: &str = "allow";
pub const DECISION_DENY: &str = "deny";

#[derive(Clone)]
pub struct PolicyDecisionRecorder {
    store: Arc<dyn Store>,
}

impl PolicyDecisionRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn record(
        &self,
        tenant_id: i64,
        actor_id: &str,
        operation: &str,
        resource: &str,
        decision: &'static str,
        reason: &str,
        request_id: &str,
    ) {
        let store = self.store.clone();
        let input = NewPolicyDecision {
            tenant_id,
            actor_id: actor_id.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            decision: decision.to_string(),
            reason: reason.to_string(),
            request_id: request_id.to_string(),
            created_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(error) = store.append_policy_decision(input).await {
                tracing::debug!(reason = %error, "policy decision append failed");
            }
        });
    }

    pub async fn list(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<PolicyDecisionRow>, StoreError> {
        self.store
            .list_policy_decisions(tenant_id, limit.clamp(1, 200))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[tokio::test]
    async fn decisions_are_recorded_newest_first() {
        let store = store::memory();
        let recorder = PolicyDecisionRecorder::new(store.clone());
        let tenant = store
            .create_tenant("Acme", "acme", Utc::now())
            .await
            .expect("tenant");

        recorder.record(
            tenant.id,
            "key_1",
            "content_item.read",
            "/api/v1/content-items/30",
            DECISION_DENY,
            "cross_tenant",
            "req-1",
        );
        recorder.record(
            tenant.id,
            "key_1",
            "content_item.create",
            "/api/v1/content-items",
            DECISION_ALLOW,
            "scoped",
            "req-2",
        );
        // Recording is detached; give the spawned tasks a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let decisions = recorder.list(tenant.id, 10).await.expect("list");
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].id > decisions[1].id);
        assert!(decisions.iter().any(|d| d.reason == "cross_tenant"));
    }
}
