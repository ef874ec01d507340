//! In-memory store. A single mutex over the whole state gives the same
//! all-or-nothing semantics a transaction does; atomic batches clone the
//! state up front and restore it on failure.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    AuditEntry, AuditFilter, BatchItemOutcome, BatchOp, ContentItemChange, ContentItemFilter,
    ContentTypePatch, NewAllocation, NewApiKey, NewContentItem, NewContentType, NewEntitlement,
    NewPayment, NewPolicyDecision, NewRevenueEvent, NewTransfer, NewWebhook, NewWebhookDelivery,
    Store, StoreError, WebhookPatch,
};
use super::types::*;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
}

#[derive(Default, Clone)]
struct State {
    next_id: i64,
    tenants: HashMap<i64, TenantRow>,
    api_keys: HashMap<i64, ApiKeyRow>,
    content_types: HashMap<i64, ContentTypeRow>,
    content_items: HashMap<i64, ContentItemRow>,
    content_versions: Vec<ContentVersionRow>,
    audit_logs: Vec<AuditLogRow>,
    webhooks: HashMap<i64, WebhookRow>,
    webhook_deliveries: HashMap<i64, WebhookDeliveryRow>,
    payments: HashMap<i64, PaymentRow>,
    payment_webhook_events: Vec<(String, String)>,
    entitlements: HashMap<i64, EntitlementRow>,
    revenue_events: HashMap<i64, RevenueEventRow>,
    allocations: HashMap<i64, AllocationRow>,
    payout_batches: HashMap<i64, PayoutBatchRow>,
    payout_transfers: HashMap<i64, PayoutTransferRow>,
    policy_decisions: Vec<PolicyDecisionRow>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn append_audit(&mut self, tenant_id: i64, entry: AuditEntry, now: DateTime<Utc>) {
        let id = self.next_id();
        self.audit_logs.push(AuditLogRow {
            id,
            tenant_id,
            action: entry.action,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            details: entry.details,
            actor_id: entry.actor_id,
            request_id: entry.request_id,
            created_at: now,
        });
    }

    fn snapshot_item(&mut self, item: &ContentItemRow, now: DateTime<Utc>) {
        let id = self.next_id();
        self.content_versions.push(ContentVersionRow {
            id,
            content_item_id: item.id,
            data: item.data.clone(),
            status: item.status,
            version: item.version,
            created_at: now,
        });
    }

    fn apply_item_op(
        &mut self,
        tenant_id: i64,
        op: &BatchOp,
        audit_template: &AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<ContentItemRow>, StoreError> {
        match op {
            BatchOp::Create {
                content_type_id,
                data,
                status,
            } => {
                let type_exists = self
                    .content_types
                    .get(content_type_id)
                    .is_some_and(|t| t.tenant_id == tenant_id);
                if !type_exists {
                    return Err(StoreError::NotFound("content type"));
                }
                let id = self.next_id();
                let row = ContentItemRow {
                    id,
                    tenant_id,
                    content_type_id: *content_type_id,
                    data: data.clone(),
                    status: *status,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                self.content_items.insert(id, row.clone());
                self.append_audit(
                    tenant_id,
                    AuditEntry {
                        action: AuditAction::Create,
                        entity_id: id.to_string(),
                        ..audit_template.clone()
                    },
                    now,
                );
                Ok(Some(row))
            }
            BatchOp::Update {
                id,
                data,
                status,
                expected_version,
            } => {
                let current = self
                    .content_items
                    .get(id)
                    .filter(|item| item.tenant_id == tenant_id)
                    .cloned()
                    .ok_or(StoreError::NotFound("content item"))?;
                if let Some(expected) = expected_version {
                    if *expected != current.version {
                        return Err(StoreError::VersionConflict {
                            head: current.version,
                        });
                    }
                }
                self.snapshot_item(&current, now);
                let mut updated = current;
                if let Some(data) = data {
                    updated.data = data.clone();
                }
                if let Some(status) = status {
                    updated.status = *status;
                }
                updated.version += 1;
                updated.updated_at = now;
                self.content_items.insert(*id, updated.clone());
                self.append_audit(
                    tenant_id,
                    AuditEntry {
                        action: AuditAction::Update,
                        entity_id: id.to_string(),
                        ..audit_template.clone()
                    },
                    now,
                );
                Ok(Some(updated))
            }
            BatchOp::Delete { id } => {
                let existing = self
                    .content_items
                    .get(id)
                    .filter(|item| item.tenant_id == tenant_id)
                    .cloned()
                    .ok_or(StoreError::NotFound("content item"))?;
                self.content_items.remove(id);
                self.content_versions
                    .retain(|version| version.content_item_id != existing.id);
                self.append_audit(
                    tenant_id,
                    AuditEntry {
                        action: AuditAction::Delete,
                        entity_id: id.to_string(),
                        ..audit_template.clone()
                    },
                    now,
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_tenant(
        &self,
        name: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantRow, StoreError> {
        let mut state = self.inner.lock().await;
        if state.tenants.values().any(|t| t.slug == slug) {
            return Err(StoreError::SlugConflict);
        }
        let id = state.next_id();
        let row = TenantRow {
            id,
            name: name.to_string(),
            slug: slug.to_string(),
            created_at: now,
        };
        state.tenants.insert(id, row.clone());
        Ok(row)
    }

    async fn get_tenant(&self, id: i64) -> Result<Option<TenantRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.tenants.get(&id).cloned())
    }

    async fn insert_api_key(&self, input: NewApiKey) -> Result<ApiKeyRow, StoreError> {
        let mut state = self.inner.lock().await;
        let id = state.next_id();
        let row = ApiKeyRow {
            id,
            tenant_id: input.tenant_id,
            name: input.name,
            prefix: input.prefix,
            secret_hash: input.secret_hash,
            scopes: input.scopes,
            created_by: input.created_by,
            expires_at: input.expires_at,
            revoked_at: None,
            last_used_at: None,
            created_at: input.created_at,
        };
        state.api_keys.insert(id, row.clone());
        Ok(row)
    }

    async fn find_api_key_by_hash(
        &self,
        secret_hash: &str,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .api_keys
            .values()
            .find(|key| key.secret_hash == secret_hash)
            .cloned())
    }

    async fn get_api_key(&self, tenant_id: i64, id: i64) -> Result<Option<ApiKeyRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .api_keys
            .get(&id)
            .filter(|key| key.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_api_keys(&self, tenant_id: i64) -> Result<Vec<ApiKeyRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut keys: Vec<ApiKeyRow> = state
            .api_keys
            .values()
            .filter(|key| key.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.id);
        Ok(keys)
    }

    async fn rotate_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        new_prefix: &str,
        new_secret_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(key) = state
            .api_keys
            .get_mut(&id)
            .filter(|key| key.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        key.prefix = new_prefix.to_string();
        key.secret_hash = new_secret_hash.to_string();
        Ok(Some(key.clone()))
    }

    async fn revoke_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(key) = state
            .api_keys
            .get_mut(&id)
            .filter(|key| key.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        if key.revoked_at.is_none() {
            key.revoked_at = Some(now);
        }
        Ok(Some(key.clone()))
    }

    async fn touch_api_key(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if let Some(key) = state.api_keys.get_mut(&id) {
            key.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn insert_content_type(
        &self,
        input: NewContentType,
        audit: AuditEntry,
    ) -> Result<ContentTypeRow, StoreError> {
        let mut state = self.inner.lock().await;
        if state
            .content_types
            .values()
            .any(|t| t.tenant_id == input.tenant_id && t.slug == input.slug)
        {
            return Err(StoreError::SlugConflict);
        }
        let id = state.next_id();
        let row = ContentTypeRow {
            id,
            tenant_id: input.tenant_id,
            name: input.name,
            slug: input.slug,
            schema_json: input.schema_json,
            schema_version: 1,
            base_price_sats: input.base_price_sats,
            created_at: input.created_at,
            updated_at: input.created_at,
        };
        state.content_types.insert(id, row.clone());
        let tenant_id = input.tenant_id;
        state.append_audit(
            tenant_id,
            AuditEntry {
                entity_id: id.to_string(),
                ..audit
            },
            input.created_at,
        );
        Ok(row)
    }

    async fn get_content_type(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentTypeRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .content_types
            .get(&id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_content_types(&self, tenant_id: i64) -> Result<Vec<ContentTypeRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut types: Vec<ContentTypeRow> = state
            .content_types
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        types.sort_by_key(|t| t.id);
        Ok(types)
    }

    async fn update_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        patch: ContentTypePatch,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentTypeRow, StoreError> {
        let mut state = self.inner.lock().await;
        let current = state
            .content_types
            .get(&id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .ok_or(StoreError::NotFound("content type"))?;

        if let Some(slug) = &patch.slug {
            if state
                .content_types
                .values()
                .any(|t| t.tenant_id == tenant_id && t.slug == *slug && t.id != id)
            {
                return Err(StoreError::SlugConflict);
            }
        }

        let mut updated = current;
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(slug) = patch.slug {
            updated.slug = slug;
        }
        if let Some(schema_json) = patch.schema_json {
            if schema_json != updated.schema_json {
                updated.schema_version += 1;
            }
            updated.schema_json = schema_json;
        }
        if let Some(base_price_sats) = patch.base_price_sats {
            updated.base_price_sats = base_price_sats;
        }
        updated.updated_at = now;
        state.content_types.insert(id, updated.clone());
        state.append_audit(tenant_id, audit, now);
        Ok(updated)
    }

    async fn delete_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let exists = state
            .content_types
            .get(&id)
            .is_some_and(|t| t.tenant_id == tenant_id);
        if !exists {
            return Err(StoreError::NotFound("content type"));
        }
        if state
            .content_items
            .values()
            .any(|item| item.content_type_id == id)
        {
            return Err(StoreError::TypeInUse);
        }
        state.content_types.remove(&id);
        let now = Utc::now();
        state.append_audit(tenant_id, audit, now);
        Ok(())
    }

    async fn insert_content_item(
        &self,
        input: NewContentItem,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError> {
        let mut state = self.inner.lock().await;
        let op = BatchOp::Create {
            content_type_id: input.content_type_id,
            data: input.data,
            status: input.status,
        };
        let row = state
            .apply_item_op(input.tenant_id, &op, &audit, input.created_at)?
            .ok_or(StoreError::Db("create produced no row".to_string()))?;
        Ok(row)
    }

    async fn get_content_item(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentItemRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .content_items
            .get(&id)
            .filter(|item| item.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_content_items(
        &self,
        tenant_id: i64,
        filter: &ContentItemFilter,
    ) -> Result<Vec<ContentItemRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut items: Vec<ContentItemRow> = state
            .content_items
            .values()
            .filter(|item| item.tenant_id == tenant_id)
            .filter(|item| {
                filter
                    .content_type_id
                    .is_none_or(|type_id| item.content_type_id == type_id)
            })
            .filter(|item| filter.status.is_none_or(|status| item.status == status))
            .filter(|item| {
                filter
                    .created_after
                    .is_none_or(|after| item.created_at > after)
            })
            .filter(|item| {
                filter
                    .created_before
                    .is_none_or(|before| item.created_at < before)
            })
            .filter(|item| filter.after_id.is_none_or(|after_id| item.id > after_id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        if let Some(offset) = filter.offset {
            items = items.into_iter().skip(offset as usize).collect();
        }
        items.truncate(filter.limit.max(1) as usize);
        Ok(items)
    }

    async fn update_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        change: ContentItemChange,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError> {
        let mut state = self.inner.lock().await;
        let op = BatchOp::Update {
            id,
            data: change.data,
            status: change.status,
            expected_version: change.expected_version,
        };
        let row = state
            .apply_item_op(tenant_id, &op, &audit, change.now)?
            .ok_or(StoreError::Db("update produced no row".to_string()))?;
        Ok(row)
    }

    async fn rollback_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        target_version: i64,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentItemRow, StoreError> {
        let mut state = self.inner.lock().await;
        let current = state
            .content_items
            .get(&id)
            .filter(|item| item.tenant_id == tenant_id)
            .cloned()
            .ok_or(StoreError::NotFound("content item"))?;

        let target = state
            .content_versions
            .iter()
            .find(|version| {
                version.content_item_id == id && version.version == target_version
            })
            .cloned()
            .ok_or(StoreError::TargetVersionMissing)?;

        state.snapshot_item(&current, now);
        let mut restored = current;
        restored.data = target.data;
        restored.status = target.status;
        restored.version += 1;
        restored.updated_at = now;
        state.content_items.insert(id, restored.clone());
        state.append_audit(
            tenant_id,
            AuditEntry {
                action: AuditAction::Rollback,
                ..audit
            },
            now,
        );
        Ok(restored)
    }

    async fn delete_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let op = BatchOp::Delete { id };
        match state.apply_item_op(tenant_id, &op, &audit, Utc::now()) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn list_content_item_versions(
        &self,
        tenant_id: i64,
        item_id: i64,
    ) -> Result<Vec<ContentVersionRow>, StoreError> {
        let state = self.inner.lock().await;
        let owned = state
            .content_items
            .get(&item_id)
            .is_some_and(|item| item.tenant_id == tenant_id);
        if !owned {
            return Err(StoreError::NotFound("content item"));
        }
        let mut versions: Vec<ContentVersionRow> = state
            .content_versions
            .iter()
            .filter(|version| version.content_item_id == item_id)
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version);
        Ok(versions)
    }

    async fn apply_content_batch(
        &self,
        tenant_id: i64,
        ops: Vec<BatchOp>,
        atomic: bool,
        audit_template: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchItemOutcome>, StoreError> {
        let mut state = self.inner.lock().await;
        let checkpoint = if atomic { Some(state.clone()) } else { None };

        let mut outcomes = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            let result = state.apply_item_op(tenant_id, op, &audit_template, now);
            let failed = result.is_err();
            outcomes.push(BatchItemOutcome { index, result });
            if failed && atomic {
                if let Some(checkpoint) = checkpoint {
                    *state = checkpoint;
                }
                return Ok(outcomes);
            }
        }
        Ok(outcomes)
    }

    async fn append_audit(
        &self,
        tenant_id: i64,
        entry: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<AuditLogRow, StoreError> {
        let mut state = self.inner.lock().await;
        state.append_audit(tenant_id, entry, now);
        state
            .audit_logs
            .last()
            .cloned()
            .ok_or(StoreError::Db("audit append lost".to_string()))
    }

    async fn list_audit_logs(
        &self,
        tenant_id: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut logs: Vec<AuditLogRow> = state
            .audit_logs
            .iter()
            .filter(|log| log.tenant_id == tenant_id)
            .filter(|log| filter.action.is_none_or(|action| log.action == action))
            .filter(|log| {
                filter
                    .entity_type
                    .as_deref()
                    .is_none_or(|entity_type| log.entity_type == entity_type)
            })
            .filter(|log| filter.before_id.is_none_or(|before| log.id < before))
            .cloned()
            .collect();
        logs.sort_by_key(|log| std::cmp::Reverse(log.id));
        logs.truncate(filter.limit.max(1) as usize);
        Ok(logs)
    }

    async fn insert_webhook(&self, input: NewWebhook) -> Result<WebhookRow, StoreError> {
        let mut state = self.inner.lock().await;
        let id = state.next_id();
        let row = WebhookRow {
            id,
            tenant_id: input.tenant_id,
            url: input.url,
            event_patterns: input.event_patterns,
            secret: input.secret,
            active: input.active,
            created_at: input.created_at,
            updated_at: input.created_at,
        };
        state.webhooks.insert(id, row.clone());
        Ok(row)
    }

    async fn get_webhook(&self, tenant_id: i64, id: i64) -> Result<Option<WebhookRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .webhooks
            .get(&id)
            .filter(|hook| hook.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut hooks: Vec<WebhookRow> = state
            .webhooks
            .values()
            .filter(|hook| hook.tenant_id == tenant_id)
            .cloned()
            .collect();
        hooks.sort_by_key(|hook| hook.id);
        Ok(hooks)
    }

    async fn update_webhook(
        &self,
        tenant_id: i64,
        id: i64,
        patch: WebhookPatch,
        now: DateTime<Utc>,
    ) -> Result<WebhookRow, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(hook) = state
            .webhooks
            .get_mut(&id)
            .filter(|hook| hook.tenant_id == tenant_id)
        else {
            return Err(StoreError::NotFound("webhook"));
        };
        if let Some(url) = patch.url {
            hook.url = url;
        }
        if let Some(event_patterns) = patch.event_patterns {
            hook.event_patterns = event_patterns;
        }
        if let Some(secret) = patch.secret {
            hook.secret = secret;
        }
        if let Some(active) = patch.active {
            hook.active = active;
        }
        hook.updated_at = now;
        Ok(hook.clone())
    }

    async fn delete_webhook(&self, tenant_id: i64, id: i64) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let owned = state
            .webhooks
            .get(&id)
            .is_some_and(|hook| hook.tenant_id == tenant_id);
        if !owned {
            return Ok(false);
        }
        state.webhooks.remove(&id);
        state
            .webhook_deliveries
            .retain(|_, delivery| delivery.webhook_id != id);
        Ok(true)
    }

    async fn list_active_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .webhooks
            .values()
            .filter(|hook| hook.tenant_id == tenant_id && hook.active)
            .cloned()
            .collect())
    }

    async fn enqueue_webhook_delivery(
        &self,
        input: NewWebhookDelivery,
    ) -> Result<WebhookDeliveryRow, StoreError> {
        let mut state = self.inner.lock().await;
        let id = state.next_id();
        let row = WebhookDeliveryRow {
            id,
            tenant_id: input.tenant_id,
            webhook_id: input.webhook_id,
            event_kind: input.event_kind,
            payload: input.payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: input.next_attempt_at,
            delivered_at: None,
            created_at: input.created_at,
            updated_at: input.created_at,
        };
        state.webhook_deliveries.insert(id, row.clone());
        Ok(row)
    }

    async fn due_webhook_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDeliveryRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut due: Vec<WebhookDeliveryRow> = state
            .webhook_deliveries
            .values()
            .filter(|delivery| {
                delivery.status == DeliveryStatus::Pending && delivery.next_attempt_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|delivery| delivery.id);
        due.truncate(limit.max(1) as usize);
        Ok(due)
    }

    async fn mark_webhook_delivery(
        &self,
        id: i64,
        status: DeliveryStatus,
        attempts: i32,
        last_error: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let Some(delivery) = state.webhook_deliveries.get_mut(&id) else {
            return Err(StoreError::NotFound("webhook delivery"));
        };
        delivery.status = status;
        delivery.attempts = attempts;
        delivery.last_error = last_error;
        if let Some(next_attempt_at) = next_attempt_at {
            delivery.next_attempt_at = next_attempt_at;
        }
        if status == DeliveryStatus::Delivered {
            delivery.delivered_at = Some(now);
        }
        delivery.updated_at = now;
        Ok(())
    }

    async fn insert_payment(&self, input: NewPayment) -> Result<PaymentRow, StoreError> {
        let mut state = self.inner.lock().await;
        if state
            .payments
            .values()
            .any(|payment| payment.payment_hash == input.payment_hash)
        {
            return Err(StoreError::Db("duplicate payment_hash".to_string()));
        }
        let id = state.next_id();
        let row = PaymentRow {
            id,
            tenant_id: input.tenant_id,
            payment_hash: input.payment_hash,
            provider: input.provider,
            provider_invoice_id: input.provider_invoice_id,
            payment_request: input.payment_request,
            amount_sats: input.amount_sats,
            status: PaymentState::Pending,
            expires_at: input.expires_at,
            settled_at: None,
            failure_reason: None,
            last_event_id: None,
            resource_path: input.resource_path,
            actor_id: input.actor_id,
            details: input.details,
            created_at: input.created_at,
            updated_at: input.created_at,
        };
        state.payments.insert(id, row.clone());
        Ok(row)
    }

    async fn get_payment(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<PaymentRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .payments
            .get(&id)
            .filter(|payment| payment.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_payment_by_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<PaymentRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .payments
            .values()
            .find(|payment| payment.payment_hash == payment_hash)
            .cloned())
    }

    async fn list_payments(
        &self,
        tenant_id: i64,
        status: Option<PaymentState>,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut payments: Vec<PaymentRow> = state
            .payments
            .values()
            .filter(|payment| payment.tenant_id == tenant_id)
            .filter(|payment| status.is_none_or(|status| payment.status == status))
            .filter(|payment| before_id.is_none_or(|before| payment.id < before))
            .cloned()
            .collect();
        payments.sort_by_key(|payment| std::cmp::Reverse(payment.id));
        payments.truncate(limit.max(1) as usize);
        Ok(payments)
    }

    async fn transition_payment(
        &self,
        payment_hash: &str,
        to: PaymentState,
        update: PaymentTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(payment) = state
            .payments
            .values_mut()
            .find(|payment| payment.payment_hash == payment_hash)
        else {
            return Err(StoreError::NotFound("payment"));
        };

        if payment.status == to {
            return Ok(TransitionOutcome::AlreadyInState(payment.clone()));
        }
        if !PaymentState::allowed_from(to).contains(&payment.status) {
            return Ok(TransitionOutcome::Rejected {
                from: payment.status,
            });
        }

        payment.status = to;
        if to == PaymentState::Paid {
            payment.settled_at = Some(update.settled_at.unwrap_or(now));
        }
        if let Some(reason) = update.failure_reason {
            payment.failure_reason = Some(reason);
        }
        if let Some(event_id) = update.event_id {
            payment.last_event_id = Some(event_id);
        }
        payment.updated_at = now;
        Ok(TransitionOutcome::Applied(payment.clone()))
    }

    async fn record_payment_webhook_event(
        &self,
        _provider: &str,
        event_id: &str,
        payment_hash: &str,
        _status: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let key = (payment_hash.to_string(), event_id.to_string());
        if state.payment_webhook_events.contains(&key) {
            return Ok(false);
        }
        state.payment_webhook_events.push(key);
        Ok(true)
    }

    async fn list_stale_pending_payments(
        &self,
        provider: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut stale: Vec<PaymentRow> = state
            .payments
            .values()
            .filter(|payment| {
                payment.status == PaymentState::Pending
                    && payment.provider == provider
                    && payment.created_at < older_than
            })
            .cloned()
            .collect();
        stale.sort_by_key(|payment| payment.id);
        stale.truncate(limit.max(1) as usize);
        Ok(stale)
    }

    async fn count_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .payments
            .values()
            .filter(|payment| {
                payment.status == PaymentState::Pending && payment.created_at < older_than
            })
            .count() as i64)
    }

    async fn insert_entitlement(
        &self,
        input: NewEntitlement,
    ) -> Result<EntitlementRow, StoreError> {
        let mut state = self.inner.lock().await;
        if state
            .entitlements
            .values()
            .any(|row| row.payment_hash == input.payment_hash)
        {
            return Err(StoreError::Db("duplicate payment_hash".to_string()));
        }
        let id = state.next_id();
        let row = EntitlementRow {
            id,
            tenant_id: input.tenant_id,
            offer_kind: input.offer_kind,
            offer_id: input.offer_id,
            policy_id: input.policy_id,
            policy_version: input.policy_version,
            agent_profile_id: input.agent_profile_id,
            payment_hash: input.payment_hash,
            status: input.status,
            remaining_reads: input.remaining_reads,
            expires_at: input.expires_at,
            activated_at: None,
            terminated_at: None,
            delegated_from: input.delegated_from,
            created_at: input.created_at,
            updated_at: input.created_at,
        };
        state.entitlements.insert(id, row.clone());
        Ok(row)
    }

    async fn get_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .entitlements
            .get(&id)
            .filter(|row| row.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_entitlement_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .entitlements
            .values()
            .find(|row| row.payment_hash == payment_hash)
            .cloned())
    }

    async fn list_entitlements(
        &self,
        tenant_id: i64,
        agent_profile_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut rows: Vec<EntitlementRow> = state
            .entitlements
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .filter(|row| {
                agent_profile_id.is_none_or(|agent| row.agent_profile_id == agent)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.id));
        rows.truncate(limit.max(1) as usize);
        Ok(rows)
    }

    async fn activate_entitlement(
        &self,
        payment_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(row) = state
            .entitlements
            .values_mut()
            .find(|row| row.payment_hash == payment_hash)
        else {
            return Ok(None);
        };
        // Idempotent across retry, webhook, and reconciliation observation.
        if row.status == EntitlementState::PendingPayment {
            row.status = EntitlementState::Active;
            row.activated_at = Some(now);
            row.updated_at = now;
        }
        Ok(Some(row.clone()))
    }

    async fn find_active_entitlement(
        &self,
        tenant_id: i64,
        offer_kind: OfferKind,
        offer_id: i64,
        agent_profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .entitlements
            .values()
            .filter(|row| {
                row.tenant_id == tenant_id
                    && row.offer_kind == offer_kind
                    && row.offer_id == offer_id
                    && row.agent_profile_id == agent_profile_id
                    && row.status == EntitlementState::Active
                    && row.expires_at.is_none_or(|expires| expires > now)
            })
            .min_by_key(|row| row.id)
            .cloned())
    }

    async fn consume_entitlement(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(row) = state.entitlements.get_mut(&id) else {
            return Err(StoreError::NotFound("entitlement"));
        };
        if row.status != EntitlementState::Active {
            return Ok(ConsumeOutcome::NotActive { status: row.status });
        }

        match row.remaining_reads {
            None => {
                row.updated_at = now;
                Ok(ConsumeOutcome::Consumed { remaining: None })
            }
            Some(remaining) if remaining > 1 => {
                row.remaining_reads = Some(remaining - 1);
                row.updated_at = now;
                Ok(ConsumeOutcome::Consumed {
                    remaining: Some(remaining - 1),
                })
            }
            Some(remaining) if remaining == 1 => {
                row.remaining_reads = Some(0);
                row.status = EntitlementState::Exhausted;
                row.terminated_at = Some(now);
                row.updated_at = now;
                Ok(ConsumeOutcome::ConsumedAndExhausted)
            }
            Some(_) => {
                // Zero or negative despite Active status; treat as exhausted.
                row.status = EntitlementState::Exhausted;
                row.terminated_at = Some(now);
                row.updated_at = now;
                Ok(ConsumeOutcome::NotActive {
                    status: EntitlementState::Exhausted,
                })
            }
        }
    }

    async fn expire_entitlements(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError> {
        let mut state = self.inner.lock().await;
        let mut expired = Vec::new();
        let mut ids: Vec<i64> = state
            .entitlements
            .values()
            .filter(|row| {
                row.status == EntitlementState::Active
                    && row.expires_at.is_some_and(|expires| expires <= now)
            })
            .map(|row| row.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit.max(1) as usize);
        for id in ids {
            if let Some(row) = state.entitlements.get_mut(&id) {
                row.status = EntitlementState::Expired;
                row.terminated_at = Some(now);
                row.updated_at = now;
                expired.push(row.clone());
            }
        }
        Ok(expired)
    }

    async fn revoke_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(row) = state
            .entitlements
            .get_mut(&id)
            .filter(|row| row.tenant_id == tenant_id)
        else {
            return Ok(None);
        };
        if !row.status.is_terminal() {
            row.status = EntitlementState::Revoked;
            row.terminated_at = Some(now);
            row.updated_at = now;
        }
        Ok(Some(row.clone()))
    }

    async fn reduce_entitlement_quota(
        &self,
        id: i64,
        reads: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        let Some(row) = state.entitlements.get_mut(&id) else {
            return Err(StoreError::NotFound("entitlement"));
        };
        match row.remaining_reads {
            None => Ok(true),
            Some(remaining) if remaining >= reads => {
                row.remaining_reads = Some(remaining - reads);
                row.updated_at = now;
                if remaining == reads {
                    row.status = EntitlementState::Exhausted;
                    row.terminated_at = Some(now);
                }
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn insert_revenue_event(
        &self,
        event: NewRevenueEvent,
        allocations: Vec<NewAllocation>,
    ) -> Result<Option<RevenueEventRow>, StoreError> {
        let mut state = self.inner.lock().await;
        if state
            .revenue_events
            .values()
            .any(|row| row.payment_hash == event.payment_hash)
        {
            return Ok(None);
        }
        let event_id = state.next_id();
        let row = RevenueEventRow {
            id: event_id,
            tenant_id: event.tenant_id,
            payment_hash: event.payment_hash,
            gross_sats: event.gross_sats,
            policy_id: event.policy_id,
            policy_version: event.policy_version,
            settled_at: event.settled_at,
            created_at: event.created_at,
        };
        state.revenue_events.insert(event_id, row.clone());
        for allocation in allocations {
            let id = state.next_id();
            state.allocations.insert(
                id,
                AllocationRow {
                    id,
                    tenant_id: event.tenant_id,
                    revenue_event_id: event_id,
                    agent_profile_id: allocation.agent_profile_id,
                    amount_sats: allocation.amount_sats,
                    status: AllocationState::Pending,
                    cleared_at: None,
                    created_at: event.created_at,
                    updated_at: event.created_at,
                },
            );
        }
        Ok(Some(row))
    }

    async fn list_allocations(
        &self,
        tenant_id: i64,
        payment_hash: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AllocationRow>, StoreError> {
        let state = self.inner.lock().await;
        let event_id = payment_hash.and_then(|hash| {
            state
                .revenue_events
                .values()
                .find(|event| event.payment_hash == hash)
                .map(|event| event.id)
        });
        let mut rows: Vec<AllocationRow> = state
            .allocations
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .filter(|row| {
                payment_hash.is_none() || event_id.is_some_and(|id| row.revenue_event_id == id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows.truncate(limit.max(1) as usize);
        Ok(rows)
    }

    async fn clear_allocations_settled_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().await;
        let eligible_events: Vec<i64> = state
            .revenue_events
            .values()
            .filter(|event| event.settled_at <= cutoff)
            .map(|event| event.id)
            .collect();
        let mut cleared = 0u64;
        for allocation in state.allocations.values_mut() {
            if allocation.status == AllocationState::Pending
                && eligible_events.contains(&allocation.revenue_event_id)
            {
                allocation.status = AllocationState::Cleared;
                allocation.cleared_at = Some(now);
                allocation.updated_at = now;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn cleared_balances(&self, min_balance: i64) -> Result<Vec<PartyBalance>, StoreError> {
        let state = self.inner.lock().await;
        let mut cleared: HashMap<(i64, String), i64> = HashMap::new();
        for allocation in state.allocations.values() {
            if allocation.status == AllocationState::Cleared {
                *cleared
                    .entry((allocation.tenant_id, allocation.agent_profile_id.clone()))
                    .or_insert(0) += allocation.amount_sats;
            }
        }
        // Transfers that are pending, retrying, or completed hold their sats;
        // permanently failed transfers release them back to the balance.
        for transfer in state.payout_transfers.values() {
            if transfer.status != TransferState::FailedPermanent {
                *cleared
                    .entry((transfer.tenant_id, transfer.agent_profile_id.clone()))
                    .or_insert(0) -= transfer.amount_sats;
            }
        }
        let mut balances: Vec<PartyBalance> = cleared
            .into_iter()
            .filter(|(_, balance)| *balance >= min_balance)
            .map(|((tenant_id, agent_profile_id), balance_sats)| PartyBalance {
                tenant_id,
                agent_profile_id,
                balance_sats,
            })
            .collect();
        balances.sort_by(|left, right| {
            (left.tenant_id, &left.agent_profile_id)
                .cmp(&(right.tenant_id, &right.agent_profile_id))
        });
        Ok(balances)
    }

    async fn create_payout_batch(
        &self,
        tenant_id: i64,
        transfers: Vec<NewTransfer>,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError> {
        let mut state = self.inner.lock().await;
        let batch_id = state.next_id();
        let total_sats = transfers.iter().map(|t| t.amount_sats).sum();
        let batch = PayoutBatchRow {
            id: batch_id,
            tenant_id,
            status: "pending".to_string(),
            total_sats,
            created_at: now,
            updated_at: now,
        };
        state.payout_batches.insert(batch_id, batch.clone());
        for transfer in transfers {
            let id = state.next_id();
            state.payout_transfers.insert(
                id,
                PayoutTransferRow {
                    id,
                    tenant_id,
                    batch_id,
                    agent_profile_id: transfer.agent_profile_id,
                    amount_sats: transfer.amount_sats,
                    status: TransferState::Pending,
                    attempts: 0,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(batch)
    }

    async fn due_payout_transfers(
        &self,
        limit: u32,
    ) -> Result<Vec<PayoutTransferRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut due: Vec<PayoutTransferRow> = state
            .payout_transfers
            .values()
            .filter(|transfer| {
                matches!(
                    transfer.status,
                    TransferState::Pending | TransferState::FailedTransient
                )
            })
            .cloned()
            .collect();
        due.sort_by_key(|transfer| transfer.id);
        due.truncate(limit.max(1) as usize);
        Ok(due)
    }

    async fn update_payout_transfer(
        &self,
        id: i64,
        status: TransferState,
        attempts: i32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let Some(transfer) = state.payout_transfers.get_mut(&id) else {
            return Err(StoreError::NotFound("payout transfer"));
        };
        transfer.status = status;
        transfer.attempts = attempts;
        transfer.last_error = last_error;
        transfer.updated_at = now;
        Ok(())
    }

    async fn refresh_payout_batch_status(
        &self,
        batch_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError> {
        let mut state = self.inner.lock().await;
        let statuses: Vec<TransferState> = state
            .payout_transfers
            .values()
            .filter(|transfer| transfer.batch_id == batch_id)
            .map(|transfer| transfer.status)
            .collect();
        let Some(batch) = state.payout_batches.get_mut(&batch_id) else {
            return Err(StoreError::NotFound("payout batch"));
        };
        batch.status = aggregate_batch_status(&statuses).to_string();
        batch.updated_at = now;
        Ok(batch.clone())
    }

    async fn list_payout_batches(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<(PayoutBatchRow, Vec<PayoutTransferRow>)>, StoreError> {
        let state = self.inner.lock().await;
        let mut batches: Vec<PayoutBatchRow> = state
            .payout_batches
            .values()
            .filter(|batch| batch.tenant_id == tenant_id)
            .cloned()
            .collect();
        batches.sort_by_key(|batch| std::cmp::Reverse(batch.id));
        batches.truncate(limit.max(1) as usize);
        Ok(batches
            .into_iter()
            .map(|batch| {
                let mut transfers: Vec<PayoutTransferRow> = state
                    .payout_transfers
                    .values()
                    .filter(|transfer| transfer.batch_id == batch.id)
                    .cloned()
                    .collect();
                transfers.sort_by_key(|transfer| transfer.id);
                (batch, transfers)
            })
            .collect())
    }

    async fn append_policy_decision(
        &self,
        input: NewPolicyDecision,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let id = state.next_id();
        state.policy_decisions.push(PolicyDecisionRow {
            id,
            tenant_id: input.tenant_id,
            actor_id: input.actor_id,
            operation: input.operation,
            resource: input.resource,
            decision: input.decision,
            reason: input.reason,
            request_id: input.request_id,
            created_at: input.created_at,
        });
        Ok(())
    }

    async fn list_policy_decisions(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<PolicyDecisionRow>, StoreError> {
        let state = self.inner.lock().await;
        let mut rows: Vec<PolicyDecisionRow> = state
            .policy_decisions
            .iter()
            .filter(|row| row.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.id));
        rows.truncate(limit.max(1) as usize);
        Ok(rows)
    }
}

/// Batch status aggregation: completed when every transfer completed,
/// failed when every transfer is terminal and at least one failed,
/// otherwise still pending.
pub fn aggregate_batch_status(statuses: &[TransferState]) -> &'static str {
    if statuses.is_empty() {
        return "completed";
    }
    let all_terminal = statuses.iter().all(|status| {
        matches!(
            status,
            TransferState::Completed | TransferState::FailedPermanent
        )
    });
    if !all_terminal {
        return "pending";
    }
    if statuses
        .iter()
        .any(|status| *status == TransferState::FailedPermanent)
    {
        return "partially_failed";
    }
    "completed"
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::super::{
        AuditEntry, ContentItemChange, NewContentItem, NewContentType, NewEntitlement, Store,
        StoreError,
    };
    use super::MemoryStore;
    use super::super::types::*;

    fn audit(actor: &str) -> AuditEntry {
        AuditEntry {
            action: AuditAction::Create,
            entity_type: "content_item".to_string(),
            entity_id: String::new(),
            details: json!({}),
            actor_id: actor.to_string(),
            request_id: "req-test".to_string(),
        }
    }

    async fn seed_type(store: &MemoryStore, tenant_id: i64) -> ContentTypeRow {
        store
            .insert_content_type(
                NewContentType {
                    tenant_id,
                    name: "Post".to_string(),
                    slug: "post".to_string(),
                    schema_json: "{}".to_string(),
                    base_price_sats: 0,
                    created_at: Utc::now(),
                },
                audit("seed"),
            )
            .await
            .expect("insert type")
    }

    #[tokio::test]
    async fn versions_are_gapless_across_updates() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let tenant = store
            .create_tenant("t", "t", now)
            .await
            .expect("create tenant");
        let kind = seed_type(&store, tenant.id).await;

        let item = store
            .insert_content_item(
                NewContentItem {
                    tenant_id: tenant.id,
                    content_type_id: kind.id,
                    data: json!({"title": "v1"}),
                    status: ContentStatus::Draft,
                    created_at: now,
                },
                audit("a"),
            )
            .await
            .expect("insert item");
        assert_eq!(item.version, 1);

        for round in 2..=5 {
            let updated = store
                .update_content_item(
                    tenant.id,
                    item.id,
                    ContentItemChange {
                        data: Some(json!({"title": format!("v{round}")})),
                        status: None,
                        expected_version: None,
                        now: Utc::now(),
                    },
                    audit("a"),
                )
                .await
                .expect("update item");
            assert_eq!(updated.version, round);
        }

        let versions = store
            .list_content_item_versions(tenant.id, item.id)
            .await
            .expect("list versions");
        let recorded: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(recorded, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn optimistic_update_detects_version_conflict() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let tenant = store.create_tenant("t", "t", now).await.expect("tenant");
        let kind = seed_type(&store, tenant.id).await;
        let item = store
            .insert_content_item(
                NewContentItem {
                    tenant_id: tenant.id,
                    content_type_id: kind.id,
                    data: json!({}),
                    status: ContentStatus::Draft,
                    created_at: now,
                },
                audit("a"),
            )
            .await
            .expect("insert");

        let conflict = store
            .update_content_item(
                tenant.id,
                item.id,
                ContentItemChange {
                    data: Some(json!({"x": 1})),
                    status: None,
                    expected_version: Some(99),
                    now,
                },
                audit("a"),
            )
            .await;
        assert!(matches!(
            conflict,
            Err(StoreError::VersionConflict { head: 1 })
        ));
    }

    #[tokio::test]
    async fn payment_transitions_reject_reverse_moves() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let tenant = store.create_tenant("t", "t", now).await.expect("tenant");
        store
            .insert_payment(super::super::NewPayment {
                tenant_id: tenant.id,
                payment_hash: "hash-1".to_string(),
                provider: "mock".to_string(),
                provider_invoice_id: None,
                payment_request: "lnbc1u1x".to_string(),
                amount_sats: 100,
                expires_at: now + chrono::Duration::hours(1),
                resource_path: "/x".to_string(),
                actor_id: "a".to_string(),
                details: json!({}),
                created_at: now,
            })
            .await
            .expect("insert payment");

        let paid = store
            .transition_payment("hash-1", PaymentState::Paid, PaymentTransition::default(), now)
            .await
            .expect("transition");
        assert!(matches!(paid, TransitionOutcome::Applied(_)));

        let back = store
            .transition_payment(
                "hash-1",
                PaymentState::Expired,
                PaymentTransition::default(),
                now,
            )
            .await
            .expect("transition");
        assert!(matches!(
            back,
            TransitionOutcome::Rejected {
                from: PaymentState::Paid
            }
        ));

        let again = store
            .transition_payment("hash-1", PaymentState::Paid, PaymentTransition::default(), now)
            .await
            .expect("transition");
        assert!(matches!(again, TransitionOutcome::AlreadyInState(_)));
    }

    #[tokio::test]
    async fn consume_never_overshoots_quota() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let tenant = store.create_tenant("t", "t", now).await.expect("tenant");
        let row = store
            .insert_entitlement(NewEntitlement {
                tenant_id: tenant.id,
                offer_kind: OfferKind::ContentItem,
                offer_id: 1,
                policy_id: "default".to_string(),
                policy_version: 1,
                agent_profile_id: "agent-1".to_string(),
                payment_hash: "hash-e".to_string(),
                status: EntitlementState::PendingPayment,
                remaining_reads: Some(2),
                expires_at: None,
                delegated_from: None,
                created_at: now,
            })
            .await
            .expect("insert entitlement");
        store
            .activate_entitlement("hash-e", now)
            .await
            .expect("activate");

        let first = store.consume_entitlement(row.id, now).await.expect("consume");
        assert_eq!(
            first,
            ConsumeOutcome::Consumed {
                remaining: Some(1)
            }
        );
        let second = store.consume_entitlement(row.id, now).await.expect("consume");
        assert_eq!(second, ConsumeOutcome::ConsumedAndExhausted);
        let third = store.consume_entitlement(row.id, now).await.expect("consume");
        assert!(matches!(
            third,
            ConsumeOutcome::NotActive {
                status: EntitlementState::Exhausted
            }
        ));
    }

    #[tokio::test]
    async fn atomic_batch_rolls_back_on_failure() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let tenant = store.create_tenant("t", "t", now).await.expect("tenant");
        let kind = seed_type(&store, tenant.id).await;

        let outcomes = store
            .apply_content_batch(
                tenant.id,
                vec![
                    super::super::BatchOp::Create {
                        content_type_id: kind.id,
                        data: json!({"n": 1}),
                        status: ContentStatus::Draft,
                    },
                    super::super::BatchOp::Update {
                        id: 999_999,
                        data: Some(json!({})),
                        status: None,
                        expected_version: None,
                    },
                ],
                true,
                audit("a"),
                now,
            )
            .await
            .expect("batch");
        assert!(outcomes[1].result.is_err());

        let items = store
            .list_content_items(
                tenant.id,
                &super::super::ContentItemFilter {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .expect("list");
        assert!(items.is_empty(), "atomic failure must leave no rows behind");
    }
}
