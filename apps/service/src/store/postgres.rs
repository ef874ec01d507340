//! Postgres-backed store. State-machine and versioning invariants are
//! enforced with row locks (`FOR UPDATE`) or conditional updates so that
//! concurrent writers serialize per row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

use super::types::*;
use super::{
    AuditEntry, AuditFilter, BatchItemOutcome, BatchOp, ContentItemChange, ContentItemFilter,
    ContentTypePatch, NewAllocation, NewApiKey, NewContentItem, NewContentType, NewEntitlement,
    NewPayment, NewPolicyDecision, NewRevenueEvent, NewTransfer, NewWebhook, NewWebhookDelivery,
    Store, StoreError, WebhookPatch,
};
use crate::db::Db;
use crate::store::memory::aggregate_batch_status;

pub struct PostgresStore {
    db: Db,
}

impl PostgresStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn db_err(error: tokio_postgres::Error) -> StoreError {
    StoreError::Db(error.to_string())
}

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

fn is_sqlstate(error: &tokio_postgres::Error, code: &str) -> bool {
    error
        .as_db_error()
        .is_some_and(|db_error| db_error.code().code() == code)
}

fn map_tenant_row(row: &Row) -> TenantRow {
    TenantRow {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        created_at: row.get("created_at"),
    }
}

fn map_api_key_row(row: &Row) -> ApiKeyRow {
    ApiKeyRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        prefix: row.get("prefix"),
        secret_hash: row.get("secret_hash"),
        scopes: row.get("scopes"),
        created_by: row.get("created_by"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
        last_used_at: row.get("last_used_at"),
        created_at: row.get("created_at"),
    }
}

fn map_content_type_row(row: &Row) -> ContentTypeRow {
    ContentTypeRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        schema_json: row.get("schema_json"),
        schema_version: row.get("schema_version"),
        base_price_sats: row.get("base_price_sats"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_content_item_row(row: &Row) -> Result<ContentItemRow, StoreError> {
    let status: String = row.get("status");
    Ok(ContentItemRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        content_type_id: row.get("content_type_id"),
        data: row.get("data"),
        status: ContentStatus::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown content status '{status}'")))?,
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_content_version_row(row: &Row) -> Result<ContentVersionRow, StoreError> {
    let status: String = row.get("status");
    Ok(ContentVersionRow {
        id: row.get("id"),
        content_item_id: row.get("content_item_id"),
        data: row.get("data"),
        status: ContentStatus::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown content status '{status}'")))?,
        version: row.get("version"),
        created_at: row.get("created_at"),
    })
}

fn map_audit_row(row: &Row) -> Result<AuditLogRow, StoreError> {
    let action: String = row.get("action");
    Ok(AuditLogRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        action: AuditAction::parse(&action)
            .ok_or_else(|| StoreError::Db(format!("unknown audit action '{action}'")))?,
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        details: row.get("details"),
        actor_id: row.get("actor_id"),
        request_id: row.get("request_id"),
        created_at: row.get("created_at"),
    })
}

fn map_webhook_row(row: &Row) -> WebhookRow {
    WebhookRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        url: row.get("url"),
        event_patterns: row.get("event_patterns"),
        secret: row.get("secret"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_delivery_row(row: &Row) -> Result<WebhookDeliveryRow, StoreError> {
    let status: String = row.get("status");
    Ok(WebhookDeliveryRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        webhook_id: row.get("webhook_id"),
        event_kind: row.get("event_kind"),
        payload: row.get("payload"),
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown delivery status '{status}'")))?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        next_attempt_at: row.get("next_attempt_at"),
        delivered_at: row.get("delivered_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_payment_row(row: &Row) -> Result<PaymentRow, StoreError> {
    let status: String = row.get("status");
    Ok(PaymentRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        payment_hash: row.get("payment_hash"),
        provider: row.get("provider"),
        provider_invoice_id: row.get("provider_invoice_id"),
        payment_request: row.get("payment_request"),
        amount_sats: row.get("amount_sats"),
        status: PaymentState::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown payment status '{status}'")))?,
        expires_at: row.get("expires_at"),
        settled_at: row.get("settled_at"),
        failure_reason: row.get("failure_reason"),
        last_event_id: row.get("last_event_id"),
        resource_path: row.get("resource_path"),
        actor_id: row.get("actor_id"),
        details: row.get("details"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_entitlement_row(row: &Row) -> Result<EntitlementRow, StoreError> {
    let status: String = row.get("status");
    let offer_kind: String = row.get("offer_kind");
    Ok(EntitlementRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        offer_kind: OfferKind::parse(&offer_kind)
            .ok_or_else(|| StoreError::Db(format!("unknown offer kind '{offer_kind}'")))?,
        offer_id: row.get("offer_id"),
        policy_id: row.get("policy_id"),
        policy_version: row.get("policy_version"),
        agent_profile_id: row.get("agent_profile_id"),
        payment_hash: row.get("payment_hash"),
        status: EntitlementState::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown entitlement status '{status}'")))?,
        remaining_reads: row.get("remaining_reads"),
        expires_at: row.get("expires_at"),
        activated_at: row.get("activated_at"),
        terminated_at: row.get("terminated_at"),
        delegated_from: row.get("delegated_from"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_revenue_event_row(row: &Row) -> RevenueEventRow {
    RevenueEventRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        payment_hash: row.get("payment_hash"),
        gross_sats: row.get("gross_sats"),
        policy_id: row.get("policy_id"),
        policy_version: row.get("policy_version"),
        settled_at: row.get("settled_at"),
        created_at: row.get("created_at"),
    }
}

fn map_allocation_row(row: &Row) -> Result<AllocationRow, StoreError> {
    let status: String = row.get("status");
    Ok(AllocationRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        revenue_event_id: row.get("revenue_event_id"),
        agent_profile_id: row.get("agent_profile_id"),
        amount_sats: row.get("amount_sats"),
        status: AllocationState::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown allocation status '{status}'")))?,
        cleared_at: row.get("cleared_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_batch_row(row: &Row) -> PayoutBatchRow {
    PayoutBatchRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        status: row.get("status"),
        total_sats: row.get("total_sats"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_transfer_row(row: &Row) -> Result<PayoutTransferRow, StoreError> {
    let status: String = row.get("status");
    Ok(PayoutTransferRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        batch_id: row.get("batch_id"),
        agent_profile_id: row.get("agent_profile_id"),
        amount_sats: row.get("amount_sats"),
        status: TransferState::parse(&status)
            .ok_or_else(|| StoreError::Db(format!("unknown transfer status '{status}'")))?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_decision_row(row: &Row) -> PolicyDecisionRow {
    PolicyDecisionRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        actor_id: row.get("actor_id"),
        operation: row.get("operation"),
        resource: row.get("resource"),
        decision: row.get("decision"),
        reason: row.get("reason"),
        request_id: row.get("request_id"),
        created_at: row.get("created_at"),
    }
}

async fn insert_audit_tx(
    tx: &tokio_postgres::Transaction<'_>,
    tenant_id: i64,
    entry: &AuditEntry,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO audit_logs (tenant_id, action, entity_type, entity_id, details, actor_id, request_id, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        "#,
        &[
            &tenant_id,
            &entry.action.as_str(),
            &entry.entity_type,
            &entry.entity_id,
            &entry.details,
            &entry.actor_id,
            &entry.request_id,
            &now,
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Snapshot the current head row into the versions table. Caller holds the
/// row lock.
async fn snapshot_item_tx(
    tx: &tokio_postgres::Transaction<'_>,
    item: &ContentItemRow,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO content_item_versions (content_item_id, data, status, version, created_at)
        VALUES ($1,$2,$3,$4,$5)
        "#,
        &[
            &item.id,
            &item.data,
            &item.status.as_str(),
            &item.version,
            &now,
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn apply_item_op_tx(
    tx: &tokio_postgres::Transaction<'_>,
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
            let type_row = tx
                .query_opt(
                    "SELECT id FROM content_types WHERE id = $1 AND tenant_id = $2",
                    &[content_type_id, &tenant_id],
                )
                .await
                .map_err(db_err)?;
            if type_row.is_none() {
                return Err(StoreError::NotFound("content type"));
            }

            let row = tx
                .query_one(
                    r#"
                    INSERT INTO content_items (tenant_id, content_type_id, data, status, version, created_at, updated_at)
                    VALUES ($1,$2,$3,$4,1,$5,$5)
                    RETURNING *
                    "#,
                    &[&tenant_id, content_type_id, data, &status.as_str(), &now],
                )
                .await
                .map_err(db_err)?;
            let item = map_content_item_row(&row)?;
            insert_audit_tx(
                tx,
                tenant_id,
                &AuditEntry {
                    action: AuditAction::Create,
                    entity_id: item.id.to_string(),
                    ..audit_template.clone()
                },
                now,
            )
            .await?;
            Ok(Some(item))
        }
        BatchOp::Update {
            id,
            data,
            status,
            expected_version,
        } => {
            let row = tx
                .query_opt(
                    "SELECT * FROM content_items WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
                    &[id, &tenant_id],
                )
                .await
                .map_err(db_err)?
                .ok_or(StoreError::NotFound("content item"))?;
            let current = map_content_item_row(&row)?;
            if let Some(expected) = expected_version {
                if *expected != current.version {
                    return Err(StoreError::VersionConflict {
                        head: current.version,
                    });
                }
            }

            snapshot_item_tx(tx, &current, now).await?;

            let new_data = data.clone().unwrap_or_else(|| current.data.clone());
            let new_status = status.unwrap_or(current.status);
            let row = tx
                .query_one(
                    r#"
                    UPDATE content_items
                       SET data = $3, status = $4, version = version + 1, updated_at = $5
                     WHERE id = $1 AND tenant_id = $2
                    RETURNING *
                    "#,
                    &[id, &tenant_id, &new_data, &new_status.as_str(), &now],
                )
                .await
                .map_err(db_err)?;
            let updated = map_content_item_row(&row)?;
            insert_audit_tx(
                tx,
                tenant_id,
                &AuditEntry {
                    action: AuditAction::Update,
                    entity_id: id.to_string(),
                    ..audit_template.clone()
                },
                now,
            )
            .await?;
            Ok(Some(updated))
        }
        BatchOp::Delete { id } => {
            let deleted = tx
                .execute(
                    "DELETE FROM content_items WHERE id = $1 AND tenant_id = $2",
                    &[id, &tenant_id],
                )
                .await
                .map_err(db_err)?;
            if deleted == 0 {
                return Err(StoreError::NotFound("content item"));
            }
            insert_audit_tx(
                tx,
                tenant_id,
                &AuditEntry {
                    action: AuditAction::Delete,
                    entity_id: id.to_string(),
                    ..audit_template.clone()
                },
                now,
            )
            .await?;
            Ok(None)
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_tenant(
        &self,
        name: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "INSERT INTO tenants (name, slug, created_at) VALUES ($1,$2,$3) RETURNING *",
                &[&name, &slug, &now],
            )
            .await
            .map_err(|error| {
                if is_sqlstate(&error, UNIQUE_VIOLATION) {
                    StoreError::SlugConflict
                } else {
                    db_err(error)
                }
            })?;
        Ok(map_tenant_row(&row))
    }

    async fn get_tenant(&self, id: i64) -> Result<Option<TenantRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM tenants WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_tenant_row))
    }

    async fn insert_api_key(&self, input: NewApiKey) -> Result<ApiKeyRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO api_keys (tenant_id, name, prefix, secret_hash, scopes, created_by, expires_at, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.name,
                    &input.prefix,
                    &input.secret_hash,
                    &input.scopes,
                    &input.created_by,
                    &input.expires_at,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(map_api_key_row(&row))
    }

    async fn find_api_key_by_hash(
        &self,
        secret_hash: &str,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM api_keys WHERE secret_hash = $1",
                &[&secret_hash],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_api_key_row))
    }

    async fn get_api_key(&self, tenant_id: i64, id: i64) -> Result<Option<ApiKeyRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM api_keys WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_api_key_row))
    }

    async fn list_api_keys(&self, tenant_id: i64) -> Result<Vec<ApiKeyRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY id",
                &[&tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(map_api_key_row).collect())
    }

    async fn rotate_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        new_prefix: &str,
        new_secret_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE api_keys SET prefix = $3, secret_hash = $4
                 WHERE id = $1 AND tenant_id = $2
                RETURNING *
                "#,
                &[&id, &tenant_id, &new_prefix, &new_secret_hash],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_api_key_row))
    }

    async fn revoke_api_key(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE api_keys SET revoked_at = COALESCE(revoked_at, $3)
                 WHERE id = $1 AND tenant_id = $2
                RETURNING *
                "#,
                &[&id, &tenant_id, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_api_key_row))
    }

    async fn touch_api_key(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "UPDATE api_keys SET last_used_at = $2 WHERE id = $1",
                &[&id, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_content_type(
        &self,
        input: NewContentType,
        audit: AuditEntry,
    ) -> Result<ContentTypeRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let row = tx
            .query_one(
                r#"
                INSERT INTO content_types (tenant_id, name, slug, schema_json, schema_version, base_price_sats, created_at, updated_at)
                VALUES ($1,$2,$3,$4,1,$5,$6,$6)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.name,
                    &input.slug,
                    &input.schema_json,
                    &input.base_price_sats,
                    &input.created_at,
                ],
            )
            .await
            .map_err(|error| {
                if is_sqlstate(&error, UNIQUE_VIOLATION) {
                    StoreError::SlugConflict
                } else {
                    db_err(error)
                }
            })?;
        let created = map_content_type_row(&row);
        insert_audit_tx(
            &tx,
            input.tenant_id,
            &AuditEntry {
                entity_id: created.id.to_string(),
                ..audit
            },
            input.created_at,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn get_content_type(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentTypeRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM content_types WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_content_type_row))
    }

    async fn list_content_types(&self, tenant_id: i64) -> Result<Vec<ContentTypeRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM content_types WHERE tenant_id = $1 ORDER BY id",
                &[&tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(map_content_type_row).collect())
    }

    async fn update_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        patch: ContentTypePatch,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentTypeRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let row = tx
            .query_opt(
                "SELECT * FROM content_types WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("content type"))?;
        let current = map_content_type_row(&row);

        let name = patch.name.unwrap_or_else(|| current.name.clone());
        let slug = patch.slug.unwrap_or_else(|| current.slug.clone());
        let schema_json = patch
            .schema_json
            .unwrap_or_else(|| current.schema_json.clone());
        let schema_version = if schema_json == current.schema_json {
            current.schema_version
        } else {
            current.schema_version + 1
        };
        let base_price_sats = patch.base_price_sats.unwrap_or(current.base_price_sats);

        let row = tx
            .query_one(
                r#"
                UPDATE content_types
                   SET name = $3, slug = $4, schema_json = $5, schema_version = $6,
                       base_price_sats = $7, updated_at = $8
                 WHERE id = $1 AND tenant_id = $2
                RETURNING *
                "#,
                &[
                    &id,
                    &tenant_id,
                    &name,
                    &slug,
                    &schema_json,
                    &schema_version,
                    &base_price_sats,
                    &now,
                ],
            )
            .await
            .map_err(|error| {
                if is_sqlstate(&error, UNIQUE_VIOLATION) {
                    StoreError::SlugConflict
                } else {
                    db_err(error)
                }
            })?;
        let updated = map_content_type_row(&row);
        insert_audit_tx(&tx, tenant_id, &audit, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(updated)
    }

    async fn delete_content_type(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let deleted = tx
            .execute(
                "DELETE FROM content_types WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(|error| {
                if is_sqlstate(&error, FOREIGN_KEY_VIOLATION) {
                    StoreError::TypeInUse
                } else {
                    db_err(error)
                }
            })?;
        if deleted == 0 {
            return Err(StoreError::NotFound("content type"));
        }
        insert_audit_tx(&tx, tenant_id, &audit, Utc::now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_content_item(
        &self,
        input: NewContentItem,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let op = BatchOp::Create {
            content_type_id: input.content_type_id,
            data: input.data,
            status: input.status,
        };
        let item = apply_item_op_tx(&tx, input.tenant_id, &op, &audit, input.created_at)
            .await?
            .ok_or_else(|| StoreError::Db("create produced no row".to_string()))?;
        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn get_content_item(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<ContentItemRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM content_items WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_content_item_row).transpose()
    }

    async fn list_content_items(
        &self,
        tenant_id: i64,
        filter: &ContentItemFilter,
    ) -> Result<Vec<ContentItemRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;

        let mut sql = String::from("SELECT * FROM content_items WHERE tenant_id = $1");
        let mut params: Vec<Box<dyn ToSql + Send + Sync>> = vec![Box::new(tenant_id)];
        if let Some(content_type_id) = filter.content_type_id {
            params.push(Box::new(content_type_id));
            sql.push_str(&format!(" AND content_type_id = ${}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ${}", params.len()));
        }
        if let Some(created_after) = filter.created_after {
            params.push(Box::new(created_after));
            sql.push_str(&format!(" AND created_at > ${}", params.len()));
        }
        if let Some(created_before) = filter.created_before {
            params.push(Box::new(created_before));
            sql.push_str(&format!(" AND created_at < ${}", params.len()));
        }
        if let Some(after_id) = filter.after_id {
            params.push(Box::new(after_id));
            sql.push_str(&format!(" AND id > ${}", params.len()));
        }
        sql.push_str(" ORDER BY id");
        params.push(Box::new(i64::from(filter.limit.max(1))));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
        if let Some(offset) = filter.offset {
            params.push(Box::new(offset as i64));
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = client.query(sql.as_str(), &param_refs).await.map_err(db_err)?;
        rows.iter().map(map_content_item_row).collect()
    }

    async fn update_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        change: ContentItemChange,
        audit: AuditEntry,
    ) -> Result<ContentItemRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let op = BatchOp::Update {
            id,
            data: change.data,
            status: change.status,
            expected_version: change.expected_version,
        };
        let item = apply_item_op_tx(&tx, tenant_id, &op, &audit, change.now)
            .await?
            .ok_or_else(|| StoreError::Db("update produced no row".to_string()))?;
        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn rollback_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        target_version: i64,
        audit: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<ContentItemRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        let row = tx
            .query_opt(
                "SELECT * FROM content_items WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("content item"))?;
        let current = map_content_item_row(&row)?;

        let target = tx
            .query_opt(
                "SELECT * FROM content_item_versions WHERE content_item_id = $1 AND version = $2",
                &[&id, &target_version],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TargetVersionMissing)?;
        let target = map_content_version_row(&target)?;

        snapshot_item_tx(&tx, &current, now).await?;

        let row = tx
            .query_one(
                r#"
                UPDATE content_items
                   SET data = $3, status = $4, version = version + 1, updated_at = $5
                 WHERE id = $1 AND tenant_id = $2
                RETURNING *
                "#,
                &[&id, &tenant_id, &target.data, &target.status.as_str(), &now],
            )
            .await
            .map_err(db_err)?;
        let restored = map_content_item_row(&row)?;
        insert_audit_tx(
            &tx,
            tenant_id,
            &AuditEntry {
                action: AuditAction::Rollback,
                ..audit
            },
            now,
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(restored)
    }

    async fn delete_content_item(
        &self,
        tenant_id: i64,
        id: i64,
        audit: AuditEntry,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let op = BatchOp::Delete { id };
        match apply_item_op_tx(&tx, tenant_id, &op, &audit, Utc::now()).await {
            Ok(_) => {
                tx.commit().await.map_err(db_err)?;
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn list_content_item_versions(
        &self,
        tenant_id: i64,
        item_id: i64,
    ) -> Result<Vec<ContentVersionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let owned = client
            .query_opt(
                "SELECT id FROM content_items WHERE id = $1 AND tenant_id = $2",
                &[&item_id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        if owned.is_none() {
            return Err(StoreError::NotFound("content item"));
        }
        let rows = client
            .query(
                "SELECT * FROM content_item_versions WHERE content_item_id = $1 ORDER BY version",
                &[&item_id],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(map_content_version_row).collect()
    }

    async fn apply_content_batch(
        &self,
        tenant_id: i64,
        ops: Vec<BatchOp>,
        atomic: bool,
        audit_template: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchItemOutcome>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let mut outcomes = Vec::with_capacity(ops.len());

        if atomic {
            let tx = client.transaction().await.map_err(db_err)?;
            let mut failed = false;
            for (index, op) in ops.iter().enumerate() {
                let result = apply_item_op_tx(&tx, tenant_id, op, &audit_template, now).await;
                failed = result.is_err();
                outcomes.push(BatchItemOutcome { index, result });
                if failed {
                    break;
                }
            }
            if failed {
                tx.rollback().await.map_err(db_err)?;
            } else {
                tx.commit().await.map_err(db_err)?;
            }
            return Ok(outcomes);
        }

        for (index, op) in ops.iter().enumerate() {
            let tx = client.transaction().await.map_err(db_err)?;
            let result = apply_item_op_tx(&tx, tenant_id, op, &audit_template, now).await;
            if result.is_ok() {
                tx.commit().await.map_err(db_err)?;
            } else {
                tx.rollback().await.map_err(db_err)?;
            }
            outcomes.push(BatchItemOutcome { index, result });
        }
        Ok(outcomes)
    }

    async fn append_audit(
        &self,
        tenant_id: i64,
        entry: AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<AuditLogRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO audit_logs (tenant_id, action, entity_type, entity_id, details, actor_id, request_id, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                RETURNING *
                "#,
                &[
                    &tenant_id,
                    &entry.action.as_str(),
                    &entry.entity_type,
                    &entry.entity_id,
                    &entry.details,
                    &entry.actor_id,
                    &entry.request_id,
                    &now,
                ],
            )
            .await
            .map_err(db_err)?;
        map_audit_row(&row)
    }

    async fn list_audit_logs(
        &self,
        tenant_id: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;

        let mut sql = String::from("SELECT * FROM audit_logs WHERE tenant_id = $1");
        let mut params: Vec<Box<dyn ToSql + Send + Sync>> = vec![Box::new(tenant_id)];
        if let Some(action) = filter.action {
            params.push(Box::new(action.as_str()));
            sql.push_str(&format!(" AND action = ${}", params.len()));
        }
        if let Some(entity_type) = &filter.entity_type {
            params.push(Box::new(entity_type.clone()));
            sql.push_str(&format!(" AND entity_type = ${}", params.len()));
        }
        if let Some(before_id) = filter.before_id {
            params.push(Box::new(before_id));
            sql.push_str(&format!(" AND id < ${}", params.len()));
        }
        sql.push_str(" ORDER BY id DESC");
        params.push(Box::new(i64::from(filter.limit.max(1))));
        sql.push_str(&format!(" LIMIT ${}", params.len()));

        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = client.query(sql.as_str(), &param_refs).await.map_err(db_err)?;
        rows.iter().map(map_audit_row).collect()
    }

    async fn insert_webhook(&self, input: NewWebhook) -> Result<WebhookRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO webhooks (tenant_id, url, event_patterns, secret, active, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$6)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.url,
                    &input.event_patterns,
                    &input.secret,
                    &input.active,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(map_webhook_row(&row))
    }

    async fn get_webhook(&self, tenant_id: i64, id: i64) -> Result<Option<WebhookRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM webhooks WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(map_webhook_row))
    }

    async fn list_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM webhooks WHERE tenant_id = $1 ORDER BY id",
                &[&tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(map_webhook_row).collect())
    }

    async fn update_webhook(
        &self,
        tenant_id: i64,
        id: i64,
        patch: WebhookPatch,
        now: DateTime<Utc>,
    ) -> Result<WebhookRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let row = tx
            .query_opt(
                "SELECT * FROM webhooks WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("webhook"))?;
        let current = map_webhook_row(&row);

        let url = patch.url.unwrap_or_else(|| current.url.clone());
        let event_patterns = patch
            .event_patterns
            .unwrap_or_else(|| current.event_patterns.clone());
        let secret = patch.secret.unwrap_or_else(|| current.secret.clone());
        let active = patch.active.unwrap_or(current.active);

        let row = tx
            .query_one(
                r#"
                UPDATE webhooks
                   SET url = $3, event_patterns = $4, secret = $5, active = $6, updated_at = $7
                 WHERE id = $1 AND tenant_id = $2
                RETURNING *
                "#,
                &[&id, &tenant_id, &url, &event_patterns, &secret, &active, &now],
            )
            .await
            .map_err(db_err)?;
        let updated = map_webhook_row(&row);
        tx.commit().await.map_err(db_err)?;
        Ok(updated)
    }

    async fn delete_webhook(&self, tenant_id: i64, id: i64) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let deleted = client
            .execute(
                "DELETE FROM webhooks WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    async fn list_active_webhooks(&self, tenant_id: i64) -> Result<Vec<WebhookRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM webhooks WHERE tenant_id = $1 AND active ORDER BY id",
                &[&tenant_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(map_webhook_row).collect())
    }

    async fn enqueue_webhook_delivery(
        &self,
        input: NewWebhookDelivery,
    ) -> Result<WebhookDeliveryRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO webhook_deliveries
                    (tenant_id, webhook_id, event_kind, payload, status, attempts, next_attempt_at, created_at, updated_at)
                VALUES ($1,$2,$3,$4,'pending',0,$5,$6,$6)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.webhook_id,
                    &input.event_kind,
                    &input.payload,
                    &input.next_attempt_at,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        map_delivery_row(&row)
    }

    async fn due_webhook_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDeliveryRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT * FROM webhook_deliveries
                 WHERE status = 'pending' AND next_attempt_at <= $1
                 ORDER BY id
                 LIMIT $2
                "#,
                &[&now, &i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(map_delivery_row).collect()
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
        let client = self.db.client();
        let client = client.lock().await;
        let delivered_at = if status == DeliveryStatus::Delivered {
            Some(now)
        } else {
            None
        };
        let updated = client
            .execute(
                r#"
                UPDATE webhook_deliveries
                   SET status = $2, attempts = $3, last_error = $4,
                       next_attempt_at = COALESCE($5, next_attempt_at),
                       delivered_at = COALESCE($6, delivered_at),
                       updated_at = $7
                 WHERE id = $1
                "#,
                &[
                    &id,
                    &status.as_str(),
                    &attempts,
                    &last_error,
                    &next_attempt_at,
                    &delivered_at,
                    &now,
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound("webhook delivery"));
        }
        Ok(())
    }

    async fn insert_payment(&self, input: NewPayment) -> Result<PaymentRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO payments
                    (tenant_id, payment_hash, provider, provider_invoice_id, payment_request,
                     amount_sats, status, expires_at, resource_path, actor_id, details, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,'pending',$7,$8,$9,$10,$11,$11)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.payment_hash,
                    &input.provider,
                    &input.provider_invoice_id,
                    &input.payment_request,
                    &input.amount_sats,
                    &input.expires_at,
                    &input.resource_path,
                    &input.actor_id,
                    &input.details,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        map_payment_row(&row)
    }

    async fn get_payment(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<PaymentRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM payments WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_payment_row).transpose()
    }

    async fn get_payment_by_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<PaymentRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM payments WHERE payment_hash = $1",
                &[&payment_hash],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_payment_row).transpose()
    }

    async fn list_payments(
        &self,
        tenant_id: i64,
        status: Option<PaymentState>,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;

        let mut sql = String::from("SELECT * FROM payments WHERE tenant_id = $1");
        let mut params: Vec<Box<dyn ToSql + Send + Sync>> = vec![Box::new(tenant_id)];
        if let Some(status) = status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ${}", params.len()));
        }
        if let Some(before_id) = before_id {
            params.push(Box::new(before_id));
            sql.push_str(&format!(" AND id < ${}", params.len()));
        }
        sql.push_str(" ORDER BY id DESC");
        params.push(Box::new(i64::from(limit.max(1))));
        sql.push_str(&format!(" LIMIT ${}", params.len()));

        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = client.query(sql.as_str(), &param_refs).await.map_err(db_err)?;
        rows.iter().map(map_payment_row).collect()
    }

    async fn transition_payment(
        &self,
        payment_hash: &str,
        to: PaymentState,
        update: PaymentTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        let row = tx
            .query_opt(
                "SELECT * FROM payments WHERE payment_hash = $1 FOR UPDATE",
                &[&payment_hash],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("payment"))?;
        let current = map_payment_row(&row)?;

        if current.status == to {
            tx.commit().await.map_err(db_err)?;
            return Ok(TransitionOutcome::AlreadyInState(current));
        }
        if !PaymentState::allowed_from(to).contains(&current.status) {
            tx.commit().await.map_err(db_err)?;
            return Ok(TransitionOutcome::Rejected {
                from: current.status,
            });
        }

        let settled_at = if to == PaymentState::Paid {
            Some(update.settled_at.unwrap_or(now))
        } else {
            current.settled_at
        };
        let row = tx
            .query_one(
                r#"
                UPDATE payments
                   SET status = $2, settled_at = $3,
                       failure_reason = COALESCE($4, failure_reason),
                       last_event_id = COALESCE($5, last_event_id),
                       updated_at = $6
                 WHERE payment_hash = $1
                RETURNING *
                "#,
                &[
                    &payment_hash,
                    &to.as_str(),
                    &settled_at,
                    &update.failure_reason,
                    &update.event_id,
                    &now,
                ],
            )
            .await
            .map_err(db_err)?;
        let applied = map_payment_row(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(TransitionOutcome::Applied(applied))
    }

    async fn record_payment_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        payment_hash: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO payment_webhook_events (provider, event_id, payment_hash, status, received_at)
                VALUES ($1,$2,$3,$4,$5)
                ON CONFLICT (payment_hash, event_id) DO NOTHING
                "#,
                &[&provider, &event_id, &payment_hash, &status, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn list_stale_pending_payments(
        &self,
        provider: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT * FROM payments
                 WHERE status = 'pending' AND provider = $1 AND created_at < $2
                 ORDER BY id
                 LIMIT $3
                "#,
                &[&provider, &older_than, &i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(map_payment_row).collect()
    }

    async fn count_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM payments WHERE status = 'pending' AND created_at < $1",
                &[&older_than],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get("n"))
    }

    async fn insert_entitlement(
        &self,
        input: NewEntitlement,
    ) -> Result<EntitlementRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                INSERT INTO entitlements
                    (tenant_id, offer_kind, offer_id, policy_id, policy_version, agent_profile_id,
                     payment_hash, status, remaining_reads, expires_at, delegated_from, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$12)
                RETURNING *
                "#,
                &[
                    &input.tenant_id,
                    &input.offer_kind.as_str(),
                    &input.offer_id,
                    &input.policy_id,
                    &input.policy_version,
                    &input.agent_profile_id,
                    &input.payment_hash,
                    &input.status.as_str(),
                    &input.remaining_reads,
                    &input.expires_at,
                    &input.delegated_from,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        map_entitlement_row(&row)
    }

    async fn get_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM entitlements WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_entitlement_row).transpose()
    }

    async fn get_entitlement_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM entitlements WHERE payment_hash = $1",
                &[&payment_hash],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_entitlement_row).transpose()
    }

    async fn list_entitlements(
        &self,
        tenant_id: i64,
        agent_profile_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = match agent_profile_id {
            Some(agent) => {
                client
                    .query(
                        r#"
                        SELECT * FROM entitlements
                         WHERE tenant_id = $1 AND agent_profile_id = $2
                         ORDER BY id DESC LIMIT $3
                        "#,
                        &[&tenant_id, &agent, &i64::from(limit.max(1))],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT * FROM entitlements WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2",
                        &[&tenant_id, &i64::from(limit.max(1))],
                    )
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(map_entitlement_row).collect()
    }

    async fn activate_entitlement(
        &self,
        payment_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        // Conditional update keeps activation idempotent across the retry,
        // webhook, and reconciliation observation paths.
        client
            .execute(
                r#"
                UPDATE entitlements
                   SET status = 'active', activated_at = $2, updated_at = $2
                 WHERE payment_hash = $1 AND status = 'pending_payment'
                "#,
                &[&payment_hash, &now],
            )
            .await
            .map_err(db_err)?;
        let row = client
            .query_opt(
                "SELECT * FROM entitlements WHERE payment_hash = $1",
                &[&payment_hash],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_entitlement_row).transpose()
    }

    async fn find_active_entitlement(
        &self,
        tenant_id: i64,
        offer_kind: OfferKind,
        offer_id: i64,
        agent_profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT * FROM entitlements
                 WHERE tenant_id = $1 AND offer_kind = $2 AND offer_id = $3
                   AND agent_profile_id = $4 AND status = 'active'
                   AND (expires_at IS NULL OR expires_at > $5)
                 ORDER BY id
                 LIMIT 1
                "#,
                &[
                    &tenant_id,
                    &offer_kind.as_str(),
                    &offer_id,
                    &agent_profile_id,
                    &now,
                ],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_entitlement_row).transpose()
    }

    async fn consume_entitlement(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        // Single conditional decrement so parallel reads cannot overshoot.
        let row = tx
            .query_opt(
                r#"
                UPDATE entitlements
                   SET remaining_reads = remaining_reads - 1, updated_at = $2
                 WHERE id = $1 AND status = 'active' AND remaining_reads > 0
                RETURNING remaining_reads
                "#,
                &[&id, &now],
            )
            .await
            .map_err(db_err)?;

        if let Some(row) = row {
            let remaining: i64 = row.get("remaining_reads");
            if remaining == 0 {
                tx.execute(
                    r#"
                    UPDATE entitlements
                       SET status = 'exhausted', terminated_at = $2, updated_at = $2
                     WHERE id = $1
                    "#,
                    &[&id, &now],
                )
                .await
                .map_err(db_err)?;
                tx.commit().await.map_err(db_err)?;
                return Ok(ConsumeOutcome::ConsumedAndExhausted);
            }
            tx.commit().await.map_err(db_err)?;
            return Ok(ConsumeOutcome::Consumed {
                remaining: Some(remaining),
            });
        }

        // Unlimited grants have NULL remaining_reads.
        let touched = tx
            .execute(
                r#"
                UPDATE entitlements SET updated_at = $2
                 WHERE id = $1 AND status = 'active' AND remaining_reads IS NULL
                "#,
                &[&id, &now],
            )
            .await
            .map_err(db_err)?;
        if touched > 0 {
            tx.commit().await.map_err(db_err)?;
            return Ok(ConsumeOutcome::Consumed { remaining: None });
        }

        let status_row = tx
            .query_opt("SELECT status FROM entitlements WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("entitlement"))?;
        let status: String = status_row.get("status");
        tx.commit().await.map_err(db_err)?;
        Ok(ConsumeOutcome::NotActive {
            status: EntitlementState::parse(&status)
                .ok_or_else(|| StoreError::Db(format!("unknown entitlement status '{status}'")))?,
        })
    }

    async fn expire_entitlements(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                UPDATE entitlements
                   SET status = 'expired', terminated_at = $1, updated_at = $1
                 WHERE id IN (
                     SELECT id FROM entitlements
                      WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1
                      ORDER BY id
                      LIMIT $2
                 )
                RETURNING *
                "#,
                &[&now, &i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(map_entitlement_row).collect()
    }

    async fn revoke_entitlement(
        &self,
        tenant_id: i64,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<EntitlementRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                UPDATE entitlements
                   SET status = 'revoked', terminated_at = $3, updated_at = $3
                 WHERE id = $1 AND tenant_id = $2
                   AND status IN ('pending_payment', 'active')
                "#,
                &[&id, &tenant_id, &now],
            )
            .await
            .map_err(db_err)?;
        let row = client
            .query_opt(
                "SELECT * FROM entitlements WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_entitlement_row).transpose()
    }

    async fn reduce_entitlement_quota(
        &self,
        id: i64,
        reads: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let unlimited = client
            .query_opt(
                "SELECT 1 AS one FROM entitlements WHERE id = $1 AND remaining_reads IS NULL",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        if unlimited.is_some() {
            return Ok(true);
        }
        let updated = client
            .execute(
                r#"
                UPDATE entitlements
                   SET remaining_reads = remaining_reads - $2,
                       status = CASE WHEN remaining_reads = $2 THEN 'exhausted' ELSE status END,
                       terminated_at = CASE WHEN remaining_reads = $2 THEN $3 ELSE terminated_at END,
                       updated_at = $3
                 WHERE id = $1 AND remaining_reads >= $2
                "#,
                &[&id, &reads, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    async fn insert_revenue_event(
        &self,
        event: NewRevenueEvent,
        allocations: Vec<NewAllocation>,
    ) -> Result<Option<RevenueEventRow>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        let row = tx
            .query_opt(
                r#"
                INSERT INTO revenue_events
                    (tenant_id, payment_hash, gross_sats, policy_id, policy_version, settled_at, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7)
                ON CONFLICT (payment_hash) DO NOTHING
                RETURNING *
                "#,
                &[
                    &event.tenant_id,
                    &event.payment_hash,
                    &event.gross_sats,
                    &event.policy_id,
                    &event.policy_version,
                    &event.settled_at,
                    &event.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let created = map_revenue_event_row(&row);

        for allocation in allocations {
            tx.execute(
                r#"
                INSERT INTO revenue_allocations
                    (tenant_id, revenue_event_id, agent_profile_id, amount_sats, status, created_at, updated_at)
                VALUES ($1,$2,$3,$4,'pending',$5,$5)
                "#,
                &[
                    &event.tenant_id,
                    &created.id,
                    &allocation.agent_profile_id,
                    &allocation.amount_sats,
                    &event.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Some(created))
    }

    async fn list_allocations(
        &self,
        tenant_id: i64,
        payment_hash: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AllocationRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = match payment_hash {
            Some(hash) => {
                client
                    .query(
                        r#"
                        SELECT a.* FROM revenue_allocations a
                          JOIN revenue_events e ON e.id = a.revenue_event_id
                         WHERE a.tenant_id = $1 AND e.payment_hash = $2
                         ORDER BY a.id LIMIT $3
                        "#,
                        &[&tenant_id, &hash, &i64::from(limit.max(1))],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT * FROM revenue_allocations WHERE tenant_id = $1 ORDER BY id LIMIT $2",
                        &[&tenant_id, &i64::from(limit.max(1))],
                    )
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(map_allocation_row).collect()
    }

    async fn clear_allocations_settled_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let cleared = client
            .execute(
                r#"
                UPDATE revenue_allocations a
                   SET status = 'cleared', cleared_at = $2, updated_at = $2
                  FROM revenue_events e
                 WHERE e.id = a.revenue_event_id
                   AND a.status = 'pending'
                   AND e.settled_at <= $1
                "#,
                &[&cutoff, &now],
            )
            .await
            .map_err(db_err)?;
        Ok(cleared)
    }

    async fn cleared_balances(&self, min_balance: i64) -> Result<Vec<PartyBalance>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT c.tenant_id, c.agent_profile_id,
                       c.cleared_sats - COALESCE(t.held_sats, 0) AS balance_sats
                  FROM (
                       SELECT tenant_id, agent_profile_id, SUM(amount_sats) AS cleared_sats
                         FROM revenue_allocations
                        WHERE status = 'cleared'
                        GROUP BY tenant_id, agent_profile_id
                  ) c
                  LEFT JOIN (
                       SELECT tenant_id, agent_profile_id, SUM(amount_sats) AS held_sats
                         FROM payout_transfers
                        WHERE status <> 'failed_permanent'
                        GROUP BY tenant_id, agent_profile_id
                  ) t USING (tenant_id, agent_profile_id)
                 WHERE c.cleared_sats - COALESCE(t.held_sats, 0) >= $1
                 ORDER BY c.tenant_id, c.agent_profile_id
                "#,
                &[&min_balance],
            )
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| PartyBalance {
                tenant_id: row.get("tenant_id"),
                agent_profile_id: row.get("agent_profile_id"),
                balance_sats: row.get("balance_sats"),
            })
            .collect())
    }

    async fn create_payout_batch(
        &self,
        tenant_id: i64,
        transfers: Vec<NewTransfer>,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        let total_sats: i64 = transfers.iter().map(|t| t.amount_sats).sum();
        let row = tx
            .query_one(
                r#"
                INSERT INTO payout_batches (tenant_id, status, total_sats, created_at, updated_at)
                VALUES ($1,'pending',$2,$3,$3)
                RETURNING *
                "#,
                &[&tenant_id, &total_sats, &now],
            )
            .await
            .map_err(db_err)?;
        let batch = map_batch_row(&row);
        for transfer in transfers {
            tx.execute(
                r#"
                INSERT INTO payout_transfers
                    (tenant_id, batch_id, agent_profile_id, amount_sats, status, attempts, created_at, updated_at)
                VALUES ($1,$2,$3,$4,'pending',0,$5,$5)
                "#,
                &[
                    &tenant_id,
                    &batch.id,
                    &transfer.agent_profile_id,
                    &transfer.amount_sats,
                    &now,
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(batch)
    }

    async fn due_payout_transfers(
        &self,
        limit: u32,
    ) -> Result<Vec<PayoutTransferRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT * FROM payout_transfers
                 WHERE status IN ('pending', 'failed_transient')
                 ORDER BY id
                 LIMIT $1
                "#,
                &[&i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(map_transfer_row).collect()
    }

    async fn update_payout_transfer(
        &self,
        id: i64,
        status: TransferState,
        attempts: i32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE payout_transfers
                   SET status = $2, attempts = $3, last_error = $4, updated_at = $5
                 WHERE id = $1
                "#,
                &[&id, &status.as_str(), &attempts, &last_error, &now],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound("payout transfer"));
        }
        Ok(())
    }

    async fn refresh_payout_batch_status(
        &self,
        batch_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PayoutBatchRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT status FROM payout_transfers WHERE batch_id = $1",
                &[&batch_id],
            )
            .await
            .map_err(db_err)?;
        let statuses: Vec<TransferState> = rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                TransferState::parse(&status)
                    .ok_or_else(|| StoreError::Db(format!("unknown transfer status '{status}'")))
            })
            .collect::<Result<_, _>>()?;
        let aggregate = aggregate_batch_status(&statuses);
        let row = client
            .query_opt(
                r#"
                UPDATE payout_batches SET status = $2, updated_at = $3
                 WHERE id = $1
                RETURNING *
                "#,
                &[&batch_id, &aggregate, &now],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound("payout batch"))?;
        Ok(map_batch_row(&row))
    }

    async fn list_payout_batches(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<(PayoutBatchRow, Vec<PayoutTransferRow>)>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM payout_batches WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2",
                &[&tenant_id, &i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let batch = map_batch_row(row);
            let transfer_rows = client
                .query(
                    "SELECT * FROM payout_transfers WHERE batch_id = $1 ORDER BY id",
                    &[&batch.id],
                )
                .await
                .map_err(db_err)?;
            let transfers: Vec<PayoutTransferRow> = transfer_rows
                .iter()
                .map(map_transfer_row)
                .collect::<Result<_, _>>()?;
            result.push((batch, transfers));
        }
        Ok(result)
    }

    async fn append_policy_decision(
        &self,
        input: NewPolicyDecision,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO policy_decisions
                    (tenant_id, actor_id, operation, resource, decision, reason, request_id, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                "#,
                &[
                    &input.tenant_id,
                    &input.actor_id,
                    &input.operation,
                    &input.resource,
                    &input.decision,
                    &input.reason,
                    &input.request_id,
                    &input.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_policy_decisions(
        &self,
        tenant_id: i64,
        limit: u32,
    ) -> Result<Vec<PolicyDecisionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM policy_decisions WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2",
                &[&tenant_id, &i64::from(limit.max(1))],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(map_decision_row).collect())
    }
}
