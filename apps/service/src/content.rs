//! Content lifecycle engine: schema-validated items with immutable version
//! history, rollback, batching, and dry-run. Every accepted mutation writes
//! its audit record in the same transaction and publishes one event after
//! commit; dry-runs validate and authorize identically but commit nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::auth::Principal;
use crate::context::OpContext;
use crate::events::{Event, EventBus};
use crate::schema::{SchemaCache, SchemaParseError, SchemaViolation};
use crate::store::{
    AuditAction, AuditEntry, BatchItemOutcome, BatchOp, ContentItemChange, ContentItemFilter,
    ContentItemRow, ContentStatus, ContentTypePatch, ContentTypeRow, ContentVersionRow,
    NewContentItem, NewContentType, Store, StoreError,
};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;
pub const DRY_RUN_ID: i64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("schema does not parse as JSON: {0}")]
    InvalidSchemaJson(String),
    #[error("data failed schema validation")]
    SchemaValidationFailed(Vec<SchemaViolation>),
    #[error("content type not found")]
    TypeNotFound,
    #[error("content item not found")]
    ItemNotFound,
    #[error("target version not found")]
    TargetVersionNotFound,
    #[error("slug already in use")]
    SlugConflict,
    #[error("version conflict: head is {head}")]
    VersionConflict { head: i64 },
    #[error("update body is empty")]
    EmptyUpdateBody,
    #[error("unknown status '{0}'")]
    InvalidStatus(String),
    #[error("content type is still referenced by items")]
    TypeInUse,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ContentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound("content type") => Self::TypeNotFound,
            StoreError::NotFound("content item") => Self::ItemNotFound,
            StoreError::SlugConflict => Self::SlugConflict,
            StoreError::VersionConflict { head } => Self::VersionConflict { head },
            StoreError::TargetVersionMissing => Self::TargetVersionNotFound,
            StoreError::TypeInUse => Self::TypeInUse,
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTypeInput {
    pub name: String,
    pub slug: Option<String>,
    pub schema: Value,
    pub base_price_sats: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTypeInput {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub schema: Option<Value>,
    pub base_price_sats: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateItemInput {
    pub content_type_id: i64,
    pub data: Value,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateItemInput {
    pub data: Option<Value>,
    pub status: Option<String>,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum BatchOperationInput {
    Create(CreateItemInput),
    Update { id: i64, patch: UpdateItemInput },
    Delete { id: i64 },
}

#[derive(Debug)]
pub struct BatchResultEntry {
    pub index: usize,
    pub result: Result<Option<ContentItemRow>, ContentError>,
}

#[derive(Clone)]
pub struct ContentService {
    store: Arc<dyn Store>,
    schemas: SchemaCache,
    bus: EventBus,
}

impl ContentService {
    pub fn new(store: Arc<dyn Store>, schemas: SchemaCache, bus: EventBus) -> Self {
        Self {
            store,
            schemas,
            bus,
        }
    }

    pub async fn create_type(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        input: CreateTypeInput,
    ) -> Result<ContentTypeRow, ContentError> {
        let schema_json = schema_to_text(&input.schema)?;
        // Compile up front so a bad schema is rejected before any write.
        crate::schema::CompiledSchema::compile(&schema_json)
            .map_err(schema_parse_to_content_error)?;

        let now = Utc::now();
        let slug = match input.slug {
            Some(slug) if !slug.trim().is_empty() => slug.trim().to_string(),
            _ => slugify(&input.name),
        };
        let base_price_sats = input.base_price_sats.unwrap_or(0).max(0);

        if ctx.dry_run {
            return Ok(ContentTypeRow {
                id: DRY_RUN_ID,
                tenant_id: principal.tenant_id,
                name: input.name,
                slug,
                schema_json,
                schema_version: 1,
                base_price_sats,
                created_at: now,
                updated_at: now,
            });
        }

        let row = self
            .store
            .insert_content_type(
                NewContentType {
                    tenant_id: principal.tenant_id,
                    name: input.name,
                    slug,
                    schema_json,
                    base_price_sats,
                    created_at: now,
                },
                self.audit(principal, ctx, AuditAction::Create, "content_type", ""),
            )
            .await?;
        self.publish(principal, ctx, "content_type.create", "content_type", &row.id, json!({"id": row.id, "slug": row.slug}));
        Ok(row)
    }

    pub async fn update_type(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
        input: UpdateTypeInput,
    ) -> Result<ContentTypeRow, ContentError> {
        let schema_json = match &input.schema {
            Some(schema) => {
                let text = schema_to_text(schema)?;
                crate::schema::CompiledSchema::compile(&text)
                    .map_err(schema_parse_to_content_error)?;
                Some(text)
            }
            None => None,
        };
        if input.name.is_none()
            && input.slug.is_none()
            && schema_json.is_none()
            && input.base_price_sats.is_none()
        {
            return Err(ContentError::EmptyUpdateBody);
        }

        if ctx.dry_run {
            return self
                .store
                .get_content_type(principal.tenant_id, id)
                .await?
                .ok_or(ContentError::TypeNotFound);
        }

        let row = self
            .store
            .update_content_type(
                principal.tenant_id,
                id,
                ContentTypePatch {
                    name: input.name,
                    slug: input.slug,
                    schema_json,
                    base_price_sats: input.base_price_sats.map(|price| price.max(0)),
                },
                self.audit(principal, ctx, AuditAction::Update, "content_type", &id.to_string()),
                Utc::now(),
            )
            .await?;
        self.publish(principal, ctx, "content_type.update", "content_type", &row.id, json!({"id": row.id}));
        Ok(row)
    }

    pub async fn get_type(
        &self,
        principal: &Principal,
        id: i64,
    ) -> Result<ContentTypeRow, ContentError> {
        self.store
            .get_content_type(principal.tenant_id, id)
            .await?
            .ok_or(ContentError::TypeNotFound)
    }

    pub async fn list_types(
        &self,
        principal: &Principal,
    ) -> Result<Vec<ContentTypeRow>, ContentError> {
        Ok(self.store.list_content_types(principal.tenant_id).await?)
    }

    pub async fn delete_type(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
    ) -> Result<(), ContentError> {
        if ctx.dry_run {
            self.get_type(principal, id).await?;
            return Ok(());
        }
        self.store
            .delete_content_type(
                principal.tenant_id,
                id,
                self.audit(principal, ctx, AuditAction::Delete, "content_type", &id.to_string()),
            )
            .await?;
        self.publish(principal, ctx, "content_type.delete", "content_type", &id, json!({"id": id}));
        Ok(())
    }

    pub async fn create_item(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        input: CreateItemInput,
    ) -> Result<ContentItemRow, ContentError> {
        let status = parse_status(input.status.as_deref())?.unwrap_or(ContentStatus::Draft);
        let kind = self
            .store
            .get_content_type(principal.tenant_id, input.content_type_id)
            .await?
            .ok_or(ContentError::TypeNotFound)?;
        self.validate_against(&kind, &input.data).await?;

        let now = Utc::now();
        if ctx.dry_run {
            return Ok(ContentItemRow {
                id: DRY_RUN_ID,
                tenant_id: principal.tenant_id,
                content_type_id: kind.id,
                data: input.data,
                status,
                version: 1,
                created_at: now,
                updated_at: now,
            });
        }

        let row = self
            .store
            .insert_content_item(
                NewContentItem {
                    tenant_id: principal.tenant_id,
                    content_type_id: kind.id,
                    data: input.data,
                    status,
                    created_at: now,
                },
                self.audit(principal, ctx, AuditAction::Create, "content_item", ""),
            )
            .await?;
        self.publish(
            principal,
            ctx,
            "content_item.create",
            "content_item",
            &row.id,
            json!({"id": row.id, "contentTypeId": row.content_type_id, "version": row.version}),
        );
        Ok(row)
    }

    pub async fn get_item(
        &self,
        principal: &Principal,
        id: i64,
    ) -> Result<ContentItemRow, ContentError> {
        self.store
            .get_content_item(principal.tenant_id, id)
            .await?
            .ok_or(ContentError::ItemNotFound)
    }

    pub async fn list_items(
        &self,
        principal: &Principal,
        mut filter: ContentItemFilter,
    ) -> Result<Vec<ContentItemRow>, ContentError> {
        if filter.limit == 0 {
            filter.limit = DEFAULT_LIST_LIMIT;
        }
        filter.limit = filter.limit.min(MAX_LIST_LIMIT);
        Ok(self
            .store
            .list_content_items(principal.tenant_id, &filter)
            .await?)
    }

    /// Lazy re-validation: the item's data is checked against the type's
    /// *current* schema on this write, not eagerly when the schema changed.
    pub async fn update_item(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
        input: UpdateItemInput,
    ) -> Result<ContentItemRow, ContentError> {
        if input.data.is_none() && input.status.is_none() {
            return Err(ContentError::EmptyUpdateBody);
        }
        let status = parse_status(input.status.as_deref())?;
        let current = self.get_item(principal, id).await?;
        let kind = self
            .store
            .get_content_type(principal.tenant_id, current.content_type_id)
            .await?
            .ok_or(ContentError::TypeNotFound)?;

        let effective_data = input.data.clone().unwrap_or_else(|| current.data.clone());
        self.validate_against(&kind, &effective_data).await?;

        if ctx.dry_run {
            let mut preview = current;
            preview.data = effective_data;
            if let Some(status) = status {
                preview.status = status;
            }
            preview.version += 1;
            return Ok(preview);
        }

        let row = self
            .store
            .update_content_item(
                principal.tenant_id,
                id,
                ContentItemChange {
                    data: input.data,
                    status,
                    expected_version: input.expected_version,
                    now: Utc::now(),
                },
                self.audit(principal, ctx, AuditAction::Update, "content_item", &id.to_string()),
            )
            .await?;
        self.publish(
            principal,
            ctx,
            "content_item.update",
            "content_item",
            &row.id,
            json!({"id": row.id, "version": row.version}),
        );
        Ok(row)
    }

    pub async fn rollback_item(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
        target_version: i64,
    ) -> Result<ContentItemRow, ContentError> {
        if ctx.dry_run {
            let versions = self.list_versions(principal, id).await?;
            let target = versions
                .into_iter()
                .find(|version| version.version == target_version)
                .ok_or(ContentError::TargetVersionNotFound)?;
            let mut preview = self.get_item(principal, id).await?;
            preview.data = target.data;
            preview.status = target.status;
            preview.version += 1;
            return Ok(preview);
        }

        let row = self
            .store
            .rollback_content_item(
                principal.tenant_id,
                id,
                target_version,
                self.audit(principal, ctx, AuditAction::Rollback, "content_item", &id.to_string()),
                Utc::now(),
            )
            .await?;
        self.publish(
            principal,
            ctx,
            "content_item.rollback",
            "content_item",
            &row.id,
            json!({"id": row.id, "version": row.version, "rolledBackTo": target_version}),
        );
        Ok(row)
    }

    pub async fn delete_item(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        id: i64,
    ) -> Result<(), ContentError> {
        if ctx.dry_run {
            self.get_item(principal, id).await?;
            return Ok(());
        }
        let deleted = self
            .store
            .delete_content_item(
                principal.tenant_id,
                id,
                self.audit(principal, ctx, AuditAction::Delete, "content_item", &id.to_string()),
            )
            .await?;
        if !deleted {
            return Err(ContentError::ItemNotFound);
        }
        self.publish(principal, ctx, "content_item.delete", "content_item", &id, json!({"id": id}));
        Ok(())
    }

    pub async fn list_versions(
        &self,
        principal: &Principal,
        item_id: i64,
    ) -> Result<Vec<ContentVersionRow>, ContentError> {
        Ok(self
            .store
            .list_content_item_versions(principal.tenant_id, item_id)
            .await?)
    }

    /// Batch create/update/delete. Validation runs first for every op; in
    /// atomic mode any failure (validation or store) leaves nothing written.
    pub async fn batch(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        operations: Vec<BatchOperationInput>,
        atomic: bool,
    ) -> Result<Vec<BatchResultEntry>, ContentError> {
        let mut prepared: Vec<(usize, Result<BatchOp, ContentError>)> =
            Vec::with_capacity(operations.len());

        for (index, operation) in operations.into_iter().enumerate() {
            let checked = match self.prepare_batch_op(principal, operation).await {
                Ok(op) => Ok(op),
                Err(error) if atomic => return Err(error),
                Err(error) => Err(error),
            };
            prepared.push((index, checked));
        }

        if ctx.dry_run {
            return Ok(prepared
                .into_iter()
                .map(|(index, checked)| BatchResultEntry {
                    index,
                    result: checked.map(|_| None),
                })
                .collect());
        }

        let mut results: Vec<BatchResultEntry> = Vec::with_capacity(prepared.len());
        let mut store_ops = Vec::new();
        let mut store_indices = Vec::new();
        for (index, checked) in prepared {
            match checked {
                Ok(op) => {
                    store_indices.push(index);
                    store_ops.push(op);
                }
                Err(error) => results.push(BatchResultEntry {
                    index,
                    result: Err(error),
                }),
            }
        }

        let op_kinds: Vec<&'static str> = store_ops
            .iter()
            .map(|op| match op {
                BatchOp::Create { .. } => "content_item.create",
                BatchOp::Update { .. } => "content_item.update",
                BatchOp::Delete { .. } => "content_item.delete",
            })
            .collect();
        let outcomes = self
            .store
            .apply_content_batch(
                principal.tenant_id,
                store_ops,
                atomic,
                self.audit(principal, ctx, AuditAction::Update, "content_item", ""),
                Utc::now(),
            )
            .await?;
        if atomic && outcomes.iter().any(|outcome| outcome.result.is_err()) {
            // Nothing was committed; surface the first store failure.
            let failed = outcomes
                .into_iter()
                .find_map(|outcome| outcome.result.err())
                .unwrap_or(StoreError::Db("atomic batch failed".to_string()));
            return Err(ContentError::from(failed));
        }

        for BatchItemOutcome { index, result } in outcomes {
            let original_index = store_indices.get(index).copied().unwrap_or(index);
            if let Ok(Some(row)) = &result {
                let kind = op_kinds.get(index).copied().unwrap_or("content_item.update");
                self.publish(
                    principal,
                    ctx,
                    kind,
                    "content_item",
                    &row.id,
                    json!({"id": row.id, "version": row.version, "batch": true}),
                );
            }
            results.push(BatchResultEntry {
                index: original_index,
                result: result.map_err(ContentError::from),
            });
        }
        results.sort_by_key(|entry| entry.index);
        Ok(results)
    }

    async fn prepare_batch_op(
        &self,
        principal: &Principal,
        operation: BatchOperationInput,
    ) -> Result<BatchOp, ContentError> {
        match operation {
            BatchOperationInput::Create(input) => {
                let status =
                    parse_status(input.status.as_deref())?.unwrap_or(ContentStatus::Draft);
                let kind = self
                    .store
                    .get_content_type(principal.tenant_id, input.content_type_id)
                    .await?
                    .ok_or(ContentError::TypeNotFound)?;
                self.validate_against(&kind, &input.data).await?;
                Ok(BatchOp::Create {
                    content_type_id: kind.id,
                    data: input.data,
                    status,
                })
            }
            BatchOperationInput::Update { id, patch } => {
                if patch.data.is_none() && patch.status.is_none() {
                    return Err(ContentError::EmptyUpdateBody);
                }
                let status = parse_status(patch.status.as_deref())?;
                let current = self.get_item(principal, id).await?;
                let kind = self
                    .store
                    .get_content_type(principal.tenant_id, current.content_type_id)
                    .await?
                    .ok_or(ContentError::TypeNotFound)?;
                let effective = patch.data.clone().unwrap_or_else(|| current.data.clone());
                self.validate_against(&kind, &effective).await?;
                Ok(BatchOp::Update {
                    id,
                    data: patch.data,
                    status,
                    expected_version: patch.expected_version,
                })
            }
            BatchOperationInput::Delete { id } => {
                self.get_item(principal, id).await?;
                Ok(BatchOp::Delete { id })
            }
        }
    }

    async fn validate_against(
        &self,
        kind: &ContentTypeRow,
        data: &Value,
    ) -> Result<(), ContentError> {
        let compiled = self
            .schemas
            .get_or_compile(kind.id, kind.schema_version, &kind.schema_json)
            .await
            .map_err(schema_parse_to_content_error)?;
        compiled
            .validate(data)
            .map_err(ContentError::SchemaValidationFailed)
    }

    fn audit(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        action: AuditAction,
        entity_type: &str,
        entity_id: &str,
    ) -> AuditEntry {
        AuditEntry {
            action,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            details: json!({}),
            actor_id: principal.actor_id.clone(),
            request_id: ctx.request_id.clone(),
        }
    }

    fn publish(
        &self,
        principal: &Principal,
        ctx: &OpContext,
        kind: &str,
        entity_type: &str,
        entity_id: &i64,
        payload: Value,
    ) {
        self.bus.publish(Event::new(
            kind,
            principal.tenant_id,
            entity_type,
            entity_id.to_string(),
            payload,
            ctx.request_id.clone(),
        ));
    }
}

impl From<ContentError> for crate::api_envelope::ApiError {
    fn from(error: ContentError) -> Self {
        use crate::api_envelope::{ApiError, ErrorCode};
        match error {
            ContentError::InvalidSchemaJson(reason) => {
                ApiError::new(ErrorCode::InvalidContentSchemaJson, reason)
            }
            ContentError::SchemaValidationFailed(violations) => {
                let first = violations
                    .first()
                    .map(|violation| format!("{}: {}", violation.pointer, violation.message))
                    .unwrap_or_else(|| "data failed schema validation".to_string());
                let details: Vec<Value> = violations
                    .iter()
                    .map(|violation| {
                        json!({"pointer": violation.pointer, "message": violation.message})
                    })
                    .collect();
                ApiError::new(ErrorCode::ContentSchemaValidationFailed, first.clone())
                    .with_remediation(format!("Fix the data so that {first} passes, then retry."))
                    .with_details(json!({"violations": details}))
            }
            ContentError::TypeNotFound => {
                ApiError::new(ErrorCode::ContentTypeNotFound, "content type not found")
            }
            ContentError::ItemNotFound => {
                ApiError::new(ErrorCode::ContentItemNotFound, "content item not found")
            }
            ContentError::TargetVersionNotFound => {
                ApiError::new(ErrorCode::TargetVersionNotFound, "target version not found")
            }
            ContentError::SlugConflict => ApiError::new(
                ErrorCode::ContentTypeSlugConflict,
                "slug already in use for this tenant",
            ),
            ContentError::VersionConflict { head } => ApiError::new(
                ErrorCode::VersionConflict,
                format!("item was modified concurrently; head version is {head}"),
            )
            .with_details(json!({"headVersion": head})),
            ContentError::EmptyUpdateBody => {
                ApiError::new(ErrorCode::EmptyUpdateBody, "update body is empty")
            }
            ContentError::InvalidStatus(status) => ApiError::new(
                ErrorCode::InvalidRequest,
                format!("unknown status '{status}'"),
            ),
            ContentError::TypeInUse => ApiError::new(
                ErrorCode::ContentTypeInUse,
                "content type is still referenced by items",
            ),
            ContentError::Store(error) => {
                tracing::error!(reason = %error, "content store failure");
                ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
            }
        }
    }
}

fn schema_to_text(schema: &Value) -> Result<String, ContentError> {
    match schema {
        Value::String(text) => {
            serde_json::from_str::<Value>(text)
                .map_err(|error| ContentError::InvalidSchemaJson(error.to_string()))?;
            Ok(text.clone())
        }
        Value::Object(_) => serde_json::to_string(schema)
            .map_err(|error| ContentError::InvalidSchemaJson(error.to_string())),
        _ => Err(ContentError::InvalidSchemaJson(
            "schema must be a JSON object".to_string(),
        )),
    }
}

fn schema_parse_to_content_error(error: SchemaParseError) -> ContentError {
    ContentError::InvalidSchemaJson(error.to_string())
}

fn parse_status(raw: Option<&str>) -> Result<Option<ContentStatus>, ContentError> {
    match raw {
        None => Ok(None),
        Some(raw) => ContentStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| ContentError::InvalidStatus(raw.to_string())),
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for character in name.chars() {
        if character.is_ascii_alphanumeric() {
            slug.push(character.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::auth::Principal;
    use crate::metrics::Metrics;
    use crate::store;

    fn service() -> (ContentService, Arc<dyn Store>) {
        let store = store::memory();
        let bus = EventBus::new(Arc::new(Metrics::default()));
        (
            ContentService::new(store.clone(), SchemaCache::new(), bus),
            store,
        )
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

    fn blog_type_input() -> CreateTypeInput {
        CreateTypeInput {
            name: "Blog Post".to_string(),
            slug: Some("blog-post".to_string()),
            schema: json!({
                "type": "object",
                "required": ["title"],
                "properties": {"title": {"type": "string"}}
            }),
            base_price_sats: None,
        }
    }

    #[tokio::test]
    async fn create_update_rollback_round_trip() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-1");

        let kind = content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("create type");
        assert_eq!(kind.slug, "blog-post");

        let item = content
            .create_item(
                &principal,
                &ctx,
                CreateItemInput {
                    content_type_id: kind.id,
                    data: json!({"title": "v1"}),
                    status: None,
                },
            )
            .await
            .expect("create item");
        assert_eq!(item.version, 1);

        let updated = content
            .update_item(
                &principal,
                &ctx,
                item.id,
                UpdateItemInput {
                    data: Some(json!({"title": "v2"})),
                    status: Some("published".to_string()),
                    expected_version: None,
                },
            )
            .await
            .expect("update item");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, ContentStatus::Published);

        let restored = content
            .rollback_item(&principal, &ctx, item.id, 1)
            .await
            .expect("rollback");
        assert_eq!(restored.version, 3);
        assert_eq!(restored.data, json!({"title": "v1"}));

        let audits = store
            .list_audit_logs(
                principal.tenant_id,
                &crate::store::AuditFilter {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .expect("audits");
        assert!(audits.iter().any(|log| log.action == AuditAction::Update));
        assert!(audits.iter().any(|log| log.action == AuditAction::Rollback));
    }

    #[tokio::test]
    async fn schema_violation_blocks_the_write() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-2");
        let kind = content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("type");

        let rejected = content
            .create_item(
                &principal,
                &ctx,
                CreateItemInput {
                    content_type_id: kind.id,
                    data: json!({}),
                    status: None,
                },
            )
            .await;
        let Err(ContentError::SchemaValidationFailed(violations)) = rejected else {
            unreachable!("expected a schema validation failure");
        };
        assert_eq!(violations[0].pointer, "/title");
    }

    #[tokio::test]
    async fn dry_run_commits_nothing_and_returns_synthetic_id() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let live_ctx = OpContext::new("req-3");
        let dry_ctx = OpContext::dry_run("req-3");

        let kind = content
            .create_type(&principal, &dry_ctx, blog_type_input())
            .await
            .expect("dry type");
        assert_eq!(kind.id, DRY_RUN_ID);
        assert!(
            content
                .list_types(&principal)
                .await
                .expect("list")
                .is_empty()
        );

        let kind = content
            .create_type(&principal, &live_ctx, blog_type_input())
            .await
            .expect("live type");
        let preview = content
            .create_item(
                &principal,
                &dry_ctx,
                CreateItemInput {
                    content_type_id: kind.id,
                    data: json!({"title": "x"}),
                    status: None,
                },
            )
            .await
            .expect("dry item");
        assert_eq!(preview.id, DRY_RUN_ID);
        let items = content
            .list_items(&principal, ContentItemFilter::default())
            .await
            .expect("list items");
        assert!(items.is_empty());

        // Dry runs also leave no audit trail.
        let audits = store
            .list_audit_logs(
                principal.tenant_id,
                &crate::store::AuditFilter {
                    action: Some(AuditAction::Create),
                    entity_type: Some("content_item".to_string()),
                    before_id: None,
                    limit: 10,
                },
            )
            .await
            .expect("audits");
        assert!(audits.is_empty());
    }

    #[tokio::test]
    async fn duplicate_slug_is_a_conflict() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-4");
        content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("first");
        let duplicate = content
            .create_type(&principal, &ctx, blog_type_input())
            .await;
        assert!(matches!(duplicate, Err(ContentError::SlugConflict)));
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-5");
        let kind = content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("type");
        let item = content
            .create_item(
                &principal,
                &ctx,
                CreateItemInput {
                    content_type_id: kind.id,
                    data: json!({"title": "x"}),
                    status: None,
                },
            )
            .await
            .expect("item");

        let rejected = content
            .update_item(&principal, &ctx, item.id, UpdateItemInput::default())
            .await;
        assert!(matches!(rejected, Err(ContentError::EmptyUpdateBody)));
    }

    #[tokio::test]
    async fn non_atomic_batch_reports_per_item_outcomes() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-6");
        let kind = content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("type");

        let results = content
            .batch(
                &principal,
                &ctx,
                vec![
                    BatchOperationInput::Create(CreateItemInput {
                        content_type_id: kind.id,
                        data: json!({"title": "ok"}),
                        status: None,
                    }),
                    BatchOperationInput::Create(CreateItemInput {
                        content_type_id: kind.id,
                        data: json!({}),
                        status: None,
                    }),
                ],
                false,
            )
            .await
            .expect("batch");
        assert!(results[0].result.is_ok());
        assert!(matches!(
            results[1].result,
            Err(ContentError::SchemaValidationFailed(_))
        ));

        let items = content
            .list_items(&principal, ContentItemFilter::default())
            .await
            .expect("list");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn atomic_batch_with_invalid_op_writes_nothing() {
        let (content, store) = service();
        let principal = principal(&store).await;
        let ctx = OpContext::new("req-7");
        let kind = content
            .create_type(&principal, &ctx, blog_type_input())
            .await
            .expect("type");

        let failed = content
            .batch(
                &principal,
                &ctx,
                vec![
                    BatchOperationInput::Create(CreateItemInput {
                        content_type_id: kind.id,
                        data: json!({"title": "ok"}),
                        status: None,
                    }),
                    BatchOperationInput::Delete { id: 12345 },
                ],
                true,
            )
            .await;
        assert!(failed.is_err());

        let items = content
            .list_items(&principal, ContentItemFilter::default())
            .await
            .expect("list");
        assert!(items.is_empty());
    }

    #[test]
    fn slugify_produces_url_safe_names() {
        assert_eq!(slugify("Blog Post"), "blog-post");
        assert_eq!(slugify("  Weird -- Name!! "), "weird-name");
        assert_eq!(slugify("!!!"), "untitled");
    }
}
