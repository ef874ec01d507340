//! The shared operation set. Every protocol facade resolves to these
//! name-indexed operations with identical scope checks, inputs, and error
//! codes; the REST surface binds the same services route-by-route.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::api_envelope::{ApiError, ErrorCode};
use crate::auth::{
    Principal, SCOPE_AUDIT_READ, SCOPE_CONTENT_READ, SCOPE_CONTENT_WRITE,
    SCOPE_ENTITLEMENTS_MANAGE, SCOPE_KEYS_MANAGE, SCOPE_PAYMENTS_READ, SCOPE_WEBHOOKS_MANAGE,
};
use crate::content::{
    BatchOperationInput, CreateItemInput, CreateTypeInput, UpdateItemInput, UpdateTypeInput,
};
use crate::context::OpContext;
use crate::entitlements::DelegateInput;
use crate::store::{AuditFilter, ContentItemFilter, ContentStatus, PaymentState, Store as _};
use crate::webhooks::{CreateWebhookInput, UpdateWebhookInput};

/// Operation names with the scope each requires.
pub const OPERATIONS: &[(&str, &str)] = &[
    ("content_type.create", SCOPE_CONTENT_WRITE),
    ("content_type.list", SCOPE_CONTENT_READ),
    ("content_type.get", SCOPE_CONTENT_READ),
    ("content_type.update", SCOPE_CONTENT_WRITE),
    ("content_type.delete", SCOPE_CONTENT_WRITE),
    ("content_item.create", SCOPE_CONTENT_WRITE),
    ("content_item.list", SCOPE_CONTENT_READ),
    ("content_item.get", SCOPE_CONTENT_READ),
    ("content_item.update", SCOPE_CONTENT_WRITE),
    ("content_item.delete", SCOPE_CONTENT_WRITE),
    ("content_item.rollback", SCOPE_CONTENT_WRITE),
    ("content_item.versions", SCOPE_CONTENT_READ),
    ("content_item.batch", SCOPE_CONTENT_WRITE),
    ("webhook.create", SCOPE_WEBHOOKS_MANAGE),
    ("webhook.list", SCOPE_WEBHOOKS_MANAGE),
    ("webhook.update", SCOPE_WEBHOOKS_MANAGE),
    ("webhook.delete", SCOPE_WEBHOOKS_MANAGE),
    ("api_key.list", SCOPE_KEYS_MANAGE),
    ("audit.list", SCOPE_AUDIT_READ),
    ("payment.list", SCOPE_PAYMENTS_READ),
    ("payment.get", SCOPE_PAYMENTS_READ),
    ("entitlement.list", SCOPE_PAYMENTS_READ),
    ("entitlement.get", SCOPE_PAYMENTS_READ),
    ("entitlement.revoke", SCOPE_ENTITLEMENTS_MANAGE),
    ("entitlement.delegate", SCOPE_ENTITLEMENTS_MANAGE),
];

pub fn operation_scope(tool: &str) -> Option<&'static str> {
    OPERATIONS
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, scope)| *scope)
}

fn bad_args(reason: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        ErrorCode::InvalidRequest,
        format!("invalid operation arguments: {reason}"),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdArgs {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTypeArgs {
    name: String,
    #[serde(default)]
    slug: Option<String>,
    schema: Value,
    #[serde(default)]
    base_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTypeArgs {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    base_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateItemArgs {
    content_type_id: i64,
    data: Value,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateItemArgs {
    id: i64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    expected_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackArgs {
    id: i64,
    version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListItemsArgs {
    #[serde(default)]
    content_type_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    after_id: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchArgs {
    #[serde(default)]
    atomic: bool,
    operations: Vec<BatchArgEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
enum BatchArgEntry {
    Create {
        content_type_id: i64,
        data: Value,
        #[serde(default)]
        status: Option<String>,
    },
    Update {
        id: i64,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        expected_version: Option<i64>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebhookArgs {
    url: String,
    event_patterns: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWebhookArgs {
    id: i64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    event_patterns: Option<Vec<String>>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditListArgs {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    before_id: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    before_id: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntitlementListArgs {
    #[serde(default)]
    agent_profile_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateArgs {
    parent_id: i64,
    agent_profile_id: String,
    #[serde(default)]
    reads: Option<i64>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

fn parse<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ApiError> {
    serde_json::from_value(arguments).map_err(bad_args)
}

/// Dispatch one named operation on behalf of the principal.
pub async fn dispatch(
    state: &AppState,
    principal: &Principal,
    ctx: &OpContext,
    tool: &str,
    arguments: Value,
) -> Result<Value, ApiError> {
    let Some(scope) = operation_scope(tool) else {
        return Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("unknown operation '{tool}'"),
        )
        .with_remediation("List operations with the tools/list method."));
    };
    if !principal.has_scope(scope) {
        return Err(ApiError::new(
            ErrorCode::AuthInsufficientScope,
            format!("operation requires the '{scope}' scope"),
        ));
    }

    match tool {
        "content_type.create" => {
            let args: CreateTypeArgs = parse(arguments)?;
            let row = state
                .content
                .create_type(
                    principal,
                    ctx,
                    CreateTypeInput {
                        name: args.name,
                        slug: args.slug,
                        schema: args.schema,
                        base_price_sats: args.base_price,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "content_type.list" => {
            let rows = state.content.list_types(principal).await?;
            Ok(json!(rows))
        }
        "content_type.get" => {
            let args: IdArgs = parse(arguments)?;
            Ok(json!(state.content.get_type(principal, args.id).await?))
        }
        "content_type.update" => {
            let args: UpdateTypeArgs = parse(arguments)?;
            let row = state
                .content
                .update_type(
                    principal,
                    ctx,
                    args.id,
                    UpdateTypeInput {
                        name: args.name,
                        slug: args.slug,
                        schema: args.schema,
                        base_price_sats: args.base_price,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "content_type.delete" => {
            let args: IdArgs = parse(arguments)?;
            state.content.delete_type(principal, ctx, args.id).await?;
            Ok(json!({"deleted": true}))
        }
        "content_item.create" => {
            let args: CreateItemArgs = parse(arguments)?;
            let row = state
                .content
                .create_item(
                    principal,
                    ctx,
                    CreateItemInput {
                        content_type_id: args.content_type_id,
                        data: args.data,
                        status: args.status,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "content_item.list" => {
            let args: ListItemsArgs = parse(arguments)?;
            let status = parse_content_status(args.status.as_deref())?;
            let rows = state
                .content
                .list_items(
                    principal,
                    ContentItemFilter {
                        content_type_id: args.content_type_id,
                        status,
                        after_id: args.after_id,
                        limit: args.limit.unwrap_or(0),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(json!(rows))
        }
        "content_item.get" => {
            let args: IdArgs = parse(arguments)?;
            Ok(json!(state.content.get_item(principal, args.id).await?))
        }
        "content_item.update" => {
            let args: UpdateItemArgs = parse(arguments)?;
            let row = state
                .content
                .update_item(
                    principal,
                    ctx,
                    args.id,
                    UpdateItemInput {
                        data: args.data,
                        status: args.status,
                        expected_version: args.expected_version,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "content_item.delete" => {
            let args: IdArgs = parse(arguments)?;
            state.content.delete_item(principal, ctx, args.id).await?;
            Ok(json!({"deleted": true}))
        }
        "content_item.rollback" => {
            let args: RollbackArgs = parse(arguments)?;
            let row = state
                .content
                .rollback_item(principal, ctx, args.id, args.version)
                .await?;
            Ok(json!(row))
        }
        "content_item.versions" => {
            let args: IdArgs = parse(arguments)?;
            Ok(json!(state.content.list_versions(principal, args.id).await?))
        }
        "content_item.batch" => {
            let args: BatchArgs = parse(arguments)?;
            let operations = args
                .operations
                .into_iter()
                .map(|entry| match entry {
                    BatchArgEntry::Create {
                        content_type_id,
                        data,
                        status,
                    } => BatchOperationInput::Create(CreateItemInput {
                        content_type_id,
                        data,
                        status,
                    }),
                    BatchArgEntry::Update {
                        id,
                        data,
                        status,
                        expected_version,
                    } => BatchOperationInput::Update {
                        id,
                        patch: UpdateItemInput {
                            data,
                            status,
                            expected_version,
                        },
                    },
                    BatchArgEntry::Delete { id } => BatchOperationInput::Delete { id },
                })
                .collect();
            let entries = state
                .content
                .batch(principal, ctx, operations, args.atomic)
                .await?;
            let report: Vec<Value> = entries
                .into_iter()
                .map(|entry| match entry.result {
                    Ok(Some(row)) => json!({
                        "index": entry.index,
                        "ok": true,
                        "id": row.id,
                        "version": row.version,
                    }),
                    Ok(None) => json!({"index": entry.index, "ok": true}),
                    Err(error) => {
                        let api: ApiError = error.into();
                        json!({
                            "index": entry.index,
                            "ok": false,
                            "code": api.code.as_str(),
                            "error": api.message,
                        })
                    }
                })
                .collect();
            Ok(json!({"results": report}))
        }
        "webhook.create" => {
            let args: CreateWebhookArgs = parse(arguments)?;
            let row = state
                .webhooks
                .create(
                    principal,
                    CreateWebhookInput {
                        url: args.url,
                        event_patterns: args.event_patterns,
                        secret: args.secret,
                        active: args.active,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "webhook.list" => Ok(json!(state.webhooks.list(principal).await?)),
        "webhook.update" => {
            let args: UpdateWebhookArgs = parse(arguments)?;
            let row = state
                .webhooks
                .update(
                    principal,
                    args.id,
                    UpdateWebhookInput {
                        url: args.url,
                        event_patterns: args.event_patterns,
                        secret: args.secret,
                        active: args.active,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        "webhook.delete" => {
            let args: IdArgs = parse(arguments)?;
            state.webhooks.delete(principal, args.id).await?;
            Ok(json!({"deleted": true}))
        }
        "api_key.list" => {
            let keys = state
                .auth
                .list_keys(principal.tenant_id)
                .await
                .map_err(|error| {
                    tracing::error!(reason = %error, "key listing failed");
                    ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
                })?;
            Ok(json!(keys))
        }
        "audit.list" => {
            let args: AuditListArgs = parse(arguments)?;
            let action = match args.action.as_deref() {
                None => None,
                Some(raw) => Some(
                    crate::store::AuditAction::parse(raw)
                        .ok_or_else(|| bad_args(format!("unknown action '{raw}'")))?,
                ),
            };
            let rows = state
                .store
                .list_audit_logs(
                    principal.tenant_id,
                    &AuditFilter {
                        action,
                        entity_type: args.entity_type,
                        before_id: args.before_id,
                        limit: args.limit.unwrap_or(50).clamp(1, 200),
                    },
                )
                .await
                .map_err(|error| {
                    tracing::error!(reason = %error, "audit listing failed");
                    ApiError::new(ErrorCode::DependencyUnavailable, "storage unavailable")
                })?;
            Ok(json!(rows))
        }
        "payment.list" => {
            let args: PaymentListArgs = parse(arguments)?;
            let status = match args.status.as_deref() {
                None => None,
                Some(raw) => Some(
                    PaymentState::parse(raw)
                        .ok_or_else(|| bad_args(format!("unknown status '{raw}'")))?,
                ),
            };
            let rows = state
                .payments
                .list(
                    principal,
                    status,
                    args.before_id,
                    args.limit.unwrap_or(50).clamp(1, 200),
                )
                .await?;
            Ok(json!(rows))
        }
        "payment.get" => {
            let args: IdArgs = parse(arguments)?;
            let payment = state
                .payments
                .get(principal, args.id)
                .await?
                .ok_or_else(|| ApiError::new(ErrorCode::PaymentNotFound, "payment not found"))?;
            Ok(json!(payment))
        }
        "entitlement.list" => {
            let args: EntitlementListArgs = parse(arguments)?;
            let rows = state
                .entitlements
                .list(
                    principal,
                    args.agent_profile_id.as_deref(),
                    args.limit.unwrap_or(50),
                )
                .await?;
            Ok(json!(rows))
        }
        "entitlement.get" => {
            let args: IdArgs = parse(arguments)?;
            Ok(json!(state.entitlements.get(principal, args.id).await?))
        }
        "entitlement.revoke" => {
            let args: IdArgs = parse(arguments)?;
            Ok(json!(state.entitlements.revoke(principal, ctx, args.id).await?))
        }
        "entitlement.delegate" => {
            let args: DelegateArgs = parse(arguments)?;
            let row = state
                .entitlements
                .delegate(
                    principal,
                    ctx,
                    DelegateInput {
                        parent_id: args.parent_id,
                        agent_profile_id: args.agent_profile_id,
                        reads: args.reads,
                        ttl_seconds: args.ttl_seconds,
                    },
                )
                .await?;
            Ok(json!(row))
        }
        _ => Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("unknown operation '{tool}'"),
        )),
    }
}

fn parse_content_status(raw: Option<&str>) -> Result<Option<ContentStatus>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => ContentStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| bad_args(format!("unknown status '{raw}'"))),
    }
}
