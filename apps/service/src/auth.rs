//! API-key authentication and scope gating.
//!
//! Keys are `wc_sk_<random>`; only the SHA-256 of the secret is stored.
//! The raw secret is returned exactly once, at creation or rotation. The
//! derived [`Principal`] is the sole source of tenant identity on write
//! paths; client-supplied tenant headers are never trusted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::{ApiKeyRow, NewApiKey, Store, StoreError, TenantRow};

pub const SCOPE_ADMIN: &str = "admin";
pub const SCOPE_CONTENT_READ: &str = "content:read";
pub const SCOPE_CONTENT_WRITE: &str = "content:write";
pub const SCOPE_WEBHOOKS_MANAGE: &str = "webhooks:manage";
pub const SCOPE_KEYS_MANAGE: &str = "keys:manage";
pub const SCOPE_AUDIT_READ: &str = "audit:read";
pub const SCOPE_PAYMENTS_READ: &str = "payments:read";
pub const SCOPE_ENTITLEMENTS_MANAGE: &str = "entitlements:manage";

const KEY_SECRET_PREFIX: &str = "wc_sk_";
const DISPLAY_PREFIX_LEN: usize = 12;

/// Per-request identity derived from the presented key.
#[derive(Debug, Clone)]
pub struct Principal {
    pub tenant_id: i64,
    pub key_id: i64,
    pub actor_id: String,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|granted| granted == SCOPE_ADMIN || granted == scope)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing API key")]
    MissingKey,
    #[error("invalid, revoked, or expired API key")]
    InvalidKey,
    #[error("key lacks the '{0}' scope")]
    InsufficientScope(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// View returned by list/get: prefix and metadata only, never the secret.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyView {
    pub id: i64,
    pub name: String,
    pub prefix: String,
    pub scopes: Vec<String>,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyView {
    fn from_row(row: &ApiKeyRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            prefix: row.prefix.clone(),
            scopes: row.scopes.clone(),
            created_by: row.created_by.clone(),
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyIssueResult {
    /// Returned once; never persisted.
    pub secret: String,
    pub key: ApiKeyView,
}

#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn Store>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a tenant plus its first admin key. Used by the development
    /// bootstrap and by tests.
    pub async fn bootstrap_tenant(
        &self,
        name: &str,
        slug: &str,
    ) -> Result<(TenantRow, ApiKeyIssueResult), AuthError> {
        let now = Utc::now();
        let tenant = self.store.create_tenant(name, slug, now).await?;
        let issued = self
            .issue_key(
                tenant.id,
                "root".to_string(),
                vec![SCOPE_ADMIN.to_string()],
                None,
                "bootstrap",
            )
            .await?;
        Ok((tenant, issued))
    }

    pub async fn issue_key(
        &self,
        tenant_id: i64,
        name: String,
        scopes: Vec<String>,
        ttl_seconds: Option<u64>,
        created_by: &str,
    ) -> Result<ApiKeyIssueResult, AuthError> {
        let now = Utc::now();
        let secret = mint_secret();
        let expires_at = ttl_seconds.map(|seconds| now + Duration::seconds(seconds as i64));

        let mut scopes = normalize_scopes(scopes);
        if scopes.is_empty() {
            scopes = vec![SCOPE_CONTENT_READ.to_string()];
        }

        let row = self
            .store
            .insert_api_key(NewApiKey {
                tenant_id,
                name,
                prefix: display_prefix(&secret),
                secret_hash: hash_secret(&secret),
                scopes,
                created_by: created_by.to_string(),
                expires_at,
                created_at: now,
            })
            .await?;

        Ok(ApiKeyIssueResult {
            secret,
            key: ApiKeyView::from_row(&row),
        })
    }

    /// Rotate: the old secret stops working immediately; the fresh secret is
    /// returned once.
    pub async fn rotate_key(
        &self,
        tenant_id: i64,
        key_id: i64,
    ) -> Result<Option<ApiKeyIssueResult>, AuthError> {
        let secret = mint_secret();
        let rotated = self
            .store
            .rotate_api_key(
                tenant_id,
                key_id,
                &display_prefix(&secret),
                &hash_secret(&secret),
                Utc::now(),
            )
            .await?;
        Ok(rotated.map(|row| ApiKeyIssueResult {
            secret,
            key: ApiKeyView::from_row(&row),
        }))
    }

    pub async fn revoke_key(
        &self,
        tenant_id: i64,
        key_id: i64,
    ) -> Result<Option<ApiKeyView>, AuthError> {
        let revoked = self
            .store
            .revoke_api_key(tenant_id, key_id, Utc::now())
            .await?;
        Ok(revoked.map(|row| ApiKeyView::from_row(&row)))
    }

    pub async fn list_keys(&self, tenant_id: i64) -> Result<Vec<ApiKeyView>, AuthError> {
        let rows = self.store.list_api_keys(tenant_id).await?;
        Ok(rows.iter().map(ApiKeyView::from_row).collect())
    }

    /// Authenticate a presented secret and derive the principal.
    /// `last_used_at` is touched on a detached task so the request never
    /// waits on it.
    pub async fn authenticate(&self, presented: &str) -> Result<Principal, AuthError> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Err(AuthError::MissingKey);
        }
        let row = self
            .store
            .find_api_key_by_hash(&hash_secret(presented))
            .await?
            .ok_or(AuthError::InvalidKey)?;
        if !row.is_valid(Utc::now()) {
            return Err(AuthError::InvalidKey);
        }

        let store = self.store.clone();
        let key_id = row.id;
        tokio::spawn(async move {
            if let Err(error) = store.touch_api_key(key_id, Utc::now()).await {
                tracing::debug!(key_id, reason = %error, "last_used_at touch failed");
            }
        });

        Ok(Principal {
            tenant_id: row.tenant_id,
            key_id: row.id,
            actor_id: format!("key_{}", row.id),
            scopes: row.scopes,
        })
    }
}

fn mint_secret() -> String {
    format!(
        "{KEY_SECRET_PREFIX}{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.trim().as_bytes()))
}

fn display_prefix(secret: &str) -> String {
    secret.chars().take(DISPLAY_PREFIX_LEN).collect()
}

fn normalize_scopes(scopes: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();
    for scope in scopes {
        let scope = scope.trim().to_string();
        if scope.is_empty() {
            continue;
        }
        if seen.insert(scope.clone()) {
            normalized.push(scope);
        }
    }
    normalized.sort();
    normalized
}

/// Scope required for an operation family; facades consult this before
/// dispatching.
pub fn required_scope(method: &str, path: &str) -> Option<&'static str> {
    let mutating = matches!(method, "POST" | "PUT" | "PATCH" | "DELETE");
    if path.starts_with("/api/v1/auth/keys") {
        return Some(SCOPE_KEYS_MANAGE);
    }
    if path.starts_with("/api/v1/webhooks") {
        return Some(SCOPE_WEBHOOKS_MANAGE);
    }
    if path.starts_with("/api/v1/audit-logs") {
        return Some(SCOPE_AUDIT_READ);
    }
    if path.starts_with("/api/v1/policy-decisions") {
        return Some(SCOPE_AUDIT_READ);
    }
    if path.starts_with("/api/v1/payments") || path.starts_with("/api/v1/revenue") {
        return Some(SCOPE_PAYMENTS_READ);
    }
    if path.starts_with("/api/v1/entitlements") {
        if mutating {
            return Some(SCOPE_ENTITLEMENTS_MANAGE);
        }
        return Some(SCOPE_PAYMENTS_READ);
    }
    if path.starts_with("/api/v1/offers") {
        return Some(SCOPE_CONTENT_READ);
    }
    if path.starts_with("/api/v1/content-types") || path.starts_with("/api/v1/content-items") {
        if mutating {
            return Some(SCOPE_CONTENT_WRITE);
        }
        return Some(SCOPE_CONTENT_READ);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[tokio::test]
    async fn issued_secret_authenticates_and_is_never_stored() {
        let auth = AuthService::new(store::memory());
        let (tenant, issued) = auth
            .bootstrap_tenant("Acme", "acme")
            .await
            .expect("bootstrap");
        assert!(issued.secret.starts_with("wc_sk_"));
        assert_eq!(issued.key.prefix, display_prefix(&issued.secret));

        let principal = auth
            .authenticate(&issued.secret)
            .await
            .expect("authenticate");
        assert_eq!(principal.tenant_id, tenant.id);
        assert!(principal.has_scope(SCOPE_CONTENT_WRITE));

        let listed = auth.list_keys(tenant.id).await.expect("list");
        assert_eq!(listed.len(), 1);
        let as_json = serde_json::to_value(&listed[0]).expect("serialize");
        assert!(as_json.get("secret_hash").is_none());
    }

    #[tokio::test]
    async fn rotation_invalidates_the_old_secret() {
        let auth = AuthService::new(store::memory());
        let (tenant, issued) = auth.bootstrap_tenant("Acme", "acme").await.expect("boot");

        let rotated = auth
            .rotate_key(tenant.id, issued.key.id)
            .await
            .expect("rotate")
            .expect("key exists");
        assert_ne!(rotated.secret, issued.secret);

        assert!(matches!(
            auth.authenticate(&issued.secret).await,
            Err(AuthError::InvalidKey)
        ));
        assert!(auth.authenticate(&rotated.secret).await.is_ok());
    }

    #[tokio::test]
    async fn revoked_key_is_rejected() {
        let auth = AuthService::new(store::memory());
        let (tenant, issued) = auth.bootstrap_tenant("Acme", "acme").await.expect("boot");
        auth.revoke_key(tenant.id, issued.key.id)
            .await
            .expect("revoke");
        assert!(matches!(
            auth.authenticate(&issued.secret).await,
            Err(AuthError::InvalidKey)
        ));
    }

    #[test]
    fn scope_map_distinguishes_reads_from_writes() {
        assert_eq!(
            required_scope("GET", "/api/v1/content-items"),
            Some(SCOPE_CONTENT_READ)
        );
        assert_eq!(
            required_scope("POST", "/api/v1/content-items"),
            Some(SCOPE_CONTENT_WRITE)
        );
        assert_eq!(
            required_scope("POST", "/api/v1/auth/keys"),
            Some(SCOPE_KEYS_MANAGE)
        );
        assert_eq!(required_scope("GET", "/healthz"), None);
    }

    #[test]
    fn admin_scope_implies_everything() {
        let principal = Principal {
            tenant_id: 1,
            key_id: 1,
            actor_id: "key_1".to_string(),
            scopes: vec![SCOPE_ADMIN.to_string()],
        };
        assert!(principal.has_scope(SCOPE_CONTENT_WRITE));
        assert!(principal.has_scope(SCOPE_KEYS_MANAGE));
    }
}
