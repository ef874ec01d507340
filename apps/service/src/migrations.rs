//! Embedded schema migrations, applied in order through a
//! `schema_migrations` ledger so re-runs are no-ops.

use anyhow::{Context, Result};
use tokio_postgres::Client;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tenants_and_api_keys",
        sql: r#"
            CREATE TABLE tenants (
                id          BIGSERIAL PRIMARY KEY,
                name        TEXT NOT NULL,
                slug        TEXT NOT NULL UNIQUE,
                created_at  TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE api_keys (
                id            BIGSERIAL PRIMARY KEY,
                tenant_id     BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name          TEXT NOT NULL,
                prefix        TEXT NOT NULL,
                secret_hash   TEXT NOT NULL UNIQUE,
                scopes        TEXT[] NOT NULL,
                created_by    TEXT NOT NULL,
                expires_at    TIMESTAMPTZ,
                revoked_at    TIMESTAMPTZ,
                last_used_at  TIMESTAMPTZ,
                created_at    TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX api_keys_tenant_idx ON api_keys (tenant_id);
        "#,
    },
    Migration {
        version: 2,
        name: "content",
        sql: r#"
            CREATE TABLE content_types (
                id               BIGSERIAL PRIMARY KEY,
                tenant_id        BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name             TEXT NOT NULL,
                slug             TEXT NOT NULL,
                schema_json      TEXT NOT NULL,
                schema_version   BIGINT NOT NULL DEFAULT 1,
                base_price_sats  BIGINT NOT NULL DEFAULT 0 CHECK (base_price_sats >= 0),
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, slug)
            );

            CREATE TABLE content_items (
                id               BIGSERIAL PRIMARY KEY,
                tenant_id        BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                content_type_id  BIGINT NOT NULL REFERENCES content_types(id) ON DELETE RESTRICT,
                data             JSONB NOT NULL,
                status           TEXT NOT NULL,
                version          BIGINT NOT NULL CHECK (version >= 1),
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX content_items_tenant_idx ON content_items (tenant_id);
            CREATE INDEX content_items_type_idx ON content_items (tenant_id, content_type_id);

            CREATE TABLE content_item_versions (
                id               BIGSERIAL PRIMARY KEY,
                content_item_id  BIGINT NOT NULL REFERENCES content_items(id) ON DELETE CASCADE,
                data             JSONB NOT NULL,
                status           TEXT NOT NULL,
                version          BIGINT NOT NULL,
                created_at       TIMESTAMPTZ NOT NULL,
                UNIQUE (content_item_id, version)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "audit_and_policy_decisions",
        sql: r#"
            CREATE TABLE audit_logs (
                id           BIGSERIAL PRIMARY KEY,
                tenant_id    BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                action       TEXT NOT NULL,
                entity_type  TEXT NOT NULL,
                entity_id    TEXT NOT NULL,
                details      JSONB NOT NULL,
                actor_id     TEXT NOT NULL,
                request_id   TEXT NOT NULL,
                created_at   TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX audit_logs_tenant_idx ON audit_logs (tenant_id, id DESC);

            CREATE TABLE policy_decisions (
                id          BIGSERIAL PRIMARY KEY,
                tenant_id   BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                actor_id    TEXT NOT NULL,
                operation   TEXT NOT NULL,
                resource    TEXT NOT NULL,
                decision    TEXT NOT NULL,
                reason      TEXT NOT NULL,
                request_id  TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX policy_decisions_tenant_idx ON policy_decisions (tenant_id, id DESC);
        "#,
    },
    Migration {
        version: 4,
        name: "webhooks",
        sql: r#"
            CREATE TABLE webhooks (
                id              BIGSERIAL PRIMARY KEY,
                tenant_id       BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                url             TEXT NOT NULL,
                event_patterns  TEXT[] NOT NULL,
                secret          TEXT NOT NULL,
                active          BOOLEAN NOT NULL DEFAULT TRUE,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX webhooks_tenant_idx ON webhooks (tenant_id);

            CREATE TABLE webhook_deliveries (
                id               BIGSERIAL PRIMARY KEY,
                tenant_id        BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                webhook_id       BIGINT NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
                event_kind       TEXT NOT NULL,
                payload          JSONB NOT NULL,
                status           TEXT NOT NULL,
                attempts         INT NOT NULL DEFAULT 0,
                last_error       TEXT,
                next_attempt_at  TIMESTAMPTZ NOT NULL,
                delivered_at     TIMESTAMPTZ,
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX webhook_deliveries_due_idx
                ON webhook_deliveries (status, next_attempt_at);
        "#,
    },
    Migration {
        version: 5,
        name: "payments_and_entitlements",
        sql: r#"
            CREATE TABLE payments (
                id                   BIGSERIAL PRIMARY KEY,
                tenant_id            BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                payment_hash         TEXT NOT NULL UNIQUE,
                provider             TEXT NOT NULL,
                provider_invoice_id  TEXT,
                payment_request      TEXT NOT NULL,
                amount_sats          BIGINT NOT NULL CHECK (amount_sats > 0),
                status               TEXT NOT NULL,
                expires_at           TIMESTAMPTZ NOT NULL,
                settled_at           TIMESTAMPTZ,
                failure_reason       TEXT,
                last_event_id        TEXT,
                resource_path        TEXT NOT NULL,
                actor_id             TEXT NOT NULL,
                details              JSONB NOT NULL,
                created_at           TIMESTAMPTZ NOT NULL,
                updated_at           TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX payments_tenant_idx ON payments (tenant_id, id DESC);
            CREATE INDEX payments_pending_idx ON payments (status, created_at);

            CREATE TABLE payment_webhook_events (
                id            BIGSERIAL PRIMARY KEY,
                provider      TEXT NOT NULL,
                event_id      TEXT NOT NULL,
                payment_hash  TEXT NOT NULL,
                status        TEXT NOT NULL,
                received_at   TIMESTAMPTZ NOT NULL,
                UNIQUE (payment_hash, event_id)
            );

            CREATE TABLE entitlements (
                id                BIGSERIAL PRIMARY KEY,
                tenant_id         BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                offer_kind        TEXT NOT NULL,
                offer_id          BIGINT NOT NULL,
                policy_id         TEXT NOT NULL,
                policy_version    BIGINT NOT NULL,
                agent_profile_id  TEXT NOT NULL,
                payment_hash      TEXT NOT NULL UNIQUE,
                status            TEXT NOT NULL,
                remaining_reads   BIGINT,
                expires_at        TIMESTAMPTZ,
                activated_at      TIMESTAMPTZ,
                terminated_at     TIMESTAMPTZ,
                delegated_from    BIGINT REFERENCES entitlements(id) ON DELETE SET NULL,
                created_at        TIMESTAMPTZ NOT NULL,
                updated_at        TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX entitlements_offer_idx
                ON entitlements (tenant_id, offer_kind, offer_id, agent_profile_id);
        "#,
    },
    Migration {
        version: 6,
        name: "revenue_and_payouts",
        sql: r#"
            CREATE TABLE revenue_events (
                id              BIGSERIAL PRIMARY KEY,
                tenant_id       BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                payment_hash    TEXT NOT NULL UNIQUE,
                gross_sats      BIGINT NOT NULL CHECK (gross_sats > 0),
                policy_id       TEXT NOT NULL,
                policy_version  BIGINT NOT NULL,
                settled_at      TIMESTAMPTZ NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE revenue_allocations (
                id                BIGSERIAL PRIMARY KEY,
                tenant_id         BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                revenue_event_id  BIGINT NOT NULL REFERENCES revenue_events(id) ON DELETE CASCADE,
                agent_profile_id  TEXT NOT NULL,
                amount_sats       BIGINT NOT NULL CHECK (amount_sats >= 0),
                status            TEXT NOT NULL,
                cleared_at        TIMESTAMPTZ,
                created_at        TIMESTAMPTZ NOT NULL,
                updated_at        TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX revenue_allocations_party_idx
                ON revenue_allocations (tenant_id, agent_profile_id, status);

            CREATE TABLE payout_batches (
                id          BIGSERIAL PRIMARY KEY,
                tenant_id   BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                status      TEXT NOT NULL,
                total_sats  BIGINT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE payout_transfers (
                id                BIGSERIAL PRIMARY KEY,
                tenant_id         BIGINT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                batch_id          BIGINT NOT NULL REFERENCES payout_batches(id) ON DELETE CASCADE,
                agent_profile_id  TEXT NOT NULL,
                amount_sats       BIGINT NOT NULL CHECK (amount_sats > 0),
                status            TEXT NOT NULL,
                attempts          INT NOT NULL DEFAULT 0,
                last_error        TEXT,
                created_at        TIMESTAMPTZ NOT NULL,
                updated_at        TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX payout_transfers_due_idx ON payout_transfers (status);
        "#,
    },
];

/// Apply all pending migrations. Returns the number applied.
pub async fn apply(client: &mut Client) -> Result<usize> {
    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version     BIGINT PRIMARY KEY,
                name        TEXT NOT NULL,
                applied_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .await
        .context("create schema_migrations ledger")?;

    let mut applied = 0usize;
    for migration in MIGRATIONS {
        let seen = client
            .query_opt(
                "SELECT version FROM schema_migrations WHERE version = $1",
                &[&migration.version],
            )
            .await
            .context("read schema_migrations")?;
        if seen.is_some() {
            continue;
        }

        let tx = client.transaction().await.context("open migration txn")?;
        tx.batch_execute(migration.sql)
            .await
            .with_context(|| format!("apply migration {} {}", migration.version, migration.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[&migration.version, &migration.name],
        )
        .await
        .context("record applied migration")?;
        tx.commit().await.context("commit migration")?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::MIGRATIONS;

    #[test]
    fn migration_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn migration_names_are_unique() {
        let mut names = std::collections::HashSet::new();
        for migration in MIGRATIONS {
            assert!(names.insert(migration.name), "duplicate: {}", migration.name);
        }
    }
}
