//! Postgres schema for every table the engine owns.

use sqlx::PgPool;
use tracing::info;

/// Idempotent DDL, applied in order by [`migrate`].
pub const SCHEMA: &[(&str, &str)] = &[
    (
        "catalog_entities",
        r#"
        CREATE TABLE IF NOT EXISTS catalog_entities (
            tenant_id   UUID        NOT NULL,
            id          UUID        NOT NULL,
            entity_type TEXT        NOT NULL CHECK (entity_type IN ('product', 'category')),
            version     BIGINT      NOT NULL CHECK (version >= 1),
            payload     JSONB       NOT NULL,
            deleted     BOOLEAN     NOT NULL DEFAULT FALSE,
            created_at  TIMESTAMPTZ NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL,
            created_by  UUID        NULL,
            updated_by  UUID        NULL,
            PRIMARY KEY (tenant_id, id)
        );
        CREATE INDEX IF NOT EXISTS catalog_entities_listing
            ON catalog_entities (tenant_id, entity_type, deleted, created_at DESC);
        "#,
    ),
    (
        "cache_version_counters",
        r#"
        CREATE TABLE IF NOT EXISTS cache_version_counters (
            tenant_id   UUID   NOT NULL,
            entity_type TEXT   NOT NULL,
            counter     BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, entity_type)
        );
        "#,
    ),
    (
        "catalog_search_documents",
        r#"
        CREATE TABLE IF NOT EXISTS catalog_search_documents (
            tenant_id   UUID        NOT NULL,
            entity_id   UUID        NOT NULL,
            entity_type TEXT        NOT NULL,
            version     BIGINT      NOT NULL,
            document    JSONB       NOT NULL,
            tsv         TSVECTOR    NOT NULL,
            removed     BOOLEAN     NOT NULL DEFAULT FALSE,
            updated_at  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (tenant_id, entity_id)
        );
        CREATE INDEX IF NOT EXISTS catalog_search_documents_tsv
            ON catalog_search_documents USING GIN (tsv);
        "#,
    ),
    (
        "catalog_outbox",
        r#"
        CREATE TABLE IF NOT EXISTS catalog_outbox (
            seq         BIGSERIAL   PRIMARY KEY,
            tenant_id   UUID        NOT NULL,
            event_id    UUID        NOT NULL,
            event       JSONB       NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (tenant_id, event_id)
        );
        CREATE INDEX IF NOT EXISTS catalog_outbox_tenant_seq ON catalog_outbox (tenant_id, seq);
        "#,
    ),
    (
        "catalog_dead_letters",
        r#"
        CREATE TABLE IF NOT EXISTS catalog_dead_letters (
            id          UUID        PRIMARY KEY,
            tenant_id   UUID        NOT NULL,
            entity_id   UUID        NOT NULL,
            version     BIGINT      NOT NULL,
            side_effect TEXT        NOT NULL,
            attempts    INTEGER     NOT NULL,
            last_error  TEXT        NOT NULL,
            change      JSONB       NOT NULL,
            failed_at   TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS catalog_dead_letters_failed_at ON catalog_dead_letters (failed_at);
        "#,
    ),
];

/// Apply [`SCHEMA`] (safe to run on every start).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (table, ddl) in SCHEMA {
        sqlx::raw_sql(ddl).execute(pool).await?;
        info!(table = *table, "schema ensured");
    }
    Ok(())
}
