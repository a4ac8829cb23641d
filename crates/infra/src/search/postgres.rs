//! Postgres full-text index (`tsvector`, `simple` configuration).
//!
//! Rows are keyed by `(tenant_id, entity_id)`. Removal leaves a tombstone row
//! (`removed = TRUE`) so a late upsert cannot bring a deleted entity back.
//! Reconciliation deletes tombstones once they outlive the retry horizon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use marketplace_catalog::document::tokenize;
use marketplace_catalog::{SearchDocument, SearchQuery};
use marketplace_core::{EntityId, TenantId};

use super::{SearchError, SearchHit, SearchIndex};

#[derive(Debug, Clone)]
pub struct PostgresSearchIndex {
    pool: Arc<PgPool>,
}

impl PostgresSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SearchError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            SearchError::Unavailable(format!("{operation}: {err}"))
        }
        other => SearchError::Backend(format!("{operation}: {other}")),
    }
}

/// `term:* & term:*`, or `None` for a wildcard query. Terms are alphanumeric
/// tokens, so no tsquery operator can be smuggled in.
fn prefix_tsquery(query: &SearchQuery) -> Option<String> {
    let terms = query.terms();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("{t}:*"))
            .collect::<Vec<_>>()
            .join(" & "),
    )
}

#[async_trait]
impl SearchIndex for PostgresSearchIndex {
    #[instrument(
        skip(self, document),
        fields(tenant_id = %document.tenant_id, entity_id = %document.entity_id, version = document.version),
        err
    )]
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchError> {
        let title = tokenize(&document.title).join(" ");
        let rest = document.tokens().join(" ");
        let json = serde_json::to_value(&document)
            .map_err(|e| SearchError::Backend(format!("document not serializable: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO catalog_search_documents
                (tenant_id, entity_id, entity_type, version, document, tsv, removed, updated_at)
            VALUES (
                $1, $2, $3, $4, $5,
                setweight(to_tsvector('simple', $6), 'A') || setweight(to_tsvector('simple', $7), 'B'),
                FALSE, $8
            )
            ON CONFLICT (tenant_id, entity_id) DO UPDATE
            SET entity_type = EXCLUDED.entity_type,
                version = EXCLUDED.version,
                document = EXCLUDED.document,
                tsv = EXCLUDED.tsv,
                updated_at = EXCLUDED.updated_at
            WHERE catalog_search_documents.removed = FALSE
                AND catalog_search_documents.version < EXCLUDED.version
            "#,
        )
        .bind(document.tenant_id.as_uuid())
        .bind(document.entity_id.as_uuid())
        .bind(document.entity_type.as_str())
        .bind(document.version as i64)
        .bind(&json)
        .bind(&title)
        .bind(&rest)
        .bind(document.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("search.upsert", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entity_id = %entity_id), err)]
    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<(), SearchError> {
        sqlx::query(
            r#"
            INSERT INTO catalog_search_documents
                (tenant_id, entity_id, entity_type, version, document, tsv, removed, updated_at)
            VALUES ($1, $2, '', 0, '{}'::jsonb, ''::tsvector, TRUE, NOW())
            ON CONFLICT (tenant_id, entity_id) DO UPDATE
            SET removed = TRUE, document = '{}'::jsonb, tsv = ''::tsvector, updated_at = NOW()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("search.remove", e))?;

        Ok(())
    }

    #[instrument(skip(self, query), fields(tenant_id = %tenant_id), err)]
    async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        let tags: Vec<String> = query.tags.iter().map(|t| t.to_lowercase()).collect();

        // The tenant predicate comes first and is not optional.
        let rows = sqlx::query(
            r#"
            SELECT document,
                   CASE WHEN $2::text IS NULL THEN 0::float8
                        ELSE ts_rank(tsv, to_tsquery('simple', $2))::float8 END AS score
            FROM catalog_search_documents
            WHERE tenant_id = $1
                AND removed = FALSE
                AND ($2::text IS NULL OR tsv @@ to_tsquery('simple', $2))
                AND ($3::text IS NULL OR entity_type = $3)
                AND ($4::text IS NULL OR document->>'category_id' = $4)
                AND ($5::float8 IS NULL OR (document->>'price')::float8 >= $5)
                AND ($6::float8 IS NULL OR (document->>'price')::float8 <= $6)
                AND ($7 OR (document->>'is_active')::boolean)
                AND NOT EXISTS (
                    SELECT 1 FROM unnest($8::text[]) AS wanted
                    WHERE NOT EXISTS (
                        SELECT 1 FROM jsonb_array_elements_text(document->'tags') AS tag
                        WHERE lower(tag) = wanted
                    )
                )
            ORDER BY score DESC, updated_at DESC, entity_id ASC
            LIMIT $9 OFFSET $10
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(prefix_tsquery(query))
        .bind(query.entity_type.map(|t| t.as_str()))
        .bind(query.category_id.map(|id| id.to_string()))
        .bind(query.min_price)
        .bind(query.max_price)
        .bind(query.include_inactive)
        .bind(&tags)
        .bind(query.limit() as i64)
        .bind(query.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("search.query", e))?;

        rows.iter()
            .map(|row| {
                let json: serde_json::Value = row
                    .try_get("document")
                    .map_err(|e| map_sqlx_error("search.query", e))?;
                let score: f64 = row
                    .try_get("score")
                    .map_err(|e| map_sqlx_error("search.query", e))?;
                let document: SearchDocument = serde_json::from_value(json)
                    .map_err(|e| SearchError::Backend(format!("corrupt search document: {e}")))?;
                Ok(SearchHit { document, score })
            })
            .collect()
    }

    async fn indexed_versions(&self, tenant_id: TenantId) -> Result<HashMap<EntityId, u64>, SearchError> {
        let rows = sqlx::query(
            "SELECT entity_id, version FROM catalog_search_documents WHERE tenant_id = $1 AND removed = FALSE",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("search.indexed_versions", e))?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row
                    .try_get("entity_id")
                    .map_err(|e| map_sqlx_error("search.indexed_versions", e))?;
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| map_sqlx_error("search.indexed_versions", e))?;
                Ok((EntityId::from_uuid(id), version as u64))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn purge_tombstones(&self, tenant_id: TenantId, older_than: Duration) -> Result<usize, SearchError> {
        let result = sqlx::query(
            r#"
            DELETE FROM catalog_search_documents
            WHERE tenant_id = $1 AND removed = TRUE
                AND updated_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(older_than.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("search.purge_tombstones", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), SearchError> {
        sqlx::query("DELETE FROM catalog_search_documents WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("search.clear_tenant", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsquery_uses_prefix_terms_only() {
        assert_eq!(
            prefix_tsquery(&SearchQuery::text("Blue wid'get")).as_deref(),
            Some("blue:* & wid:* & get:*")
        );
        assert_eq!(prefix_tsquery(&SearchQuery::text("*")), None);
    }
}
