//! `csv_data` persistence

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::DbResult;
use crate::models::{FilterValue, PersistedRow, RowFilter};

const SELECT_ROWS: &str = "SELECT id, first_name, last_name, email_address, created_at, \
                           deleted_at, merged_at, parent_user_id FROM csv_data WHERE 1=1";

/// System of record for consumed rows
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a row, replacing any stored row with the same id.
    async fn upsert(&self, row: &PersistedRow) -> DbResult<()>;

    /// Rows matching `filter`, ordered by id.
    async fn query(&self, filter: &RowFilter, limit: i64, offset: i64)
        -> DbResult<Vec<PersistedRow>>;

    async fn health_check(&self) -> DbResult<()>;
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[tracing::instrument(skip(self, row), fields(id = %row.id))]
    async fn upsert(&self, row: &PersistedRow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO csv_data (
                id, first_name, last_name, email_address,
                created_at, deleted_at, merged_at, parent_user_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email_address = EXCLUDED.email_address,
                created_at = EXCLUDED.created_at,
                deleted_at = EXCLUDED.deleted_at,
                merged_at = EXCLUDED.merged_at,
                parent_user_id = EXCLUDED.parent_user_id
            "#,
        )
        .bind(&row.id)
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(&row.email_address)
        .bind(row.created_at)
        .bind(row.deleted_at)
        .bind(row.merged_at)
        .bind(&row.parent_user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn query(
        &self,
        filter: &RowFilter,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<PersistedRow>> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_ROWS);

        for (column, value) in filter.predicates() {
            builder.push(" AND ").push(column.as_str()).push(" = ");
            match value {
                FilterValue::Text(text) => builder.push_bind(text.clone()),
                FilterValue::Timestamp(ts) => builder.push_bind(*ts),
            };
        }

        builder
            .push(" ORDER BY id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = builder
            .build_query_as::<PersistedRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn health_check(&self) -> DbResult<()> {
        super::health_check(&self.pool).await
    }
}
