use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;

use super::models::{ChangeEvent, OrderRow};

/// Effect of applying one change event to the analytics store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Full row written (insert or unconditional overwrite).
    Upserted { id: i64 },
    /// Row removed; deleting an absent id is still a success.
    Deleted { id: i64 },
    /// Unrecognized event; no store call was made.
    Skipped,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// Bad data inside an otherwise well-formed event. The record is a
    /// poison pill: reported and committed past, never retried.
    #[error("invalid `{field}` for order {id}: {reason}")]
    InvalidField {
        id: i64,
        field: &'static str,
        reason: String,
    },
    /// The store rejected the write or was unreachable.
    #[error("store write failed: {0}")]
    Store(#[from] sqlx::Error),
}

/// Coerced row bound to the `orders_analytics` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAnalyticsRow {
    pub id: i64,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub total: Option<f64>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}

/// Seam over the analytics table so the applier can be exercised without a
/// live PostgreSQL.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn upsert(&self, row: &OrderAnalyticsRow) -> Result<(), ApplyError>;
    async fn delete(&self, id: i64) -> Result<(), ApplyError>;
}

/// Production store over the `orders_analytics` table.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn upsert(&self, row: &OrderAnalyticsRow) -> Result<(), ApplyError> {
        // Single-statement upsert: atomic with respect to the key, and
        // last-write-wins on every column.
        sqlx::query(
            r#"
            INSERT INTO orders_analytics (id, customer_id, customer_name, total, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::timestamptz)
            ON CONFLICT (id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                customer_name = EXCLUDED.customer_name,
                total = EXCLUDED.total,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(row.id)
        .bind(row.customer_id)
        .bind(&row.customer_name)
        .bind(row.total)
        .bind(&row.status)
        .bind(&row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), ApplyError> {
        sqlx::query("DELETE FROM orders_analytics WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Applies decoded change events to the analytics store.
///
/// Replaying the same event any number of times converges to the same row
/// state: the upsert is a total overwrite keyed on `id` and the delete is
/// an unconditional removal keyed on `id`. Ordering between events for the
/// same id is the log's responsibility, not this component's.
pub struct MutationApplier<S> {
    store: S,
}

impl<S: OrderStore> MutationApplier<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ApplyError> {
        match event {
            ChangeEvent::Upsert(row) => {
                let record = coerce_row(row)?;
                self.store.upsert(&record).await?;
                Ok(ApplyOutcome::Upserted { id: record.id })
            }
            ChangeEvent::Delete { id } => {
                self.store.delete(*id).await?;
                Ok(ApplyOutcome::Deleted { id: *id })
            }
            ChangeEvent::Unknown => Ok(ApplyOutcome::Skipped),
        }
    }
}

/// Resolve the raw row into SQL-ready values.
///
/// Only `total` needs work: null stays null, numbers pass through, numeric
/// strings are parsed, and anything else fails the event before any store
/// call is made.
fn coerce_row(row: &OrderRow) -> Result<OrderAnalyticsRow, ApplyError> {
    let total = match &row.total {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n.as_f64().ok_or_else(|| ApplyError::InvalidField {
            id: row.id,
            field: "total",
            reason: format!("out-of-range number: {n}"),
        })?),
        Some(Value::String(s)) => {
            Some(
                s.trim()
                    .parse::<f64>()
                    .map_err(|e| ApplyError::InvalidField {
                        id: row.id,
                        field: "total",
                        reason: format!("non-numeric string {s:?}: {e}"),
                    })?,
            )
        }
        Some(other) => {
            return Err(ApplyError::InvalidField {
                id: row.id,
                field: "total",
                reason: format!("unsupported JSON type: {other}"),
            })
        }
    };

    Ok(OrderAnalyticsRow {
        id: row.id,
        customer_id: row.customer_id,
        customer_name: row.customer_name.clone(),
        total,
        status: row.status.clone(),
        created_at: row.created_at.clone(),
    })
}
