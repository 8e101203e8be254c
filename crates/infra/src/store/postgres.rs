//! Postgres-backed stock and cart line stores.
//!
//! The version guard is enforced inside a single `UPDATE ... WHERE version = $n`
//! statement, so a concurrent writer can never slip between the check and the
//! write. The schema lives in `migrations/0001_reservations.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / Io / other | N/A | `Unavailable` |

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{instrument, Span};

use storefront_core::{CartId, CartLineId, ExpectedVersion, VariantId};
use storefront_inventory::{CartLine, VariantStock};

use super::r#trait::{CartLineStore, StockStore, StoreError};

/// Schema for both stores.
pub const SCHEMA: &str = include_str!("../../migrations/0001_reservations.sql");

/// Apply the reservation schema (idempotent).
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Postgres-backed variant stock store.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), fields(variant_id = %variant_id), err)]
    pub async fn load_variant(
        &self,
        variant_id: VariantId,
    ) -> Result<Option<VariantStock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                variant_id,
                inventory_quantity,
                reserved_quantity,
                version,
                last_modified
            FROM variant_stock
            WHERE variant_id = $1
            "#,
        )
        .bind(variant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_variant", e))?;

        row.as_ref().map(stock_from_row).transpose()
    }

    /// Version-guarded update of `reserved_quantity`.
    ///
    /// Zero rows updated means either the variant is missing or another writer
    /// committed first; a follow-up read tells the two apart.
    #[instrument(
        skip(self),
        fields(variant_id = %variant_id, expected = ?expected),
        err
    )]
    pub async fn set_reserved(
        &self,
        variant_id: VariantId,
        expected: ExpectedVersion,
        reserved_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError> {
        let expected_version: Option<i64> = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(to_i64(v)?),
        };

        let row = sqlx::query(
            r#"
            UPDATE variant_stock
            SET
                reserved_quantity = $3,
                version = version + 1,
                last_modified = $4
            WHERE variant_id = $1
                AND ($2::bigint IS NULL OR version = $2)
            RETURNING
                variant_id,
                inventory_quantity,
                reserved_quantity,
                version,
                last_modified
            "#,
        )
        .bind(variant_id.as_uuid())
        .bind(expected_version)
        .bind(to_i32(reserved_quantity)?)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_reserved", e))?;

        match row {
            Some(row) => stock_from_row(&row),
            None => match self.load_variant(variant_id).await? {
                Some(current) => Err(StoreError::Conflict(format!(
                    "variant {variant_id}: expected {expected:?}, found {}",
                    current.version
                ))),
                None => Err(StoreError::NotFound(format!("variant {variant_id}"))),
            },
        }
    }
}

#[async_trait::async_trait]
impl StockStore for PostgresStockStore {
    async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError> {
        self.load_variant(variant_id).await
    }

    async fn compare_and_set_reserved(
        &self,
        variant_id: VariantId,
        expected: ExpectedVersion,
        reserved_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError> {
        self.set_reserved(variant_id, expected, reserved_quantity, at)
            .await
    }
}

/// Postgres-backed cart line store.
#[derive(Debug, Clone)]
pub struct PostgresCartLineStore {
    pool: Arc<PgPool>,
}

const CART_LINE_COLUMNS: &str =
    "id, cart_id, variant_id, quantity, reserved_until, pending_release, added_at, updated_at";

impl PostgresCartLineStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_lines(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<CartLine>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(line_from_row).collect()
    }
}

#[async_trait::async_trait]
impl CartLineStore for PostgresCartLineStore {
    async fn get(&self, line_id: CartLineId) -> Result<Option<CartLine>, StoreError> {
        let sql = format!("SELECT {CART_LINE_COLUMNS} FROM cart_lines WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(line_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_cart_line", e))?;
        row.as_ref().map(line_from_row).transpose()
    }

    async fn find(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
    ) -> Result<Option<CartLine>, StoreError> {
        let sql = format!(
            "SELECT {CART_LINE_COLUMNS} FROM cart_lines WHERE cart_id = $1 AND variant_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(cart_id.as_uuid())
            .bind(variant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_cart_line", e))?;
        row.as_ref().map(line_from_row).transpose()
    }

    async fn list_for_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        let sql = format!(
            "SELECT {CART_LINE_COLUMNS} FROM cart_lines WHERE cart_id = $1 ORDER BY added_at ASC"
        );
        self.fetch_lines("list_cart_lines", sqlx::query(&sql).bind(*cart_id.as_uuid()))
            .await
    }

    #[instrument(skip(self, line), fields(line_id = %line.id, variant_id = %line.variant_id), err)]
    async fn insert(&self, line: CartLine) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cart_lines (
                id,
                cart_id,
                variant_id,
                quantity,
                reserved_until,
                pending_release,
                added_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(line.id.as_uuid())
        .bind(line.cart_id.as_uuid())
        .bind(line.variant_id.as_uuid())
        .bind(to_i32(line.quantity)?)
        .bind(line.reserved_until)
        .bind(to_i32(line.pending_release)?)
        .bind(line.added_at)
        .bind(line.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_cart_line", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(line_id = %line_id), err)]
    async fn update_hold(
        &self,
        line_id: CartLineId,
        expected_until: Option<DateTime<Utc>>,
        quantity: u32,
        reserved_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cart_lines
            SET
                quantity = $3,
                reserved_until = $4,
                updated_at = $5
            WHERE id = $1
                AND reserved_until IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(line_id.as_uuid())
        .bind(expected_until)
        .bind(to_i32(quantity)?)
        .bind(reserved_until)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_hold", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(line_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("cart line {line_id}"))),
        }
    }

    #[instrument(skip(self), fields(line_id = %line_id), err)]
    async fn add_pending_release(
        &self,
        line_id: CartLineId,
        units: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cart_lines
            SET
                pending_release = pending_release + $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(line_id.as_uuid())
        .bind(to_i32(units)?)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_pending_release", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("cart line {line_id}")));
        }
        Ok(())
    }

    /// Zero the counter and return the previous value in one statement; the
    /// row lock taken by the subquery serializes concurrent takers.
    #[instrument(skip(self), fields(line_id = %line_id), err)]
    async fn take_pending_release(
        &self,
        line_id: CartLineId,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE cart_lines AS line
            SET
                pending_release = 0,
                updated_at = CASE WHEN prev.pending_release > 0 THEN $2 ELSE line.updated_at END
            FROM (
                SELECT id, pending_release
                FROM cart_lines
                WHERE id = $1
                FOR UPDATE
            ) AS prev
            WHERE line.id = prev.id
            RETURNING prev.pending_release
            "#,
        )
        .bind(line_id.as_uuid())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("take_pending_release", e))?;

        match row {
            Some(row) => {
                let taken: i32 = row
                    .try_get("pending_release")
                    .map_err(|e| StoreError::Invalid(format!("failed to decode pending_release: {e}")))?;
                to_u32(taken)
            }
            None => Err(StoreError::NotFound(format!("cart line {line_id}"))),
        }
    }

    #[instrument(skip(self), fields(line_id = %line_id), err)]
    async fn delete_released(&self, line_id: CartLineId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cart_lines
            WHERE id = $1
                AND reserved_until IS NULL
                AND pending_release = 0
            "#,
        )
        .bind(line_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_cart_line", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(line_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("cart line {line_id}"))),
        }
    }

    #[instrument(skip(self), fields(line_count), err)]
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CartLine>, StoreError> {
        let sql = format!(
            "SELECT {CART_LINE_COLUMNS} FROM cart_lines \
             WHERE reserved_until < $1 OR pending_release > 0 \
             ORDER BY pending_release = 0, reserved_until ASC \
             LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let lines = self
            .fetch_lines("list_expired", sqlx::query(&sql).bind(now).bind(limit))
            .await?;
        Span::current().record("line_count", lines.len());
        Ok(lines)
    }
}

fn stock_from_row(row: &sqlx::postgres::PgRow) -> Result<VariantStock, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Invalid(format!("failed to decode variant_stock row: {e}"));
    let variant_id: uuid::Uuid = row.try_get("variant_id").map_err(decode)?;
    let inventory: i32 = row.try_get("inventory_quantity").map_err(decode)?;
    let reserved: i32 = row.try_get("reserved_quantity").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let last_modified: DateTime<Utc> = row.try_get("last_modified").map_err(decode)?;

    Ok(VariantStock {
        variant_id: VariantId::from_uuid(variant_id),
        inventory_quantity: to_u32(inventory)?,
        reserved_quantity: to_u32(reserved)?,
        version: u64::try_from(version)
            .map_err(|_| StoreError::Invalid(format!("negative version {version}")))?,
        last_modified,
    })
}

fn line_from_row(row: &sqlx::postgres::PgRow) -> Result<CartLine, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Invalid(format!("failed to decode cart_lines row: {e}"));
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let cart_id: uuid::Uuid = row.try_get("cart_id").map_err(decode)?;
    let variant_id: uuid::Uuid = row.try_get("variant_id").map_err(decode)?;
    let quantity: i32 = row.try_get("quantity").map_err(decode)?;
    let pending_release: i32 = row.try_get("pending_release").map_err(decode)?;

    Ok(CartLine {
        id: CartLineId::from_uuid(id),
        cart_id: CartId::from_uuid(cart_id),
        variant_id: VariantId::from_uuid(variant_id),
        quantity: to_u32(quantity)?,
        reserved_until: row.try_get("reserved_until").map_err(decode)?,
        pending_release: to_u32(pending_release)?,
        added_at: row.try_get("added_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn to_u32(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("negative quantity {value}")))
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Invalid(format!("quantity {value} out of range")))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("version {value} out of range")))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("23514") => StoreError::Invalid(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
