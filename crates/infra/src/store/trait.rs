use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use storefront_core::{CartId, CartLineId, ExpectedVersion, VariantId};
use storefront_inventory::{CartLine, VariantStock};

/// Storage operation error.
///
/// These are **infrastructure errors** as opposed to stock arithmetic errors:
///
/// - **NotFound**: the addressed row does not exist
/// - **Conflict**: a version guard or uniqueness constraint rejected the write
/// - **Unavailable**: transport/backend failure (pool closed, IO, poisoned lock)
/// - **Invalid**: the backend rejected the data itself (check constraint, bad row)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid data: {0}")]
    Invalid(String),
}

/// Variant stock counters with optimistic concurrency.
///
/// ## Write Semantics
///
/// `compare_and_set_reserved()` is the only mutator the ledger uses:
/// - succeeds only if the record is still at `expected` version
/// - sets `reserved_quantity`, bumps `version` by one and stamps `last_modified`
/// - never touches `inventory_quantity`
/// - returns the committed record
///
/// A version mismatch is `StoreError::Conflict`; a missing row is
/// `StoreError::NotFound`.
#[async_trait::async_trait]
pub trait StockStore: Send + Sync {
    /// Point read of a variant including its version.
    async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError>;

    /// Version-guarded write of `reserved_quantity`.
    async fn compare_and_set_reserved(
        &self,
        variant_id: VariantId,
        expected: ExpectedVersion,
        reserved_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError>;
}

/// Cart lines carrying reservation holds.
///
/// `update_hold()` is conditional on the line's current `reserved_until`
/// equalling `expected_until`. The sweep uses it to claim an expired line and
/// the cart uses it to refresh a hold, so at most one of them wins a race over
/// the same line.
///
/// ## Pending Releases
///
/// Whoever takes units out of a line's hold owns their release. When that
/// release cannot commit, the units are parked with
/// `add_pending_release()`, an unconditional increment that cannot lose a
/// race. `take_pending_release()` zeroes the counter and hands the units to
/// exactly one caller. A line is only deleted once it holds nothing and has
/// nothing pending.
#[async_trait::async_trait]
pub trait CartLineStore: Send + Sync {
    async fn get(&self, line_id: CartLineId) -> Result<Option<CartLine>, StoreError>;

    async fn find(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
    ) -> Result<Option<CartLine>, StoreError>;

    async fn list_for_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError>;

    /// Insert a new line. A second line for the same (cart, variant) pair is a
    /// `StoreError::Conflict`.
    async fn insert(&self, line: CartLine) -> Result<(), StoreError>;

    /// Conditionally replace quantity and hold. Returns `false` when the guard
    /// did not match, `StoreError::NotFound` when the line is gone.
    async fn update_hold(
        &self,
        line_id: CartLineId,
        expected_until: Option<DateTime<Utc>>,
        quantity: u32,
        reserved_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Add `units` to the line's pending release counter.
    async fn add_pending_release(
        &self,
        line_id: CartLineId,
        units: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Zero the line's pending release counter, returning what it held.
    async fn take_pending_release(
        &self,
        line_id: CartLineId,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Delete a line that holds no stock and has no pending release.
    /// Returns `false` when the line still carries units.
    async fn delete_released(&self, line_id: CartLineId) -> Result<bool, StoreError>;

    /// Lines the sweep has work for: holds that expired before `now` and
    /// lines with a pending release. Pending lines come first, then the
    /// oldest expiry.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CartLine>, StoreError>;
}

#[async_trait::async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError> {
        (**self).load(variant_id).await
    }

    async fn compare_and_set_reserved(
        &self,
        variant_id: VariantId,
        expected: ExpectedVersion,
        reserved_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError> {
        (**self)
            .compare_and_set_reserved(variant_id, expected, reserved_quantity, at)
            .await
    }
}

#[async_trait::async_trait]
impl<S> CartLineStore for Arc<S>
where
    S: CartLineStore + ?Sized,
{
    async fn get(&self, line_id: CartLineId) -> Result<Option<CartLine>, StoreError> {
        (**self).get(line_id).await
    }

    async fn find(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
    ) -> Result<Option<CartLine>, StoreError> {
        (**self).find(cart_id, variant_id).await
    }

    async fn list_for_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        (**self).list_for_cart(cart_id).await
    }

    async fn insert(&self, line: CartLine) -> Result<(), StoreError> {
        (**self).insert(line).await
    }

    async fn update_hold(
        &self,
        line_id: CartLineId,
        expected_until: Option<DateTime<Utc>>,
        quantity: u32,
        reserved_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self)
            .update_hold(line_id, expected_until, quantity, reserved_until, at)
            .await
    }

    async fn add_pending_release(
        &self,
        line_id: CartLineId,
        units: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).add_pending_release(line_id, units, at).await
    }

    async fn take_pending_release(
        &self,
        line_id: CartLineId,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        (**self).take_pending_release(line_id, at).await
    }

    async fn delete_released(&self, line_id: CartLineId) -> Result<bool, StoreError> {
        (**self).delete_released(line_id).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CartLine>, StoreError> {
        (**self).list_expired(now, limit).await
    }
}
