use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use storefront_core::{Entity, VariantId, Versioned};

/// How a signed delta is applied to `reserved_quantity`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaMode {
    /// A reservation: an increase must fit in the available units.
    Strict,
    /// Cleanup: never rejected, floor-clamped at zero.
    Release,
}

/// Stock arithmetic failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u32, available: u32 },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// Signed delta of a new reservation of `quantity` units.
///
/// Reserving nothing is rejected: a zero-unit hold would create a cart line
/// that counts against no stock.
pub fn reservation_delta(quantity: u32) -> Result<i64, StockError> {
    if quantity == 0 {
        return Err(StockError::InvalidQuantity(
            "reservation quantity must be positive".to_string(),
        ));
    }
    Ok(i64::from(quantity))
}

/// Stock counters of one sellable variant.
///
/// `inventory_quantity` is owned by inventory management; reservations only
/// ever move `reserved_quantity`. Every committed write advances `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStock {
    pub variant_id: VariantId,
    pub inventory_quantity: u32,
    pub reserved_quantity: u32,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

impl VariantStock {
    /// A freshly stocked variant with nothing reserved.
    pub fn new(variant_id: VariantId, inventory_quantity: u32, at: DateTime<Utc>) -> Self {
        Self {
            variant_id,
            inventory_quantity,
            reserved_quantity: 0,
            version: 0,
            last_modified: at,
        }
    }

    /// Units a new reservation may still claim.
    ///
    /// Saturates at zero when inventory was shrunk externally below what is
    /// already promised.
    pub fn available(&self) -> u32 {
        self.inventory_quantity.saturating_sub(self.reserved_quantity)
    }

    /// Compute the `reserved_quantity` that applying `delta` would produce.
    ///
    /// - `Strict`: a positive delta that would push reserved above inventory is
    ///   rejected with the currently available quantity. Nothing is mutated.
    /// - `Release`: always succeeds, clamped to `0..=u32::MAX`.
    ///
    /// A negative delta in `Strict` mode behaves like a release.
    pub fn plan_reserved(&self, delta: i64, mode: DeltaMode) -> Result<u32, StockError> {
        let candidate = i64::from(self.reserved_quantity) + delta;

        if mode == DeltaMode::Strict
            && delta > 0
            && i64::from(self.inventory_quantity) - candidate < 0
        {
            return Err(StockError::InsufficientStock {
                requested: u32::try_from(delta).unwrap_or(u32::MAX),
                available: self.available(),
            });
        }

        Ok(candidate.clamp(0, i64::from(u32::MAX)) as u32)
    }

    /// The record as it looks after committing `reserved_quantity` at `at`.
    pub fn with_reserved(&self, reserved_quantity: u32, at: DateTime<Utc>) -> Self {
        Self {
            variant_id: self.variant_id,
            inventory_quantity: self.inventory_quantity,
            reserved_quantity,
            version: self.version + 1,
            last_modified: at,
        }
    }
}

impl Entity for VariantStock {
    type Id = VariantId;

    fn id(&self) -> &Self::Id {
        &self.variant_id
    }
}

impl Versioned for VariantStock {
    fn version(&self) -> u64 {
        self.version
    }
}
