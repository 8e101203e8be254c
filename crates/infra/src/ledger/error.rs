use thiserror::Error;

use storefront_core::{CartLineId, VariantId};
use storefront_inventory::StockError;

use crate::store::StoreError;

/// Errors surfaced by the reservation ledger to its callers.
///
/// `InsufficientStock`, `ConcurrencyConflict` and `StoreUnavailable` are
/// recoverable: the cart layer reports "not enough stock" / "try again".
/// `NotFound` points at missing catalog data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    #[error("variant {variant_id} still contended after {attempts} attempts")]
    ConcurrencyConflict { variant_id: VariantId, attempts: u32 },

    #[error("variant not found: {0}")]
    NotFound(VariantId),

    #[error("cart line not found: {0}")]
    CartLineNotFound(CartLineId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

impl LedgerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientStock { .. }
                | LedgerError::ConcurrencyConflict { .. }
                | LedgerError::StoreUnavailable(_)
        )
    }

    pub(crate) fn from_stock(variant_id: VariantId, err: StockError) -> Self {
        match err {
            StockError::InsufficientStock {
                requested,
                available,
            } => LedgerError::InsufficientStock {
                variant_id,
                requested,
                available,
            },
            StockError::InvalidQuantity(msg) => LedgerError::InvalidQuantity(msg),
        }
    }

    /// Map a store failure that happened while working on `variant_id`.
    ///
    /// A bare `Conflict` outside the retry loop (e.g. a duplicate cart line)
    /// is reported as contention on that variant after a single attempt.
    pub(crate) fn from_store(variant_id: VariantId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => LedgerError::NotFound(variant_id),
            StoreError::Conflict(_) => LedgerError::ConcurrencyConflict {
                variant_id,
                attempts: 1,
            },
            StoreError::Unavailable(msg) => LedgerError::StoreUnavailable(msg),
            StoreError::Invalid(msg) => LedgerError::StoreUnavailable(format!("rejected: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_errors_keep_available() {
        let variant_id = VariantId::new();
        let err = LedgerError::from_stock(
            variant_id,
            StockError::InsufficientStock {
                requested: 18,
                available: 5,
            },
        );
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                variant_id,
                requested: 18,
                available: 5
            }
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn missing_variant_is_not_recoverable() {
        let variant_id = VariantId::new();
        let err = LedgerError::from_store(variant_id, StoreError::NotFound("x".into()));
        assert_eq!(err, LedgerError::NotFound(variant_id));
        assert!(!err.is_recoverable());
    }
}
