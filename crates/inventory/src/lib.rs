//! Inventory reservation rules.
//!
//! Pure, deterministic domain logic for holding variant stock against open
//! carts (no IO, no async, no storage). The infra crate wraps these rules in
//! optimistic-concurrency writes.

pub mod reservation;
pub mod stock;

pub use reservation::{CartLine, HoldPolicy, Reservation, DEFAULT_HOLD_MINUTES};
pub use stock::{reservation_delta, DeltaMode, StockError, VariantStock};
