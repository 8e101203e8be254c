//! Persistence boundary for stock counters and cart-line holds.
//!
//! The ledger only needs three things from storage: a point read of a variant
//! with its version, a version-guarded write of `reserved_quantity`, and a scan
//! of expired holds. Adapters exist for tests/dev (in-memory) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryCartLineStore, InMemoryStockStore};
pub use postgres::{PostgresCartLineStore, PostgresStockStore};
pub use r#trait::{CartLineStore, StockStore, StoreError};
