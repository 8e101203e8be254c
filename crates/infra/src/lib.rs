//! Infrastructure layer: persistence adapters, the reservation ledger and its
//! background sweeper.

pub mod cart_holds;
pub mod config;
pub mod ledger;
pub mod store;
pub mod workers;


pub use cart_holds::CartHolds;
pub use config::ReservationConfig;
pub use ledger::{
    BackoffStrategy, Hold, LedgerConfig, LedgerError, ReservationLedger, RetryPolicy,
    SweepFailure, SweepReport,
};
pub use store::{
    CartLineStore, InMemoryCartLineStore, InMemoryStockStore, PostgresCartLineStore,
    PostgresStockStore, StockStore, StoreError,
};
pub use workers::{ExpirySweeper, SweeperHandle, SweeperStats};
