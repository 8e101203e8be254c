//! Background workers.

pub mod sweeper;

pub use sweeper::{ExpirySweeper, SweeperHandle, SweeperStats};
