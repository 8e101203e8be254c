//! Reservation configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | none |
//! | `RESERVATION_HOLD_SECS` | `900` |
//! | `SWEEP_INTERVAL_SECS` | `300` |
//! | `SWEEP_BATCH_SIZE` | `500` |
//! | `RESERVE_MAX_ATTEMPTS` | `3` |
//! | `RESERVE_RETRY_BASE_MS` | `50` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use storefront_inventory::{HoldPolicy, DEFAULT_HOLD_MINUTES};

use crate::ledger::{LedgerConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Postgres connection URL. Only the sweeper binary requires it.
    pub database_url: Option<String>,
    /// How long a reservation is held, in seconds
    pub hold_secs: u64,
    /// Seconds between sweep passes
    pub sweep_interval_secs: u64,
    /// Expired lines fetched per scan batch
    pub sweep_batch_size: usize,
    /// Total attempts of an optimistic write
    pub max_attempts: u32,
    /// Linear backoff base, in milliseconds
    pub retry_base_ms: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            hold_secs: (DEFAULT_HOLD_MINUTES * 60) as u64,
            sweep_interval_secs: 300,
            sweep_batch_size: 500,
            max_attempts: 3,
            retry_base_ms: 50,
        }
    }
}

impl ReservationConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            hold_secs: parse_or(&lookup, "RESERVATION_HOLD_SECS", defaults.hold_secs),
            sweep_interval_secs: parse_or(
                &lookup,
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            sweep_batch_size: parse_or(&lookup, "SWEEP_BATCH_SIZE", defaults.sweep_batch_size),
            max_attempts: parse_or(&lookup, "RESERVE_MAX_ATTEMPTS", defaults.max_attempts),
            retry_base_ms: parse_or(&lookup, "RESERVE_RETRY_BASE_MS", defaults.retry_base_ms),
        }
    }

    pub fn hold_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.hold_secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            hold: HoldPolicy::new(self.hold_duration()),
            retry: RetryPolicy::linear(
                self.max_attempts.max(1),
                Duration::from_millis(self.retry_base_ms),
            ),
            sweep_batch_size: self.sweep_batch_size.max(1),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "invalid configuration value, using default");
                default
            }
        },
    }
}
