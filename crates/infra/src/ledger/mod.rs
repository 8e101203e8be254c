//! Inventory reservation ledger.
//!
//! Tracks, per variant, how many units are promised to open carts. Every
//! mutation goes through [`ReservationLedger::apply_delta`]: read the record and
//! its version, compute the new `reserved_quantity` with the pure stock rules,
//! then write conditionally on the version being unchanged. Lost races are
//! retried a bounded number of times and surface as `ConcurrencyConflict`,
//! never as silently lost updates.
//!
//! The ledger holds no in-process locks; any number of request tasks and the
//! expiry sweeper can share one instance (it is cheap to clone).

pub mod error;
pub mod retry;

pub use error::LedgerError;
pub use retry::{BackoffStrategy, RetryPolicy};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use storefront_core::{CartLineId, Clock, ExpectedVersion, SystemClock, VariantId};
use storefront_inventory::{reservation_delta, CartLine, DeltaMode, HoldPolicy, VariantStock};

use crate::store::{CartLineStore, StockStore, StoreError};

/// Ledger tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub hold: HoldPolicy,
    pub retry: RetryPolicy,
    /// Expired lines fetched per scan batch during a sweep.
    pub sweep_batch_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            hold: HoldPolicy::default(),
            retry: RetryPolicy::default(),
            sweep_batch_size: 500,
        }
    }
}

/// A successful reservation or adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub variant_id: VariantId,
    /// Units the caller's cart line now holds.
    pub quantity: u32,
    pub reserved_until: DateTime<Utc>,
    /// Variant counters as committed (or read, for a zero delta).
    pub stock: VariantStock,
}

/// A cart line the sweep could not reclaim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub line_id: CartLineId,
    pub variant_id: VariantId,
    pub error: String,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Lines examined.
    pub scanned: usize,
    pub released_lines: usize,
    pub released_units: u64,
    /// Lines a cart changed or removed before the sweep could claim them.
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

/// Reservation ledger over a stock store and a cart line store.
#[derive(Clone)]
pub struct ReservationLedger<S, L> {
    stock: S,
    lines: L,
    clock: Arc<dyn Clock>,
    config: Arc<LedgerConfig>,
}

impl<S, L> ReservationLedger<S, L>
where
    S: StockStore,
    L: CartLineStore,
{
    pub fn new(stock: S, lines: L) -> Self {
        Self {
            stock,
            lines,
            clock: Arc::new(SystemClock),
            config: Arc::new(LedgerConfig::default()),
        }
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn cart_lines(&self) -> &L {
        &self.lines
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current counters of a variant (the catalog's stock read).
    pub async fn stock_level(&self, variant_id: VariantId) -> Result<VariantStock, LedgerError> {
        self.stock
            .load(variant_id)
            .await
            .map_err(|e| LedgerError::from_store(variant_id, e))?
            .ok_or(LedgerError::NotFound(variant_id))
    }

    /// Apply a signed delta to `reserved_quantity` without lost updates.
    ///
    /// `Strict` rejects an increase beyond the available units with
    /// `InsufficientStock` and writes nothing. `Release` never fails on stock
    /// grounds and clamps at zero. A version conflict re-runs the whole
    /// read-compute-write cycle, up to `retry.max_attempts` times.
    pub async fn apply_delta(
        &self,
        variant_id: VariantId,
        delta: i64,
        mode: DeltaMode,
    ) -> Result<VariantStock, LedgerError> {
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let current = self.stock_level(variant_id).await?;
            let next = current
                .plan_reserved(delta, mode)
                .map_err(|e| LedgerError::from_stock(variant_id, e))?;

            if next == current.reserved_quantity {
                return Ok(current);
            }

            let now = self.clock.now();
            match self
                .stock
                .compare_and_set_reserved(variant_id, ExpectedVersion::of(&current), next, now)
                .await
            {
                Ok(committed) => {
                    debug!(
                        variant_id = %variant_id,
                        delta,
                        ?mode,
                        attempt,
                        reserved = committed.reserved_quantity,
                        available = committed.available(),
                        "reserved quantity committed"
                    );
                    return Ok(committed);
                }
                Err(StoreError::Conflict(reason)) => {
                    if !retry.should_retry(attempt) {
                        warn!(
                            variant_id = %variant_id,
                            delta,
                            attempts = attempt,
                            reason = %reason,
                            "optimistic retries exhausted"
                        );
                        return Err(LedgerError::ConcurrencyConflict {
                            variant_id,
                            attempts: attempt,
                        });
                    }

                    let delay = retry.delay_for_attempt(attempt, now.timestamp_subsec_nanos());
                    debug!(
                        variant_id = %variant_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(LedgerError::from_store(variant_id, e)),
            }
        }
    }

    /// Reserve `quantity` units for a new cart line.
    ///
    /// On `InsufficientStock` the caller must not create the line.
    pub async fn reserve(
        &self,
        variant_id: VariantId,
        quantity: u32,
        hold_duration: Duration,
    ) -> Result<Hold, LedgerError> {
        let delta = reservation_delta(quantity).map_err(|e| LedgerError::from_stock(variant_id, e))?;
        let stock = self.apply_delta(variant_id, delta, DeltaMode::Strict).await?;

        Ok(Hold {
            variant_id,
            quantity,
            reserved_until: HoldPolicy::new(hold_duration).expiry_from(self.clock.now()),
            stock,
        })
    }

    /// [`reserve`](Self::reserve) with the configured hold.
    pub async fn reserve_default(
        &self,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Hold, LedgerError> {
        self.reserve(variant_id, quantity, self.config.hold.hold_duration)
            .await
    }

    /// Move a cart line's hold from `old_quantity` to `new_quantity`.
    ///
    /// Growth is strict, shrinkage is a release. Either way the returned hold
    /// expires `hold_duration` from now.
    pub async fn adjust(
        &self,
        variant_id: VariantId,
        old_quantity: u32,
        new_quantity: u32,
        hold_duration: Duration,
    ) -> Result<Hold, LedgerError> {
        let delta = i64::from(new_quantity) - i64::from(old_quantity);
        let mode = if delta > 0 {
            DeltaMode::Strict
        } else {
            DeltaMode::Release
        };

        let stock = self.apply_delta(variant_id, delta, mode).await?;

        Ok(Hold {
            variant_id,
            quantity: new_quantity,
            reserved_until: HoldPolicy::new(hold_duration).expiry_from(self.clock.now()),
            stock,
        })
    }

    /// [`adjust`](Self::adjust) with the configured hold.
    pub async fn adjust_default(
        &self,
        variant_id: VariantId,
        old_quantity: u32,
        new_quantity: u32,
    ) -> Result<Hold, LedgerError> {
        self.adjust(
            variant_id,
            old_quantity,
            new_quantity,
            self.config.hold.hold_duration,
        )
        .await
    }

    /// Give back `quantity` units. Safe to repeat: the counter floors at zero.
    pub async fn release(
        &self,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<VariantStock, LedgerError> {
        self.apply_delta(variant_id, -i64::from(quantity), DeltaMode::Release)
            .await
    }

    /// Release `units` a caller just took out of a cart line's hold.
    ///
    /// If the release does not commit, the units are parked on the line as a
    /// pending release so the next sweep gives them back, and the release
    /// error is returned.
    pub async fn release_from_line(
        &self,
        line_id: CartLineId,
        variant_id: VariantId,
        units: u32,
    ) -> Result<(), LedgerError> {
        if units == 0 {
            return Ok(());
        }

        let err = match self.release(variant_id, units).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        warn!(line_id = %line_id, variant_id = %variant_id, units, error = %err, "release failed, parking units on the cart line");
        if let Err(park_err) = self
            .lines
            .add_pending_release(line_id, units, self.clock.now())
            .await
        {
            error!(
                line_id = %line_id,
                variant_id = %variant_id,
                units,
                error = %park_err,
                "could not park pending release; units stay reserved"
            );
        }
        Err(err)
    }

    /// Reclaim every hold that expired before now, and every pending release
    /// a failed earlier release left on a cart line.
    ///
    /// Only a failure to list lines fails the pass; per-line failures are
    /// logged and collected in the report.
    pub async fn sweep_expired(&self) -> Result<SweepReport, LedgerError> {
        let now = self.clock.now();
        let batch_size = self.config.sweep_batch_size.max(1);
        let mut report = SweepReport::default();
        let mut seen: HashSet<CartLineId> = HashSet::new();

        loop {
            let batch = self
                .lines
                .list_expired(now, batch_size)
                .await
                .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;

            let fetched = batch.len();
            let mut fresh = 0;
            for line in batch {
                if !seen.insert(line.id) {
                    continue;
                }
                fresh += 1;
                report.scanned += 1;
                self.reclaim(line, now, &mut report).await;
            }

            // Failed lines are parked as pending and reappear at the head of
            // the next batch; stop once a batch brings nothing new.
            if fetched < batch_size || fresh == 0 {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                released_lines = report.released_lines,
                released_units = report.released_units,
                skipped = report.skipped,
                failures = report.failures.len(),
                "expired reservations swept"
            );
        }

        Ok(report)
    }

    /// Claim what one line owes, then release it.
    ///
    /// An expired hold is claimed by clearing its marker conditionally, a
    /// pending release by taking the counter. Only units this pass claimed are
    /// released, so a line refreshed by its cart is left alone.
    async fn reclaim(&self, line: CartLine, now: DateTime<Utc>, report: &mut SweepReport) {
        let mut units = 0u32;

        if let Some(until) = line.reserved_until.filter(|_| line.is_hold_expired(now)) {
            match self
                .lines
                .update_hold(line.id, Some(until), line.quantity, None, now)
                .await
            {
                Ok(true) => units += line.quantity,
                Ok(false) => {
                    debug!(line_id = %line.id, "cart line changed before sweep claim");
                }
                Err(StoreError::NotFound(_)) => {
                    report.skipped += 1;
                    return;
                }
                Err(e) => {
                    warn!(line_id = %line.id, variant_id = %line.variant_id, error = %e, "failed to claim expired cart line");
                    report.failures.push(SweepFailure {
                        line_id: line.id,
                        variant_id: line.variant_id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }

        if line.pending_release > 0 {
            match self.lines.take_pending_release(line.id, now).await {
                Ok(taken) => units = units.saturating_add(taken),
                // Removed by its cart after settling.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(line_id = %line.id, variant_id = %line.variant_id, error = %e, "failed to take pending release");
                    report.failures.push(SweepFailure {
                        line_id: line.id,
                        variant_id: line.variant_id,
                        error: e.to_string(),
                    });
                    if units == 0 {
                        return;
                    }
                }
            }
        }

        if units == 0 {
            debug!(line_id = %line.id, "nothing left to reclaim, skipping");
            report.skipped += 1;
            return;
        }

        match self.release_from_line(line.id, line.variant_id, units).await {
            Ok(()) => {
                report.released_lines += 1;
                report.released_units += u64::from(units);
            }
            Err(e) => report.failures.push(SweepFailure {
                line_id: line.id,
                variant_id: line.variant_id,
                error: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use storefront_core::{CartId, ManualClock};

    use crate::store::{InMemoryCartLineStore, InMemoryStockStore};

    type TestLedger = ReservationLedger<Arc<InMemoryStockStore>, Arc<InMemoryCartLineStore>>;

    struct Fixture {
        ledger: TestLedger,
        stock: Arc<InMemoryStockStore>,
        lines: Arc<InMemoryCartLineStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let stock = Arc::new(InMemoryStockStore::new());
        let lines = Arc::new(InMemoryCartLineStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ReservationLedger::new(stock.clone(), lines.clone()).with_clock(clock.clone());
        Fixture {
            ledger,
            stock,
            lines,
            clock,
        }
    }

    fn seed(store: &InMemoryStockStore, inventory: u32, reserved: u32) -> VariantId {
        let stock = VariantStock {
            reserved_quantity: reserved,
            ..VariantStock::new(VariantId::new(), inventory, Utc::now())
        };
        let id = stock.variant_id;
        store.put(stock).unwrap();
        id
    }

    fn fifteen_minutes() -> Duration {
        Duration::minutes(15)
    }

    #[tokio::test]
    async fn reserve_within_available() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 3);

        let hold = f.ledger.reserve(variant, 2, fifteen_minutes()).await.unwrap();

        assert_eq!(hold.stock.reserved_quantity, 5);
        assert_eq!(hold.reserved_until, f.clock.now() + fifteen_minutes());
        assert_eq!(f.stock.snapshot(variant).unwrap().reserved_quantity, 5);
    }

    #[tokio::test]
    async fn adjust_up_to_exactly_available() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 5);

        let hold = f.ledger.adjust(variant, 2, 5, fifteen_minutes()).await.unwrap();

        assert_eq!(hold.quantity, 5);
        assert_eq!(hold.stock.reserved_quantity, 8);
    }

    #[tokio::test]
    async fn adjust_beyond_available_is_rejected_without_write() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 5);
        let before = f.stock.snapshot(variant).unwrap();

        let err = f
            .ledger
            .adjust(variant, 2, 20, fifteen_minutes())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                variant_id: variant,
                requested: 18,
                available: 5
            }
        );
        assert_eq!(f.stock.snapshot(variant).unwrap(), before);
    }

    #[tokio::test]
    async fn adjust_down_releases_and_refreshes_hold() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 6);
        f.clock.advance(Duration::minutes(7));

        let hold = f.ledger.adjust_default(variant, 4, 1).await.unwrap();

        assert_eq!(hold.stock.reserved_quantity, 3);
        assert_eq!(hold.reserved_until, f.clock.now() + fifteen_minutes());
    }

    #[tokio::test]
    async fn unchanged_quantity_refreshes_hold_without_write() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 2);
        let before = f.stock.snapshot(variant).unwrap();

        let hold = f.ledger.adjust_default(variant, 2, 2).await.unwrap();

        assert_eq!(hold.stock, before);
        assert_eq!(hold.reserved_until, f.clock.now() + fifteen_minutes());
    }

    #[tokio::test]
    async fn release_is_idempotent_at_zero() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 3);

        assert_eq!(f.ledger.release(variant, 3).await.unwrap().reserved_quantity, 0);
        assert_eq!(f.ledger.release(variant, 3).await.unwrap().reserved_quantity, 0);
        // The second release wrote nothing.
        assert_eq!(f.stock.snapshot(variant).unwrap().version, 1);
    }

    #[tokio::test]
    async fn reserve_missing_variant_is_not_found() {
        let f = fixture();
        let variant = VariantId::new();
        let err = f.ledger.reserve_default(variant, 1).await.unwrap_err();
        assert_eq!(err, LedgerError::NotFound(variant));
    }

    #[tokio::test]
    async fn reserve_zero_is_invalid() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 0);
        let err = f.ledger.reserve_default(variant, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidQuantity(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn competing_reservations_never_both_win() {
        let f = fixture();
        let variant = seed(&f.stock, 5, 0);

        let a = {
            let ledger = f.ledger.clone();
            tokio::spawn(async move { ledger.reserve_default(variant, 3).await })
        };
        let b = {
            let ledger = f.ledger.clone();
            tokio::spawn(async move { ledger.reserve_default(variant, 3).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loss = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        match loss {
            LedgerError::InsufficientStock { available, .. } => {
                assert!(*available == 5 || *available == 2, "available {available}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.stock.snapshot(variant).unwrap().reserved_quantity, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contended_reservations_never_oversell() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 0);
        // Each loser conflicts at most once per commit, and there are at most
        // 10 commits, so 16 attempts can never be exhausted.
        let ledger = f.ledger.clone().with_config(LedgerConfig {
            retry: RetryPolicy::fixed(16, std::time::Duration::from_millis(1)),
            ..LedgerConfig::default()
        });

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger.reserve_default(variant, 1).await
            }));
        }

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(LedgerError::InsufficientStock { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let stock = f.stock.snapshot(variant).unwrap();
        assert_eq!(wins, 10);
        assert_eq!(stock.reserved_quantity, 10);
        assert_eq!(stock.available(), 0);
    }

    /// Stock store whose conditional writes lose the first `conflicts` races.
    struct Contended {
        inner: InMemoryStockStore,
        conflicts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl StockStore for Contended {
        async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError> {
            self.inner.load(variant_id).await
        }

        async fn compare_and_set_reserved(
            &self,
            variant_id: VariantId,
            expected: ExpectedVersion,
            reserved_quantity: u32,
            at: DateTime<Utc>,
        ) -> Result<VariantStock, StoreError> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("simulated".to_string()));
            }
            self.inner
                .compare_and_set_reserved(variant_id, expected, reserved_quantity, at)
                .await
        }
    }

    fn contended(conflicts: u32) -> (ReservationLedger<Arc<Contended>, Arc<InMemoryCartLineStore>>, VariantId) {
        let store = Arc::new(Contended {
            inner: InMemoryStockStore::new(),
            conflicts: AtomicU32::new(conflicts),
        });
        let variant = seed(&store.inner, 10, 0);
        let ledger = ReservationLedger::new(store, Arc::new(InMemoryCartLineStore::new()))
            .with_config(LedgerConfig {
                retry: RetryPolicy::fixed(3, std::time::Duration::from_millis(1)),
                ..LedgerConfig::default()
            });
        (ledger, variant)
    }

    #[tokio::test]
    async fn conflict_is_retried() {
        let (ledger, variant) = contended(2);
        let hold = ledger.reserve_default(variant, 4).await.unwrap();
        assert_eq!(hold.stock.reserved_quantity, 4);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_conflict() {
        let (ledger, variant) = contended(u32::MAX);
        let err = ledger.reserve_default(variant, 4).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::ConcurrencyConflict {
                variant_id: variant,
                attempts: 3
            }
        );
        assert!(err.is_recoverable());
    }

    async fn insert_line(
        lines: &InMemoryCartLineStore,
        variant: VariantId,
        quantity: u32,
        until: DateTime<Utc>,
    ) -> CartLineId {
        let line = CartLine::new(CartId::new(), variant, quantity, until, until);
        let id = line.id;
        lines.insert(line).await.unwrap();
        id
    }

    #[tokio::test]
    async fn sweep_releases_only_expired_holds() {
        let f = fixture();
        let now = f.clock.now();
        let variant = seed(&f.stock, 10, 6);
        let expired = insert_line(&f.lines, variant, 4, now - Duration::hours(1)).await;
        let live = insert_line(&f.lines, variant, 2, now + Duration::minutes(10)).await;

        let report = f.ledger.sweep_expired().await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.released_lines, 1);
        assert_eq!(report.released_units, 4);
        assert!(report.failures.is_empty());
        assert_eq!(f.stock.snapshot(variant).unwrap().reserved_quantity, 2);
        assert_eq!(f.lines.get(expired).await.unwrap().unwrap().reserved_until, None);
        assert!(f.lines.get(live).await.unwrap().unwrap().reserved_until.is_some());
        assert_eq!(f.lines.reserved_for_variant(variant), 2);

        // Nothing left to reclaim.
        let again = f.ledger.sweep_expired().await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn sweep_walks_multiple_batches() {
        let f = fixture();
        let now = f.clock.now();
        let variant = seed(&f.stock, 100, 7);
        for minutes in 1..=7 {
            insert_line(&f.lines, variant, 1, now - Duration::minutes(minutes)).await;
        }
        let ledger = f.ledger.clone().with_config(LedgerConfig {
            sweep_batch_size: 3,
            ..LedgerConfig::default()
        });

        let report = ledger.sweep_expired().await.unwrap();

        assert_eq!(report.released_lines, 7);
        assert_eq!(f.stock.snapshot(variant).unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn sweep_failure_is_isolated_and_units_parked() {
        let f = fixture();
        let now = f.clock.now();
        let variant = seed(&f.stock, 10, 3);
        let missing = VariantId::new();
        let orphan = insert_line(&f.lines, missing, 5, now - Duration::minutes(30)).await;
        insert_line(&f.lines, variant, 3, now - Duration::minutes(5)).await;

        let report = f.ledger.sweep_expired().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.released_lines, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].line_id, orphan);
        assert_eq!(report.failures[0].variant_id, missing);
        assert_eq!(f.stock.snapshot(variant).unwrap().reserved_quantity, 0);

        let parked = f.lines.get(orphan).await.unwrap().unwrap();
        assert_eq!(parked.reserved_until, None);
        assert_eq!(parked.pending_release, 5);

        // Retried on every pass, still isolated.
        let again = f.ledger.sweep_expired().await.unwrap();
        assert_eq!(again.scanned, 1);
        assert_eq!(again.failures.len(), 1);
    }

    /// Stock store that can go down, or shrink inventory right before the
    /// next conditional write.
    #[derive(Default)]
    struct Interfering {
        inner: InMemoryStockStore,
        down: AtomicBool,
        shrink_before_write: Mutex<Option<u32>>,
    }

    #[async_trait::async_trait]
    impl StockStore for Interfering {
        async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError> {
            self.inner.load(variant_id).await
        }

        async fn compare_and_set_reserved(
            &self,
            variant_id: VariantId,
            expected: ExpectedVersion,
            reserved_quantity: u32,
            at: DateTime<Utc>,
        ) -> Result<VariantStock, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            let shrink = self.shrink_before_write.lock().unwrap().take();
            if let Some(inventory) = shrink {
                self.inner.set_inventory(variant_id, inventory, at)?;
            }
            self.inner
                .compare_and_set_reserved(variant_id, expected, reserved_quantity, at)
                .await
        }
    }

    struct InterferingFixture {
        ledger: ReservationLedger<Arc<Interfering>, Arc<InMemoryCartLineStore>>,
        store: Arc<Interfering>,
        lines: Arc<InMemoryCartLineStore>,
        clock: Arc<ManualClock>,
        variant: VariantId,
    }

    fn interfering(inventory: u32, reserved: u32) -> InterferingFixture {
        let store = Arc::new(Interfering::default());
        let lines = Arc::new(InMemoryCartLineStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let variant = seed(&store.inner, inventory, reserved);
        let ledger = ReservationLedger::new(store.clone(), lines.clone())
            .with_clock(clock.clone())
            .with_config(LedgerConfig {
                retry: RetryPolicy::fixed(3, std::time::Duration::from_millis(1)),
                ..LedgerConfig::default()
            });
        InterferingFixture {
            ledger,
            store,
            lines,
            clock,
            variant,
        }
    }

    #[tokio::test]
    async fn inventory_shrunk_before_write_is_reread() {
        let f = interfering(10, 2);
        *f.store.shrink_before_write.lock().unwrap() = Some(4);

        let err = f.ledger.reserve_default(f.variant, 3).await.unwrap_err();

        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                variant_id: f.variant,
                requested: 3,
                available: 2
            }
        );
        let record = f.store.inner.snapshot(f.variant).unwrap();
        assert_eq!(record.inventory_quantity, 4);
        assert_eq!(record.reserved_quantity, 2);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn reservation_fitting_shrunk_inventory_commits() {
        let f = interfering(10, 2);
        *f.store.shrink_before_write.lock().unwrap() = Some(6);

        let hold = f.ledger.reserve_default(f.variant, 3).await.unwrap();

        assert_eq!(hold.stock.inventory_quantity, 6);
        assert_eq!(hold.stock.reserved_quantity, 5);
        assert_eq!(hold.stock.version, 2);
        assert_eq!(hold.stock.available(), 1);
    }

    #[tokio::test]
    async fn failed_sweep_release_is_parked_and_retried() {
        let f = interfering(10, 4);
        let now = f.clock.now();
        let line = insert_line(&f.lines, f.variant, 4, now - Duration::hours(1)).await;

        f.store.down.store(true, Ordering::SeqCst);
        let report = f.ledger.sweep_expired().await.unwrap();
        assert_eq!(report.released_lines, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("connection refused"));

        let parked = f.lines.get(line).await.unwrap().unwrap();
        assert_eq!(parked.reserved_until, None);
        assert_eq!(parked.pending_release, 4);
        assert_eq!(f.store.inner.snapshot(f.variant).unwrap().reserved_quantity, 4);
        assert_eq!(f.lines.reserved_for_variant(f.variant), 4);

        // The cart touches the line before the next pass.
        f.store.down.store(false, Ordering::SeqCst);
        f.ledger.reserve_default(f.variant, 2).await.unwrap();
        let until = f.ledger.config().hold.expiry_from(now);
        assert!(f.lines.update_hold(line, None, 2, Some(until), now).await.unwrap());
        assert_eq!(f.store.inner.snapshot(f.variant).unwrap().reserved_quantity, 6);

        let report = f.ledger.sweep_expired().await.unwrap();
        assert_eq!(report.released_units, 4);
        assert!(report.failures.is_empty());

        let settled = f.lines.get(line).await.unwrap().unwrap();
        assert_eq!(settled.pending_release, 0);
        assert_eq!(settled.reserved_until, Some(until));
        assert_eq!(f.store.inner.snapshot(f.variant).unwrap().reserved_quantity, 2);
        assert_eq!(f.lines.reserved_for_variant(f.variant), 2);
    }

    #[tokio::test]
    async fn hold_expires_with_the_clock() {
        let f = fixture();
        let variant = seed(&f.stock, 10, 0);
        let hold = f.ledger.reserve_default(variant, 3).await.unwrap();
        let line = CartLine::new(CartId::new(), variant, 3, hold.reserved_until, f.clock.now());
        f.lines.insert(line).await.unwrap();

        f.clock.advance(Duration::minutes(14));
        assert_eq!(f.ledger.sweep_expired().await.unwrap().released_units, 0);

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.ledger.sweep_expired().await.unwrap().released_units, 3);
        assert_eq!(f.ledger.stock_level(variant).await.unwrap().available(), 10);
    }
}
