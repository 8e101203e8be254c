//! Cart hold coordinator.
//!
//! Keeps a cart line and its variant's `reserved_quantity` moving together.
//! Units are added to the ledger before the line write that holds them and
//! released only after the line write that stops holding them. A lost line
//! write is undone with a release, never with a second reservation. A release
//! that cannot commit is parked on the line for the sweep, so every unit in
//! `reserved_quantity` stays accounted for by some cart line.

use tracing::warn;

use storefront_core::{CartId, CartLineId, VariantId};
use storefront_inventory::CartLine;

use crate::ledger::{LedgerError, ReservationLedger};
use crate::store::{CartLineStore, StockStore, StoreError};

#[derive(Clone)]
pub struct CartHolds<S, L> {
    ledger: ReservationLedger<S, L>,
}

impl<S, L> CartHolds<S, L>
where
    S: StockStore,
    L: CartLineStore,
{
    pub fn new(ledger: ReservationLedger<S, L>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &ReservationLedger<S, L> {
        &self.ledger
    }

    /// Put `quantity` units of a variant into a cart.
    ///
    /// A cart that already has a line for the variant gets that line's
    /// quantity raised instead. A new line is written before any stock is
    /// reserved for it and dropped again when the reservation fails.
    pub async fn add_item(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<CartLine, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity(
                "cannot add zero units".to_string(),
            ));
        }

        let lines = self.ledger.cart_lines();
        if let Some(existing) = lines
            .find(cart_id, variant_id)
            .await
            .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?
        {
            let total = existing.quantity.saturating_add(quantity);
            return self.set_hold(existing, total).await;
        }

        let line = CartLine::unheld(cart_id, variant_id, quantity, self.ledger.now());
        let line_id = line.id;
        match lines.insert(line.clone()).await {
            Ok(()) => {}
            // Another request created the line first.
            Err(StoreError::Conflict(_)) => {
                return Err(LedgerError::ConcurrencyConflict {
                    variant_id,
                    attempts: 1,
                });
            }
            Err(e) => return Err(LedgerError::StoreUnavailable(e.to_string())),
        }

        match self.set_hold(line, quantity).await {
            Ok(held) => Ok(held),
            Err(e) => {
                match lines.delete_released(line_id).await {
                    Ok(true) | Err(StoreError::NotFound(_)) => {}
                    Ok(false) => {
                        warn!(line_id = %line_id, "new cart line still carries units, keeping it");
                    }
                    Err(cleanup) => {
                        warn!(line_id = %line_id, error = %cleanup, "could not drop unheld cart line");
                    }
                }
                Err(e)
            }
        }
    }

    /// Set a line's quantity, refreshing its hold.
    ///
    /// Returns `None` when `new_quantity` is zero and the line was removed.
    /// A line the sweep already reclaimed holds nothing, so the full new
    /// quantity is reserved again.
    pub async fn change_quantity(
        &self,
        line_id: CartLineId,
        new_quantity: u32,
    ) -> Result<Option<CartLine>, LedgerError> {
        if new_quantity == 0 {
            self.remove_item(line_id).await?;
            return Ok(None);
        }

        let line = self.load_line(line_id).await?;
        self.set_hold(line, new_quantity).await.map(Some)
    }

    /// Remove a line and give back whatever it still counts against stock.
    ///
    /// The hold is claimed first, the units are released, and only then is
    /// the row deleted. When the release fails the line stays, parked with
    /// its units pending, and the error is returned; calling again finishes
    /// the removal.
    pub async fn remove_item(&self, line_id: CartLineId) -> Result<CartLine, LedgerError> {
        let lines = self.ledger.cart_lines();
        let line = self.load_line(line_id).await?;
        let now = self.ledger.now();

        let mut claimed: u32 = 0;
        if let Some(until) = line.reserved_until {
            let won = lines
                .update_hold(line_id, Some(until), line.quantity, None, now)
                .await
                .map_err(|e| line_error(line_id, e))?;
            if !won {
                return Err(LedgerError::ConcurrencyConflict {
                    variant_id: line.variant_id,
                    attempts: 1,
                });
            }
            claimed = line.quantity;
        }

        let pending = match lines.take_pending_release(line_id, now).await {
            Ok(pending) => pending,
            Err(e) => {
                // Parked on failure; the error below is what the caller sees.
                let _ = self
                    .ledger
                    .release_from_line(line_id, line.variant_id, claimed)
                    .await;
                return Err(line_error(line_id, e));
            }
        };

        self.ledger
            .release_from_line(line_id, line.variant_id, claimed.saturating_add(pending))
            .await?;

        match lines.delete_released(line_id).await {
            Ok(true) | Err(StoreError::NotFound(_)) => Ok(line),
            // Held again by a concurrent quantity change.
            Ok(false) => Err(LedgerError::ConcurrencyConflict {
                variant_id: line.variant_id,
                attempts: 1,
            }),
            Err(e) => Err(line_error(line_id, e)),
        }
    }

    /// Remove every line of a cart.
    ///
    /// Keeps going past a failing line and returns the first error after
    /// the rest were attempted.
    pub async fn clear_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, LedgerError> {
        let lines = self
            .ledger
            .cart_lines()
            .list_for_cart(cart_id)
            .await
            .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;

        let mut removed = Vec::with_capacity(lines.len());
        let mut first_error = None;
        for line in lines {
            match self.remove_item(line.id).await {
                Ok(line) => removed.push(line),
                // Already gone, nothing held.
                Err(LedgerError::CartLineNotFound(_)) => {}
                Err(e) => {
                    warn!(cart_id = %cart_id, line_id = %line.id, error = %e, "failed to remove cart line");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    async fn load_line(&self, line_id: CartLineId) -> Result<CartLine, LedgerError> {
        self.ledger
            .cart_lines()
            .get(line_id)
            .await
            .map_err(|e| line_error(line_id, e))?
            .ok_or(LedgerError::CartLineNotFound(line_id))
    }

    async fn set_hold(&self, line: CartLine, new_quantity: u32) -> Result<CartLine, LedgerError> {
        let held = line.held_quantity();
        if new_quantity > held {
            self.grow_hold(line, held, new_quantity).await
        } else {
            self.shrink_hold(line, held, new_quantity).await
        }
    }

    /// Reserve the extra units strictly, then write the line. A lost write
    /// releases them again.
    async fn grow_hold(
        &self,
        line: CartLine,
        held: u32,
        new_quantity: u32,
    ) -> Result<CartLine, LedgerError> {
        let hold = self
            .ledger
            .adjust_default(line.variant_id, held, new_quantity)
            .await?;
        let now = self.ledger.now();

        let failure = match self
            .ledger
            .cart_lines()
            .update_hold(
                line.id,
                line.reserved_until,
                new_quantity,
                Some(hold.reserved_until),
                now,
            )
            .await
        {
            Ok(true) => {
                return Ok(CartLine {
                    quantity: new_quantity,
                    reserved_until: Some(hold.reserved_until),
                    updated_at: now,
                    ..line
                });
            }
            Ok(false) => LedgerError::ConcurrencyConflict {
                variant_id: line.variant_id,
                attempts: 1,
            },
            Err(e) => line_error(line.id, e),
        };

        warn!(line_id = %line.id, error = %failure, "cart line not updated, releasing new reservation");
        // Parked on failure; the line write error is what the caller sees.
        let _ = self
            .ledger
            .release_from_line(line.id, line.variant_id, new_quantity - held)
            .await;
        Err(failure)
    }

    /// Write the smaller hold first, then release the difference. Nothing is
    /// released unless the line write won.
    async fn shrink_hold(
        &self,
        line: CartLine,
        held: u32,
        new_quantity: u32,
    ) -> Result<CartLine, LedgerError> {
        let now = self.ledger.now();
        let reserved_until = self.ledger.config().hold.expiry_from(now);

        let won = self
            .ledger
            .cart_lines()
            .update_hold(
                line.id,
                line.reserved_until,
                new_quantity,
                Some(reserved_until),
                now,
            )
            .await
            .map_err(|e| line_error(line.id, e))?;
        if !won {
            return Err(LedgerError::ConcurrencyConflict {
                variant_id: line.variant_id,
                attempts: 1,
            });
        }

        // The line is already right; units that fail to release are parked
        // for the sweep.
        if let Err(e) = self
            .ledger
            .release_from_line(line.id, line.variant_id, held - new_quantity)
            .await
        {
            warn!(line_id = %line.id, error = %e, "quantity lowered, release deferred to sweep");
        }

        Ok(CartLine {
            quantity: new_quantity,
            reserved_until: Some(reserved_until),
            updated_at: now,
            ..line
        })
    }
}

fn line_error(line_id: CartLineId, err: StoreError) -> LedgerError {
    match err {
        StoreError::NotFound(_) => LedgerError::CartLineNotFound(line_id),
        other => LedgerError::StoreUnavailable(other.to_string()),
    }
}
