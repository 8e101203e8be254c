//! Holds: the reservation quantity + expiry carried by a cart line.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{CartId, CartLineId, Entity, VariantId};

/// Default time a cart may hold stock without being touched.
pub const DEFAULT_HOLD_MINUTES: i64 = 15;

/// Units held for a cart line until an absolute expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub quantity: u32,
    pub reserved_until: DateTime<Utc>,
}

impl Reservation {
    /// A hold is expired once its expiry strictly precedes `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reserved_until < now
    }
}

/// How long a touch to a cart line keeps its stock held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldPolicy {
    pub hold_duration: Duration,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            hold_duration: Duration::minutes(DEFAULT_HOLD_MINUTES),
        }
    }
}

impl HoldPolicy {
    pub fn new(hold_duration: Duration) -> Self {
        Self { hold_duration }
    }

    /// Expiry of a hold refreshed at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.hold_duration
    }
}

/// A line of a shopping cart.
///
/// `reserved_until` is the expiry marker: `Some` while the line holds
/// `quantity` units of the variant, `None` once the hold was swept (the line
/// stays in the cart but no longer counts against stock).
///
/// `pending_release` counts units that left the hold but whose release on the
/// variant counter has not committed yet. They still count against
/// `reserved_quantity` until the sweep gives them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: CartLineId,
    pub cart_id: CartId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub reserved_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_release: u32,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartLine {
    pub fn new(
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
        reserved_until: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CartLineId::new(),
            cart_id,
            variant_id,
            quantity,
            reserved_until: Some(reserved_until),
            pending_release: 0,
            added_at: at,
            updated_at: at,
        }
    }

    /// A line that is in the cart but holds no stock yet.
    pub fn unheld(cart_id: CartId, variant_id: VariantId, quantity: u32, at: DateTime<Utc>) -> Self {
        Self {
            reserved_until: None,
            ..Self::new(cart_id, variant_id, quantity, at, at)
        }
    }

    /// The hold this line currently carries, if any.
    pub fn reservation(&self) -> Option<Reservation> {
        self.reserved_until.map(|reserved_until| Reservation {
            quantity: self.quantity,
            reserved_until,
        })
    }

    /// Units this line counts against the variant's `reserved_quantity`.
    pub fn held_quantity(&self) -> u32 {
        if self.reserved_until.is_some() {
            self.quantity
        } else {
            0
        }
    }

    /// Held units plus units still waiting for their release.
    pub fn reserved_units(&self) -> u32 {
        self.held_quantity().saturating_add(self.pending_release)
    }

    pub fn is_hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.reservation().is_some_and(|r| r.is_expired(now))
    }

    /// Whether the sweep has anything to give back for this line.
    pub fn needs_sweep(&self, now: DateTime<Utc>) -> bool {
        self.is_hold_expired(now) || self.pending_release > 0
    }
}

impl Entity for CartLine {
    type Id = CartLineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
