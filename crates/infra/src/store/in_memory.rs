use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use storefront_core::{CartId, CartLineId, Entity, ExpectedVersion, VariantId};
use storefront_inventory::{CartLine, VariantStock};

use super::r#trait::{CartLineStore, StockStore, StoreError};

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

/// In-memory variant stock store.
///
/// Intended for tests/dev. Each call is atomic on its own (one lock
/// acquisition), which is the same guarantee a single-row SQL statement gives;
/// cross-call coordination is left to the version guard.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    variants: RwLock<HashMap<VariantId, VariantStock>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record verbatim (seeding).
    pub fn put(&self, stock: VariantStock) -> Result<(), StoreError> {
        let mut variants = self.variants.write().map_err(|_| poisoned())?;
        let (id, stock) = stock.keyed();
        variants.insert(id, stock);
        Ok(())
    }

    /// External inventory management: replace the physical unit count.
    ///
    /// Bumps the version so in-flight reservations re-read the new ceiling.
    pub fn set_inventory(
        &self,
        variant_id: VariantId,
        inventory_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError> {
        let mut variants = self.variants.write().map_err(|_| poisoned())?;
        let stock = variants
            .get_mut(&variant_id)
            .ok_or_else(|| StoreError::NotFound(format!("variant {variant_id}")))?;
        stock.inventory_quantity = inventory_quantity;
        stock.version += 1;
        stock.last_modified = at;
        Ok(stock.clone())
    }

    pub fn snapshot(&self, variant_id: VariantId) -> Option<VariantStock> {
        self.variants.read().ok()?.get(&variant_id).cloned()
    }
}

#[async_trait::async_trait]
impl StockStore for InMemoryStockStore {
    async fn load(&self, variant_id: VariantId) -> Result<Option<VariantStock>, StoreError> {
        let variants = self.variants.read().map_err(|_| poisoned())?;
        Ok(variants.get(&variant_id).cloned())
    }

    async fn compare_and_set_reserved(
        &self,
        variant_id: VariantId,
        expected: ExpectedVersion,
        reserved_quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<VariantStock, StoreError> {
        let mut variants = self.variants.write().map_err(|_| poisoned())?;
        let current = variants
            .get(&variant_id)
            .ok_or_else(|| StoreError::NotFound(format!("variant {variant_id}")))?;

        expected
            .check(current.version)
            .map_err(|e| StoreError::Conflict(format!("variant {variant_id}: {e}")))?;

        let committed = current.with_reserved(reserved_quantity, at);
        variants.insert(variant_id, committed.clone());
        Ok(committed)
    }
}

/// In-memory cart line store.
#[derive(Debug, Default)]
pub struct InMemoryCartLineStore {
    lines: RwLock<HashMap<CartLineId, CartLine>>,
}

impl InMemoryCartLineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units every cart line still counts against `variant_id`, held or
    /// pending release.
    pub fn reserved_for_variant(&self, variant_id: VariantId) -> u32 {
        self.lines
            .read()
            .map(|lines| {
                lines
                    .values()
                    .filter(|l| l.variant_id == variant_id)
                    .map(CartLine::reserved_units)
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CartLineStore for InMemoryCartLineStore {
    async fn get(&self, line_id: CartLineId) -> Result<Option<CartLine>, StoreError> {
        let lines = self.lines.read().map_err(|_| poisoned())?;
        Ok(lines.get(&line_id).cloned())
    }

    async fn find(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
    ) -> Result<Option<CartLine>, StoreError> {
        let lines = self.lines.read().map_err(|_| poisoned())?;
        Ok(lines
            .values()
            .find(|l| l.cart_id == cart_id && l.variant_id == variant_id)
            .cloned())
    }

    async fn list_for_cart(&self, cart_id: CartId) -> Result<Vec<CartLine>, StoreError> {
        let lines = self.lines.read().map_err(|_| poisoned())?;
        let mut found: Vec<CartLine> = lines
            .values()
            .filter(|l| l.cart_id == cart_id)
            .cloned()
            .collect();
        found.sort_by_key(|l| l.added_at);
        Ok(found)
    }

    async fn insert(&self, line: CartLine) -> Result<(), StoreError> {
        let mut lines = self.lines.write().map_err(|_| poisoned())?;
        if lines.contains_key(&line.id) {
            return Err(StoreError::Conflict(format!("cart line {} exists", line.id)));
        }
        if lines
            .values()
            .any(|l| l.cart_id == line.cart_id && l.variant_id == line.variant_id)
        {
            return Err(StoreError::Conflict(format!(
                "cart {} already has a line for variant {}",
                line.cart_id, line.variant_id
            )));
        }
        if line.quantity == 0 {
            return Err(StoreError::Invalid("cart line quantity must be positive".to_string()));
        }
        let (id, line) = line.keyed();
        lines.insert(id, line);
        Ok(())
    }

    async fn update_hold(
        &self,
        line_id: CartLineId,
        expected_until: Option<DateTime<Utc>>,
        quantity: u32,
        reserved_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if quantity == 0 {
            return Err(StoreError::Invalid("cart line quantity must be positive".to_string()));
        }
        let mut lines = self.lines.write().map_err(|_| poisoned())?;
        let line = lines
            .get_mut(&line_id)
            .ok_or_else(|| StoreError::NotFound(format!("cart line {line_id}")))?;

        if line.reserved_until != expected_until {
            return Ok(false);
        }

        line.quantity = quantity;
        line.reserved_until = reserved_until;
        line.updated_at = at;
        Ok(true)
    }

    async fn add_pending_release(
        &self,
        line_id: CartLineId,
        units: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut lines = self.lines.write().map_err(|_| poisoned())?;
        let line = lines
            .get_mut(&line_id)
            .ok_or_else(|| StoreError::NotFound(format!("cart line {line_id}")))?;
        line.pending_release = line.pending_release.saturating_add(units);
        line.updated_at = at;
        Ok(())
    }

    async fn take_pending_release(
        &self,
        line_id: CartLineId,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut lines = self.lines.write().map_err(|_| poisoned())?;
        let line = lines
            .get_mut(&line_id)
            .ok_or_else(|| StoreError::NotFound(format!("cart line {line_id}")))?;
        let taken = std::mem::take(&mut line.pending_release);
        if taken > 0 {
            line.updated_at = at;
        }
        Ok(taken)
    }

    async fn delete_released(&self, line_id: CartLineId) -> Result<bool, StoreError> {
        let mut lines = self.lines.write().map_err(|_| poisoned())?;
        let line = lines
            .get(&line_id)
            .ok_or_else(|| StoreError::NotFound(format!("cart line {line_id}")))?;
        if line.reserved_units() > 0 {
            return Ok(false);
        }
        lines.remove(&line_id);
        Ok(true)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CartLine>, StoreError> {
        let lines = self.lines.read().map_err(|_| poisoned())?;
        let mut expired: Vec<CartLine> = lines
            .values()
            .filter(|l| l.needs_sweep(now))
            .cloned()
            .collect();
        expired.sort_by_key(|l| (l.pending_release == 0, l.reserved_until));
        expired.truncate(limit);
        Ok(expired)
    }
}
