//! Records addressed by a stable identifier.

/// A record whose identifier outlives every change to its state.
///
/// Stock records and cart lines are entities; stores key them by
/// [`Entity::id`].
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Split into `(id, self)` for insertion into a keyed collection.
    fn keyed(self) -> (Self::Id, Self)
    where
        Self: Sized,
    {
        (self.id().clone(), self)
    }
}
