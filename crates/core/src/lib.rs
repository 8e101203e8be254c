//! `storefront-core`: domain foundation building blocks.
//!
//! Pure primitives shared by the reservation crates: identifiers, the domain
//! error model, optimistic-concurrency expectations, the entity trait and a
//! clock seam. No IO.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{CartId, CartLineId, VariantId};
pub use version::{ExpectedVersion, Versioned};
