//! Optimistic concurrency primitives.

use crate::error::{DomainError, DomainResult};

/// A record whose state carries a monotonically advancing version marker.
///
/// Every committed write bumps the version by exactly one, so a writer that
/// read version `n` can make its write conditional on the record still being
/// at `n`.
pub trait Versioned {
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a conditional write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (administrative overwrites, seeding).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expect whatever version `record` currently reports.
    pub fn of<V: Versioned + ?Sized>(record: &V) -> Self {
        Self::Exact(record.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
