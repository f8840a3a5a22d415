//! Optimistic concurrency for job records.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a job record.
///
/// Every persisted update increments the record's version. A writer holding
/// an older version must fail instead of overwriting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (initial inserts, administrative repair).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_rejects_stale_writer() {
        assert!(ExpectedVersion::Exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedVersion::Exact(2).check(3),
            Err(DomainError::Conflict(_))
        ));
        assert!(ExpectedVersion::Any.matches(42));
    }
}
