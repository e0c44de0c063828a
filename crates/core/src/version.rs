//! Version tokens for compare-and-swap commits.

/// The version a writer read before changing a record.
///
/// Stores commit only while the stored version still matches; a writer that
/// lost the race must re-read and try again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Commit regardless of the stored version.
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, stored: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_only_matches_itself() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert!(ExpectedVersion::Any.matches(42));
    }
}
