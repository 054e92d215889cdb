//! Per-(locker, resource) bookkeeping record.

use crate::{LockMode, ResourceId};

/// One resource a locker currently holds.
///
/// Invariant: `recursion >= 1`. An entry exists exactly as long as the owning
/// locker holds at least one reference to `resource`; nested acquisitions
/// bump `recursion` instead of touching the underlying lock again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LockEntry {
    pub resource: ResourceId,
    pub mode: LockMode,
    pub recursion: u32,
}

impl LockEntry {
    /// Fresh entry for a first acquisition.
    #[must_use]
    pub const fn new(resource: ResourceId, mode: LockMode) -> Self {
        Self {
            resource,
            mode,
            recursion: 1,
        }
    }

    /// Whether the entry has been entered more than once.
    #[inline]
    #[must_use]
    pub const fn is_reentrant(&self) -> bool {
        self.recursion > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_not_reentrant() {
        let mut entry = LockEntry::new(ResourceId::Global, LockMode::Shared);
        assert_eq!(entry.recursion, 1);
        assert!(!entry.is_reentrant());
        entry.recursion += 1;
        assert!(entry.is_reentrant());
    }
}
