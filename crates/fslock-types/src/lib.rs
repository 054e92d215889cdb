//! Core types for the fslock hierarchical lock manager.
//!
//! Everything here is plain data: lock modes and their compatibility table,
//! resource identifiers for the two-level Global/Database hierarchy, owner
//! tokens, and the per-resource entries a locker keeps on its stack.

pub mod entry;
pub mod owner;

use std::fmt;
use std::sync::Arc;

pub use entry::LockEntry;
pub use owner::{InvalidOwnerToken, OwnerToken};

// ---------------------------------------------------------------------------
// LockMode
// ---------------------------------------------------------------------------

/// Access level requested on, or held over, a resource.
///
/// Variants are declared in strength order, so `Ord` reads as "at least as
/// strong as": `Shared < Upgradable < Exclusive`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum LockMode {
    /// Many concurrent holders; excluded only by Exclusive.
    Shared,
    /// Coexists with Shared holders; excludes other Upgradable and Exclusive
    /// holders. Can be promoted to Exclusive.
    Upgradable,
    /// Sole holder.
    Exclusive,
}

impl LockMode {
    /// All modes in strength order.
    pub const ALL: [Self; 3] = [Self::Shared, Self::Upgradable, Self::Exclusive];

    /// Whether two *different* owners may hold `self` and `other` at the same
    /// time on the same resource.
    ///
    /// | held \ requested | S | U | X |
    /// |------------------|---|---|---|
    /// | S                | ✓ | ✓ | ✗ |
    /// | U                | ✓ | ✗ | ✗ |
    /// | X                | ✗ | ✗ | ✗ |
    #[inline]
    #[must_use]
    pub const fn is_compatible_with(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::Shared, Self::Shared)
                | (Self::Shared, Self::Upgradable)
                | (Self::Upgradable, Self::Shared)
        )
    }

    /// Whether holding `self` already grants everything `other` grants.
    #[inline]
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        self >= other
    }

    /// Whether this mode lets the holder read (Shared or Upgradable).
    #[inline]
    #[must_use]
    pub const fn is_read_mode(self) -> bool {
        matches!(self, Self::Shared | Self::Upgradable)
    }

    /// Stable lowercase name, used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Upgradable => "upgradable",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResourceId
// ---------------------------------------------------------------------------

/// An addressable lockable entity.
///
/// The hierarchy has exactly two levels: the single [`ResourceId::Global`]
/// instance and any number of named databases below it. Database identity
/// is just the name; the lock behind it is created on first reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResourceId {
    /// The process-wide root resource.
    Global,
    /// A named database below the global resource.
    Database(Arc<str>),
}

/// Discriminant of a [`ResourceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResourceKind {
    Global,
    Database,
}

impl ResourceId {
    /// Database resource for `name`.
    pub fn database(name: impl Into<Arc<str>>) -> Self {
        Self::Database(name.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Global => ResourceKind::Global,
            Self::Database(_) => ResourceKind::Database,
        }
    }

    #[must_use]
    pub const fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Database name, `None` for the global resource.
    #[must_use]
    pub fn database_name(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Database(name) => Some(name),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Database(name) => write!(f, "db:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mode_strategy() -> impl Strategy<Value = LockMode> {
        prop::sample::select(LockMode::ALL.to_vec())
    }

    #[test]
    fn test_compatibility_table() {
        use LockMode::{Exclusive, Shared, Upgradable};

        assert!(Shared.is_compatible_with(Shared));
        assert!(Shared.is_compatible_with(Upgradable));
        assert!(Upgradable.is_compatible_with(Shared));
        assert!(!Upgradable.is_compatible_with(Upgradable));
        for mode in LockMode::ALL {
            assert!(!Exclusive.is_compatible_with(mode));
            assert!(!mode.is_compatible_with(Exclusive));
        }
    }

    #[test]
    fn test_strength_order() {
        assert!(LockMode::Exclusive.covers(LockMode::Shared));
        assert!(LockMode::Exclusive.covers(LockMode::Upgradable));
        assert!(LockMode::Upgradable.covers(LockMode::Shared));
        assert!(!LockMode::Shared.covers(LockMode::Upgradable));
        assert!(LockMode::Shared.is_read_mode());
        assert!(!LockMode::Exclusive.is_read_mode());
    }

    #[test]
    fn test_resource_display_and_kind() {
        assert_eq!(ResourceId::Global.to_string(), "global");
        let db = ResourceId::database("foo");
        assert_eq!(db.to_string(), "db:foo");
        assert_eq!(db.kind(), ResourceKind::Database);
        assert_eq!(db.database_name(), Some("foo"));
        assert!(ResourceId::Global.database_name().is_none());
        assert_eq!(db, ResourceId::database(String::from("foo")));
    }

    #[test]
    fn test_resource_serde() {
        let json = serde_json::to_string(&ResourceId::database("local")).unwrap();
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ResourceId::database("local"));
    }

    proptest! {
        #[test]
        fn prop_compatibility_is_symmetric(a in mode_strategy(), b in mode_strategy()) {
            prop_assert_eq!(a.is_compatible_with(b), b.is_compatible_with(a));
        }

        #[test]
        fn prop_stronger_mode_never_more_compatible(
            a in mode_strategy(),
            b in mode_strategy(),
            other in mode_strategy(),
        ) {
            // If `a` covers `b`, anything compatible with `a` is compatible with `b`.
            if a.covers(b) && a.is_compatible_with(other) {
                prop_assert!(b.is_compatible_with(other));
            }
        }
    }
}
