//! Explicit lock-owner identity.
//!
//! Reentrancy is keyed by an [`OwnerToken`] that the caller carries around,
//! not by the native thread. The same logical operation may therefore hop
//! threads and still be recognized as the holder.

use std::fmt;
use std::num::NonZeroU64;

/// Identity of one logical lock owner.
///
/// Domain: `1..=u64::MAX`. Zero is reserved as "no owner".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct OwnerToken(NonZeroU64);

impl OwnerToken {
    /// Construct an `OwnerToken` if `raw` is non-zero.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.get())
    }
}

/// Error returned when converting zero into an [`OwnerToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOwnerToken;

impl fmt::Display for InvalidOwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("owner token must be non-zero")
    }
}

impl std::error::Error for InvalidOwnerToken {}

impl TryFrom<u64> for OwnerToken {
    type Error = InvalidOwnerToken;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidOwnerToken)
    }
}
