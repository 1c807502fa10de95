use std::{
    fmt::{self, Display},
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::constants::FIRST_SID;

static NEXT_SID: AtomicU32 = AtomicU32::new(FIRST_SID);

/// Storage id. Identifies a device or holder across devicegraph snapshots:
/// the same physical object carries the same sid in the probed and the
/// staging graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sid(u32);

impl Sid {
    /// Hands out the next unused sid.
    pub(crate) fn allocate() -> Self {
        Sid(NEXT_SID.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes sure later allocations never return `sid` or anything below it.
    pub(crate) fn reserve(sid: Sid) {
        NEXT_SID.fetch_max(sid.0.saturating_add(1), Ordering::Relaxed);
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
impl From<u32> for Sid {
    fn from(value: u32) -> Self {
        Sid(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_unique() {
        let a = Sid::allocate();
        let b = Sid::allocate();
        assert_ne!(a, b);
        assert!(a.value() >= FIRST_SID);
    }

    #[test]
    fn test_reserve_skips_loaded_sids() {
        Sid::reserve(Sid(1_000_000));
        assert!(Sid::allocate().value() > 1_000_000);

        // Reserving a lower sid never moves the counter back.
        Sid::reserve(Sid(50));
        assert!(Sid::allocate().value() > 1_000_000);
    }
}
