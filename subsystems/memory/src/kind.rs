//! Allocation kinds and their policies.

/// What an allocation is used for. The set is closed; behavior differences
/// come from [`MemoryKind::policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryKind {
    /// Program data, write-protected and included in snapshots
    Tracked = 0,
    /// Engine data outside snapshots
    Generic = 1,
    /// Preserved contents of a dirty page
    PageCopy = 2,
}

/// Where the pages of an allocation come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous mappings, recycled through a free region set once the
    /// first snapshot exists
    Mapped,
    /// Single pages from the page copy pool
    PagePool,
}

/// Per-kind policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    /// Write-protected and diffed by snapshots
    pub tracked: bool,
    /// Source of pages
    pub backing: Backing,
    /// Name used in diagnostics
    pub name: &'static str,
}

const POLICIES: [KindPolicy; 3] = [
    KindPolicy {
        tracked: true,
        backing: Backing::Mapped,
        name: "tracked",
    },
    KindPolicy {
        tracked: false,
        backing: Backing::Mapped,
        name: "generic",
    },
    KindPolicy {
        tracked: false,
        backing: Backing::PagePool,
        name: "page-copy",
    },
];

impl MemoryKind {
    /// Policy for this kind.
    #[inline]
    pub const fn policy(self) -> &'static KindPolicy {
        &POLICIES[self as usize]
    }

    /// Whether memory of this kind is snapshotted.
    #[inline]
    pub const fn is_tracked(self) -> bool {
        self.policy().tracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tracked_kind_is_snapshotted() {
        assert!(MemoryKind::Tracked.is_tracked());
        assert!(!MemoryKind::Generic.is_tracked());
        assert!(!MemoryKind::PageCopy.is_tracked());
        assert_eq!(MemoryKind::PageCopy.policy().backing, Backing::PagePool);
        assert_eq!(MemoryKind::Generic.policy().name, "generic");
    }
}
