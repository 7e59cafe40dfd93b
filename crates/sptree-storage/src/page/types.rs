//! Page flags.

bitflags::bitflags! {
    /// Page-level flags stored in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u16 {
        /// Index metadata page.
        const META = 0b0000_0001;
        /// Page was deleted and may be reused.
        const DELETED = 0b0000_0010;
        /// Page holds leaf tuples (otherwise inner tuples).
        const LEAF = 0b0000_0100;
        /// Page belongs to the tree for null keys.
        const NULLS = 0b0000_1000;
    }
}

impl PageFlags {
    /// Returns true for leaf pages.
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.contains(Self::LEAF)
    }

    /// Returns true for pages of the nulls tree.
    #[inline]
    pub const fn stores_nulls(self) -> bool {
        self.contains(Self::NULLS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_flags() {
        let flags = PageFlags::LEAF | PageFlags::NULLS;
        assert!(flags.is_leaf());
        assert!(flags.stores_nulls());
        assert!(!PageFlags::empty().is_leaf());
        assert_eq!(PageFlags::from_bits_truncate(flags.bits()), flags);
    }
}
