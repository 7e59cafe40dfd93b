//! System-wide constants for the sptree crates.

// =============================================================================
// Page Geometry
// =============================================================================

/// Default page size in bytes (8 KB).
pub const DEFAULT_PAGE_SIZE: usize = 8 * 1024;

/// Minimum page size in bytes (4 KB).
pub const MIN_PAGE_SIZE: usize = 4 * 1024;

/// Maximum page size in bytes (32 KB).
///
/// In-page offsets are 16 bits wide, so the upper bound of the item area
/// must stay representable.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one line pointer in the slot directory.
///
/// Each slot contains: offset (2), length (2) = 4 bytes.
pub const ITEM_ID_SIZE: usize = 4;

// =============================================================================
// Index Tuning
// =============================================================================

/// Default fill factor for index pages, in percent.
pub const DEFAULT_FILL_FACTOR: u8 = 80;

/// Smallest fill factor accepted by the index.
pub const MIN_FILL_FACTOR: u8 = 10;

/// Upper bound on the number of tuples a leaf chain may hold before a
/// whole-chain relocation is no longer considered.
pub const DEFAULT_MOVE_CHAIN_MAX_TUPLES: usize = 64;

/// Number of child nodes forced onto an inner tuple when a partitioning
/// strategy fails to separate its inputs.
pub const ALL_THE_SAME_FANOUT: usize = 8;
