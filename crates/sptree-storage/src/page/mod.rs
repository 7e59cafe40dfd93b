//! Page layout for sptree index files.
//!
//! Every page is a fixed-size slotted page. Items are addressed by a
//! 1-based offset into the slot array; once assigned, an offset never
//! moves, so downlinks and chain links stored as offsets stay valid for
//! the life of the page.
//!
//! # Page Format
//!
//! ```text
//! +------------------+
//! |   Page Header    |  32 bytes
//! +------------------+
//! |   Slot Array     |  grows downward (4 bytes per slot)
//! |        ↓         |
//! +------------------+
//! |   Free Space     |
//! +------------------+
//! |        ↑         |
//! |   Item Data      |  grows upward
//! +------------------+
//! ```

mod checksum;
mod header;
mod slotted;
mod types;

pub use checksum::{compute_checksum, compute_page_checksum, verify_checksum};
pub use header::{PageHeader, PAGE_HEADER_SIZE};
pub use slotted::{Slot, SlottedPage, SLOT_SIZE};
pub use types::PageFlags;

/// Magic bytes for page validation ("SP").
pub const PAGE_MAGIC: u16 = 0x5350;
