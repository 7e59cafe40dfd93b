//! Buffer manager for sptree index files.
//!
//! Pages live in memory frames, one per block of the index file. Each
//! frame carries an exclusive latch; holding a [`PageGuard`] is holding
//! the page's pin and lock, and dropping the guard releases both.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 BufferManager                  │
//! │   frames: Vec<Arc<Mutex<FrameData>>>           │
//! │   ┌─────────┐ ┌─────────┐     ┌─────────┐      │
//! │   │ block 0 │ │ block 1 │ ... │ block N │      │
//! │   │ data[]  │ │ data[]  │     │ data[]  │      │
//! │   │ dirty   │ │ dirty   │     │ dirty   │      │
//! │   └─────────┘ └─────────┘     └─────────┘      │
//! │                     │                          │
//! │                     ▼                          │
//! │            PageFile (optional)                 │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Latches are acquired either blocking ([`BufferManager::lock`]) or
//! conditionally ([`BufferManager::try_lock`]); the insertion engine uses
//! the latter whenever lock order could invert.

mod config;
mod error;
mod file;
mod latch;
mod manager;

pub use config::BufferConfig;
pub use error::{BufferError, BufferResult};
pub use file::PageFile;
pub use latch::PageGuard;
pub use manager::BufferManager;
