//! Piece storage trait and backend implementations.
//!
//! [`PieceAccessor`] is the read contract the dagstore mounts depend on;
//! [`PieceStore`] adds the write side used when importing pieces. Two
//! backends are provided:
//!
//! - [`MemoryPieceStore`]: in-memory storage with hooks for tests.
//! - [`FilePieceStore`]: one file per piece with a 2-level fan-out layout.

mod error;
mod file_store;
mod memory_store;
mod traits;

pub use error::PieceError;
pub use file_store::FilePieceStore;
pub use memory_store::MemoryPieceStore;
pub use traits::{PieceAccessor, PieceStore};
