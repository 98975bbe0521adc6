use std::io;

use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// Invariant breaks (installing over an occupied slot, patching a
/// malformed linkage slot) are core bugs and abort instead of being
/// reported here.
#[derive(Debug, Error)]
pub enum Error {
    /// Mapping or protecting the code buffer failed.
    #[error("code buffer mapping failed: {0}")]
    Map(#[from] io::Error),

    /// The code buffer cannot hold another block.
    #[error("code buffer exhausted while translating block at {pc:#010x}")]
    BufferFull { pc: u32 },

    /// The external pipeline failed to produce host code for a block.
    #[error("failed to translate block at {pc:#010x}")]
    Translate { pc: u32 },

    /// The guest descriptor is malformed.
    #[error("bad guest contract: {0}")]
    Guest(&'static str),
}
