//! Host-code backend of the DBT dispatch core.
//!
//! Owns the executable arena, the x86-64 emitter, and the generation of
//! the dispatch thunks that stitch translated blocks together. The
//! controller logic that decides *when* to compile, link and unlink
//! lives in the exec crate; this crate only knows how to put the bytes
//! down.

pub mod code_buffer;
pub mod x86_64;

pub use code_buffer::CodeBuffer;
pub use x86_64::{Asm, DispatchThunks, Reg, ThunkParams};
