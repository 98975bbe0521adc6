//! Dispatch controller of the DBT core.
//!
//! Drives the lookup → compile → link cycle across block boundaries:
//! a PC-indexed code cache feeds the generated dispatch thunks, a
//! bidirectional edge table tracks patched static branches, and the
//! [`Jit`] controller services the upcalls out of the thunks:
//! compiling blocks on demand, linking edges on their second traversal,
//! and unlinking them again on invalidation. In steady state execution
//! never leaves generated code.

pub mod code_cache;
pub mod dispatch;
pub mod edge_table;

pub use code_cache::CodeCache;
pub use dispatch::{BlockTranslator, DispatchStats, Jit, MAX_BLOCK_BYTES};
pub use edge_table::EdgeTable;
