pub mod asm;
pub mod regs;
pub mod thunks;

pub use asm::{Alu, Asm};
pub use regs::Reg;
pub use thunks::{DispatchThunks, ThunkParams, LINK_SLOT_SIZE};
