use crate::Error;

/// Interrupt delivery hook supplied by the guest CPU emulator.
///
/// Called from the `interrupt` thunk with the guest's `data` pointer;
/// processes pending interrupt requests and may rewrite the guest PC.
pub type InterruptCheckFn = unsafe extern "C" fn(data: *mut u8);

/// Guest-CPU contract consumed by the dispatch core.
///
/// Describes everything the core needs to know about the emulated CPU:
/// the addressable range of block starts, where the hot context fields
/// live, and the pointers pinned into host registers while translated
/// code runs. Immutable for the lifetime of a JIT instance.
pub struct Guest {
    /// Mask of guest address bits that select a block. Two PCs equal
    /// after masking name the same block.
    pub addr_mask: u32,
    /// Low bits of a masked PC that are always zero at a block start.
    pub cache_shift: u32,
    /// Byte offset of the 32-bit program counter within the context.
    pub offset_pc: i32,
    /// Byte offset of the signed 32-bit cycle budget within the context.
    pub offset_cycles: i32,
    /// Byte offset of the 32-bit instruction counter within the context.
    /// Zeroed on entry; otherwise opaque to the core.
    pub offset_instrs: i32,
    /// Guest CPU context, pinned into a host register across blocks.
    pub ctx: *mut u8,
    /// Guest memory base, pinned into a host register across blocks.
    pub mem: *mut u8,
    /// Opaque argument for `interrupt_check`.
    pub data: *mut u8,
    /// Pending-interrupt hook, upcalled by the `interrupt` thunk.
    pub interrupt_check: InterruptCheckFn,
}

impl Guest {
    /// Sanity-check the geometry before thunks bake it in.
    pub fn validate(&self) -> Result<(), Error> {
        if self.addr_mask == 0 {
            return Err(Error::Guest("addr_mask must be non-zero"));
        }
        if self.cache_shift >= 32 {
            return Err(Error::Guest("cache_shift out of range"));
        }
        if self.ctx.is_null() {
            return Err(Error::Guest("null guest context"));
        }
        Ok(())
    }
}
