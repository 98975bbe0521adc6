//! Dispatch thunk emission and linkage-slot patching.
//!
//! The six thunks form the dispatch state machine. `dynamic` is the hot
//! path: read the guest PC, index the code cache, tail-jump through the
//! slot. Everything that can be slow (compilation, edge management,
//! interrupt delivery) is an upcall out of one of the other thunks,
//! after which control falls back into `dynamic`.
//!
//! All addresses a thunk needs (the cache slot table, the guest
//! context, the controller and its upcall entry points) are captured
//! as immediates at emission time.

use crate::code_buffer::CodeBuffer;
use crate::x86_64::asm::{Alu, Asm};
use crate::x86_64::regs::{
    Reg, CALLEE_SAVED, CALL_ARG_REGS, GUEST_CTX, GUEST_MEM, STACK_ADJUST,
};

/// Width of a linkage slot in host bytes: `call rel32` and `jmp rel32`
/// are both five bytes, so patching never moves surrounding code.
pub const LINK_SLOT_SIZE: usize = 5;

/// Alignment of each thunk entry point.
const THUNK_ALIGN: usize = 32;

/// Upcall requesting synchronous compilation of the block at `pc`.
pub type CompileBlockFn = unsafe extern "C" fn(controller: *mut (), pc: u32);

/// Upcall recording (and on the second traversal, patching) a static
/// branch from `site` to the block at `pc`.
pub type AddEdgeFn = unsafe extern "C" fn(controller: *mut (), site: *mut u8, pc: u32);

/// Everything the thunks bake in as immediates.
pub struct ThunkParams {
    pub guest_ctx: *mut u8,
    pub guest_mem: *mut u8,
    pub offset_pc: i32,
    pub offset_cycles: i32,
    pub offset_instrs: i32,
    pub addr_mask: u32,
    pub cache_shift: u32,
    /// Base of the code cache slot table.
    pub cache_base: *const *const u8,
    /// Dispatch controller handle, passed as the first upcall argument.
    pub controller: *mut (),
    pub compile_block: CompileBlockFn,
    pub add_edge: AddEdgeFn,
    pub interrupt_check: unsafe extern "C" fn(*mut u8),
    pub interrupt_data: *mut u8,
}

/// Buffer offsets of the six dispatch thunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchThunks {
    pub enter: usize,
    pub exit: usize,
    pub dynamic: usize,
    pub static_branch: usize,
    pub compile: usize,
    pub interrupt: usize,
}

/// Emit the six thunks at the buffer's current position.
pub fn emit_dispatch_thunks(buf: &mut CodeBuffer, p: &ThunkParams) -> DispatchThunks {
    let mut t = DispatchThunks::default();

    // Jumped to after a dynamic branch has stored the next pc to the
    // context: index the cache with the masked, shifted pc and jump
    // through the slot. No spills, no memory beyond the slot itself.
    buf.align(THUNK_ALIGN);
    t.dynamic = buf.offset();
    {
        let mut a = Asm::new(buf);
        a.mov_ri(Reg::Rax, p.cache_base as u64);
        a.load32(Reg::Rcx, GUEST_CTX, p.offset_pc);
        a.alu_ri(Alu::And, false, Reg::Rcx, p.addr_mask as i32);
        if p.cache_shift > 0 {
            a.shr32_ri(Reg::Rcx, p.cache_shift as u8);
        }
        a.jmp_mem_index(Reg::Rax, Reg::Rcx, 3);
    }

    // Called (not jumped) at the end of a block that ended in a static
    // branch. The return address on the stack is the end of the 5-byte
    // linkage slot, i.e. the call instruction itself. Hand the slot start
    // and the destination pc to the controller, which patches the slot
    // to a direct jump once the destination is resident, then fall
    // through the dynamic path. Control never returns through the slot.
    buf.align(THUNK_ALIGN);
    t.static_branch = buf.offset();
    {
        let (arg0, arg1, arg2) = (CALL_ARG_REGS[0], CALL_ARG_REGS[1], CALL_ARG_REGS[2]);
        let mut a = Asm::new(buf);
        a.pop(arg1);
        a.alu_ri(Alu::Sub, true, arg1, LINK_SLOT_SIZE as i32);
        a.mov_ri(arg0, p.controller as u64);
        a.load32(arg2, GUEST_CTX, p.offset_pc);
        a.call_abs(Reg::Rax, p.add_edge as usize as u64);
        a.jmp_rel(t.dynamic);
    }

    // Default contents of every cache slot: compile the block the pc
    // names, then re-dispatch into it.
    buf.align(THUNK_ALIGN);
    t.compile = buf.offset();
    {
        let (arg0, arg1) = (CALL_ARG_REGS[0], CALL_ARG_REGS[1]);
        let mut a = Asm::new(buf);
        a.mov_ri(arg0, p.controller as u64);
        a.load32(arg1, GUEST_CTX, p.offset_pc);
        a.call_abs(Reg::Rax, p.compile_block as usize as u64);
        a.jmp_rel(t.dynamic);
    }

    // Deliver pending interrupts, then re-dispatch at whatever pc the
    // guest hook left behind.
    buf.align(THUNK_ALIGN);
    t.interrupt = buf.offset();
    {
        let mut a = Asm::new(buf);
        a.mov_ri(CALL_ARG_REGS[0], p.interrupt_data as u64);
        a.call_abs(Reg::Rax, p.interrupt_check as usize as u64);
        a.jmp_rel(t.dynamic);
    }

    // Entry into the translated world: save callee-saved registers,
    // build the fixed frame, pin the context and memory bases, seed the
    // cycle budget, and dispatch on the current pc.
    buf.align(THUNK_ALIGN);
    t.enter = buf.offset();
    {
        let mut a = Asm::new(buf);
        for &reg in CALLEE_SAVED {
            a.push(reg);
        }
        a.alu_ri(Alu::Sub, true, Reg::Rsp, STACK_ADJUST as i32);
        a.mov_ri(GUEST_CTX, p.guest_ctx as u64);
        a.mov_ri(GUEST_MEM, p.guest_mem as u64);
        a.store32(GUEST_CTX, p.offset_cycles, CALL_ARG_REGS[0]);
        a.store32_imm(GUEST_CTX, p.offset_instrs, 0);
        a.jmp_rel(t.dynamic);
    }

    // Exit from the translated world: unwind the frame and return to
    // the caller of `enter`.
    buf.align(THUNK_ALIGN);
    t.exit = buf.offset();
    {
        let mut a = Asm::new(buf);
        a.alu_ri(Alu::Add, true, Reg::Rsp, STACK_ADJUST as i32);
        for &reg in CALLEE_SAVED.iter().rev() {
            a.pop(reg);
        }
        a.ret();
    }

    t
}

/// Decoded contents of a linkage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageSlot {
    /// Linked: `jmp rel32` to a destination block entry.
    Jump(*const u8),
    /// Unlinked: `call rel32` to the `static` thunk.
    Call(*const u8),
    /// Bytes that are neither encoding. Always an invariant break.
    Other,
}

/// Rewrite the linkage slot at `site` into `jmp dst`.
///
/// # Safety
/// `site` must be the start of a linkage slot emitted by this backend,
/// inside a writable code buffer, and no thread may be executing the
/// slot bytes. `dst` must be within rel32 range of the slot.
pub unsafe fn patch_edge(site: *mut u8, dst: *const u8) {
    write_rel32(site, 0xE9, dst);
}

/// Rewrite the linkage slot at `site` back into `call static`.
///
/// # Safety
/// Same contract as [`patch_edge`]; `static_branch` must be the address
/// of the `static` thunk in the same buffer.
pub unsafe fn restore_edge(site: *mut u8, static_branch: *const u8) {
    write_rel32(site, 0xE8, static_branch);
}

/// Decode the linkage slot at `site`.
///
/// # Safety
/// `site` must point at `LINK_SLOT_SIZE` readable bytes.
pub unsafe fn read_slot(site: *const u8) -> LinkageSlot {
    let rel = (site.add(1) as *const i32).read_unaligned();
    let target = site.add(LINK_SLOT_SIZE).wrapping_offset(rel as isize) as *const u8;
    match site.read() {
        0xE9 => LinkageSlot::Jump(target),
        0xE8 => LinkageSlot::Call(target),
        _ => LinkageSlot::Other,
    }
}

unsafe fn write_rel32(site: *mut u8, opcode: u8, target: *const u8) {
    let disp = target as i64 - (site as i64 + LINK_SLOT_SIZE as i64);
    assert!(
        (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
        "linkage target out of rel32 range"
    );
    site.write(opcode);
    (site.add(1) as *mut i32).write_unaligned(disp as i32);
}
