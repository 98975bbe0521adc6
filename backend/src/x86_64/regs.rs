/// x86-64 general-purpose register indices.
///
/// Encoding matches the x86-64 ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M and SIB).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register needs a REX.B/REX.R/REX.X bit (r8-r15).
    #[inline]
    pub const fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Guest context base, pinned across every block boundary.
pub const GUEST_CTX: Reg = Reg::R14;

/// Guest memory base, pinned across every block boundary.
pub const GUEST_MEM: Reg = Reg::R15;

/// Integer argument registers for upcalls (System V AMD64 ABI).
pub const CALL_ARG_REGS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Callee-saved registers pushed by `enter` and popped by `exit`.
/// Includes the pinned guest context/memory pair.
pub const CALLEE_SAVED: &[Reg] = &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Scratch space reserved below the pushes for block-local spills and
/// outgoing call arguments.
pub const STACK_SIZE: usize = 1024;

/// Stack adjustment emitted by `enter` after the pushes. The extra 8
/// bytes rebias rsp so calls out of the translated world see a
/// 16-byte-aligned frame: return address (8) plus six pushes (48) leave
/// rsp 8 (mod 16).
pub const STACK_ADJUST: usize = STACK_SIZE + 8;

const _: () = assert!(STACK_SIZE % 16 == 0);
const _: () = assert!(CALLEE_SAVED.len() % 2 == 0);
