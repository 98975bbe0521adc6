use dbt_backend::code_buffer::CodeBuffer;
use dbt_backend::x86_64::asm::{Alu, Asm};
use dbt_backend::x86_64::regs::{Reg, CALLEE_SAVED, GUEST_CTX, GUEST_MEM};

fn emit(f: impl FnOnce(&mut Asm<'_>)) -> Vec<u8> {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let mut a = Asm::new(&mut buf);
    f(&mut a);
    buf.as_slice().to_vec()
}

#[test]
fn reg_numbering() {
    assert_eq!(Reg::Rax.low3(), 0);
    assert_eq!(Reg::Rsp.low3(), 4);
    assert_eq!(Reg::R8.low3(), 0);
    assert_eq!(Reg::R15.low3(), 7);
    assert!(Reg::R8.is_extended());
    assert!(!Reg::Rdi.is_extended());
}

#[test]
fn pinned_registers_survive_upcalls() {
    // The context and memory bases must be callee-saved so C upcalls
    // out of the thunks cannot clobber them.
    assert!(CALLEE_SAVED.contains(&GUEST_CTX));
    assert!(CALLEE_SAVED.contains(&GUEST_MEM));
}

#[test]
fn mov_imm_zero_is_xor() {
    assert_eq!(emit(|a| a.mov_ri(Reg::Rax, 0)), [0x31, 0xC0]);
}

#[test]
fn mov_imm32() {
    assert_eq!(
        emit(|a| a.mov_ri(Reg::Rax, 0x1234)),
        [0xB8, 0x34, 0x12, 0x00, 0x00]
    );
}

#[test]
fn mov_imm64_extended_reg() {
    assert_eq!(
        emit(|a| a.mov_ri(Reg::R14, 0x1122_3344_5566_7788)),
        [0x49, 0xBE, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn mov_imm_sign_extended() {
    // Negative 64-bit values in i32 range use the C7 /0 form.
    assert_eq!(
        emit(|a| a.mov_ri(Reg::Rax, -16i64 as u64)),
        [0x48, 0xC7, 0xC0, 0xF0, 0xFF, 0xFF, 0xFF]
    );
}

#[test]
fn mov_reg_reg() {
    // mov r14, rdi
    assert_eq!(
        emit(|a| a.mov_rr(true, Reg::R14, Reg::Rdi)),
        [0x49, 0x89, 0xFE]
    );
}

#[test]
fn load_from_extended_base() {
    // mov ecx, [r14 + 8]
    assert_eq!(
        emit(|a| a.load32(Reg::Rcx, Reg::R14, 8)),
        [0x41, 0x8B, 0x4E, 0x08]
    );
}

#[test]
fn load_rsp_base_needs_sib() {
    // mov eax, [rsp + 8]
    assert_eq!(
        emit(|a| a.load32(Reg::Rax, Reg::Rsp, 8)),
        [0x8B, 0x44, 0x24, 0x08]
    );
}

#[test]
fn load_rbp_base_needs_disp8() {
    // mov eax, [rbp]
    assert_eq!(emit(|a| a.load32(Reg::Rax, Reg::Rbp, 0)), [0x8B, 0x45, 0x00]);
}

#[test]
fn store_imm_to_context_field() {
    // mov dword [r14 + 0x10], -1
    assert_eq!(
        emit(|a| a.store32_imm(Reg::R14, 0x10, -1)),
        [0x41, 0xC7, 0x46, 0x10, 0xFF, 0xFF, 0xFF, 0xFF]
    );
}

#[test]
fn store_disp32() {
    // mov [r14 + 0x1000], eax
    assert_eq!(
        emit(|a| a.store32(Reg::R14, 0x1000, Reg::Rax)),
        [0x41, 0x89, 0x86, 0x00, 0x10, 0x00, 0x00]
    );
}

#[test]
fn alu_imm8_and_imm32() {
    // sub rsi, 5
    assert_eq!(
        emit(|a| a.alu_ri(Alu::Sub, true, Reg::Rsi, 5)),
        [0x48, 0x83, 0xEE, 0x05]
    );
    // sub rsp, 1032
    assert_eq!(
        emit(|a| a.alu_ri(Alu::Sub, true, Reg::Rsp, 1032)),
        [0x48, 0x81, 0xEC, 0x08, 0x04, 0x00, 0x00]
    );
}

#[test]
fn alu_on_memory() {
    // sub dword [r14 + 4], 2
    assert_eq!(
        emit(|a| a.alu32_mem_imm(Alu::Sub, Reg::R14, 4, 2)),
        [0x41, 0x83, 0x6E, 0x04, 0x02]
    );
}

#[test]
fn and_mask() {
    // and ecx, 0x00FFFFFF
    assert_eq!(
        emit(|a| a.alu_ri(Alu::And, false, Reg::Rcx, 0x00FF_FFFF)),
        [0x81, 0xE1, 0xFF, 0xFF, 0xFF, 0x00]
    );
}

#[test]
fn shift_right() {
    assert_eq!(emit(|a| a.shr32_ri(Reg::Rcx, 1)), [0xD1, 0xE9]);
    assert_eq!(emit(|a| a.shr32_ri(Reg::Rcx, 4)), [0xC1, 0xE9, 0x04]);
}

#[test]
fn push_pop() {
    assert_eq!(emit(|a| a.push(Reg::Rbx)), [0x53]);
    assert_eq!(emit(|a| a.push(Reg::R15)), [0x41, 0x57]);
    assert_eq!(emit(|a| a.pop(Reg::R15)), [0x41, 0x5F]);
    assert_eq!(emit(|a| a.pop(Reg::Rbx)), [0x5B]);
}

#[test]
fn rel32_branches() {
    // call/jmp from offset 0 to offset 0x64: disp = 0x64 - 5 = 0x5F
    assert_eq!(emit(|a| a.call_rel(0x64)), [0xE8, 0x5F, 0x00, 0x00, 0x00]);
    assert_eq!(emit(|a| a.jmp_rel(0x64)), [0xE9, 0x5F, 0x00, 0x00, 0x00]);
    // Backward jump wraps to a negative rel32.
    assert_eq!(emit(|a| a.jmp_rel(0)), [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn indirect_branches() {
    assert_eq!(emit(|a| a.call_reg(Reg::Rax)), [0xFF, 0xD0]);
    assert_eq!(emit(|a| a.jmp_reg(Reg::Rax)), [0xFF, 0xE0]);
    // jmp qword [rax + rcx*8]
    assert_eq!(
        emit(|a| a.jmp_mem_index(Reg::Rax, Reg::Rcx, 3)),
        [0xFF, 0x24, 0xC8]
    );
}

#[test]
fn ret_encoding() {
    assert_eq!(emit(|a| a.ret()), [0xC3]);
}
