//! x86-64 byte-level encodings for the two generated stubs the attach protocol
//! describes: the hook written into a target's prologue, and the
//! continuation that resumes the displaced original code.
//!
//! Installation overwrites the target's prologue with a jump to a
//! generated thunk; no assembler crate is pulled in for it (no
//! `dynasm-rs`/`iced-x86`), so these small, fixed instruction shapes are
//! hand-encoded instead.
//!
//! Two levels of indirection keep the in-prologue footprint small and
//! constant regardless of which probe kind is installed:
//! 1. The target's prologue is overwritten with [`encode_movabs_r11_jmp`]
//!    pointing at a per-site *hook stub* ([`HOOK_STUB_LEN`] bytes).
//! 2. The hook stub ([`build_hook_stub`]) loads the site id into `r11`
//!    (read by the shared trampoline in `trampoline.rs`) and jumps into
//!    the shared entry/return/replace trampoline.
//! A site that needs to resume the original function additionally gets a
//! *continuation stub* ([`build_continuation_stub`]): the displaced
//! prologue bytes followed by another `movabs r11, imm64; jmp r11` back
//! into the target past the overwritten bytes.

/// Bytes overwritten in the target's own prologue.
pub const HOOK_STUB_LEN: usize = 13;

/// `movabs r11, imm64` (10 bytes) + `jmp r11` (3 bytes, `r11` needs
/// `REX.B` since its register number is >= 8). An absolute indirect jump
/// is used instead of a 5-byte relative `jmp rel32` because the
/// destination is an `mmap`-allocated stub that is not guaranteed to sit
/// within +/-2GiB of the target.
pub fn encode_movabs_r11_jmp(target: usize) -> [u8; HOOK_STUB_LEN] {
    let mut out = [0u8; HOOK_STUB_LEN];
    out[0] = 0x49; // REX.WB
    out[1] = 0xbb; // movabs r11, imm64
    out[2..10].copy_from_slice(&(target as u64).to_le_bytes());
    out[10] = 0x41; // REX.B (rm = r11)
    out[11] = 0xff; // jmp r/m64
    out[12] = 0xe3; // ModRM: mod=11, reg=/4, rm=r11
    out
}

/// `movabs r10, imm64` (10 bytes) + `jmp r10` (3 bytes). Used for the
/// hook stub's second jump so that `r11` (the site id, loaded first)
/// survives untouched into the shared trampoline.
fn encode_movabs_r10_jmp(target: usize) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0] = 0x49; // REX.WB
    out[1] = 0xba; // movabs r10, imm64
    out[2..10].copy_from_slice(&(target as u64).to_le_bytes());
    out[10] = 0x41; // REX.B (rm = r10)
    out[11] = 0xff; // jmp r/m64
    out[12] = 0xe2; // ModRM: mod=11, reg=/4, rm=r10
    out
}

/// Build the per-site hook stub: load `site_id` into `r11`, then jump to
/// the shared trampoline at `trampoline_addr`.
pub fn build_hook_stub(site_id: u64, trampoline_addr: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + 13);
    let mut movabs_r11 = [0u8; 10];
    movabs_r11[0] = 0x49;
    movabs_r11[1] = 0xbb;
    movabs_r11[2..10].copy_from_slice(&site_id.to_le_bytes());
    out.extend_from_slice(&movabs_r11);
    out.extend_from_slice(&encode_movabs_r10_jmp(trampoline_addr));
    out
}

/// Build the continuation stub installed for an entry/return-capable
/// site: the displaced original prologue bytes, followed by an absolute
/// jump back into the target at `resume_addr` (the first byte past the
/// overwritten prologue).
pub fn build_continuation_stub(displaced: &[u8], resume_addr: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(displaced.len() + HOOK_STUB_LEN);
    out.extend_from_slice(displaced);
    out.extend_from_slice(&encode_movabs_r11_jmp(resume_addr));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_buffer::CodeBuffer;

    #[test]
    fn movabs_r11_jmp_round_trips_through_the_cpu() {
        let target_code = [0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3]; // mov eax,7; ret
        let target = CodeBuffer::emit(&target_code).unwrap();
        let stub_code = encode_movabs_r11_jmp(target.addr());
        let stub = CodeBuffer::emit(&stub_code).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(stub.addr()) };
        assert_eq!(f(), 7);
    }

    #[test]
    fn hook_stub_preserves_r11_across_the_second_jump() {
        // `mov eax, r11d; ret` reads back the site id we loaded into r11.
        let read_r11_code = [0x44, 0x89, 0xd8, 0xc3];
        let reader = CodeBuffer::emit(&read_r11_code).unwrap();
        let hook = build_hook_stub(0x1234, reader.addr());
        let hook_buf = CodeBuffer::emit(&hook).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(hook_buf.addr()) };
        assert_eq!(f(), 0x1234);
    }
}
