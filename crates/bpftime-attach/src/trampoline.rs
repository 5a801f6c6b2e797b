//! Shared native trampolines (the attach protocol "Installation mechanism": "the
//! thunk saves the integer argument registers into a `regs` buffer,
//! invokes entry callbacks, re-executes the displaced prologue..., captures
//! the return value into `regs.ax`, invokes return callbacks, and
//! returns").
//!
//! Every hooked address shares one of two fixed trampolines —
//! [`entry_trampoline`] for *entry-only*/*return-only*/*entry-and-return*
//! sites, [`replace_trampoline`] for *replaced* sites — so only a tiny,
//! per-site *hook stub* and *continuation stub* (see `patch.rs`) need
//! generating at install time. Site identity travels from the hook stub
//! to the trampoline in `r11` (loaded by `patch::build_hook_stub`).
//!
//! Each trampoline is a small fixed native entry point that spills
//! argument registers into a `RegsCapture` and calls back into a Rust
//! dispatch function, built with Rust's stable `#[unsafe(naked)]` +
//! `naked_asm!` (stabilized 1.88) instead of a JIT-emitted stub, since
//! these three shapes never vary across sites.
//!
//! No return-address shadow stack is needed: the hook stub is reached via
//! `jmp`, not `call`, so `rsp` at trampoline entry still holds the address
//! the *real* caller pushed. `entry_trampoline` calls into the
//! continuation stub (rather than jumping to it) so that the original
//! function's own `ret` lands back inside the trampoline, letting it
//! capture `rax` and fire return callbacks before finally returning to
//! that real caller itself.

use core::arch::naked_asm;

use bpftime_sdk::regs::RegsCapture;

/// Shared trampoline for entry-only / return-only / entry-and-return
/// sites.
///
/// Stack layout after `sub rsp, 104` (chosen so `rsp` is 16-byte aligned
/// at each `call`, given `rsp % 16 == 8` on entry via `jmp`):
/// `[0..80)` = `RegsCapture`, `[80..88)` = continuation stub address
/// (filled in by `dispatch_entry`), `[88..96)` = site id (saved
/// immediately since `r11` is caller-saved and does not survive a Rust
/// call), `[96..104)` unused padding.
#[unsafe(naked)]
pub unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "sub rsp, 104",
        "mov [rsp+0], rdi",
        "mov [rsp+8], rsi",
        "mov [rsp+16], rdx",
        "mov [rsp+24], rcx",
        "mov [rsp+32], r8",
        "mov [rsp+40], r9",
        "mov qword ptr [rsp+48], 0",
        "mov qword ptr [rsp+56], 0",
        "lea rax, [rsp+104]",
        "mov [rsp+64], rax",
        "mov [rsp+72], rbp",
        "mov [rsp+88], r11",
        // dispatch_entry(site_id, &mut regs) -> continuation_addr
        "mov rdi, r11",
        "mov rsi, rsp",
        "call {dispatch_entry}",
        "mov [rsp+80], rax",
        // Reload the original argument registers: dispatch_entry (an
        // ordinary Rust call) is free to clobber every caller-saved
        // register, but the continuation stub re-executes the target's
        // real prologue and must see its real incoming arguments.
        "mov rdi, [rsp+0]",
        "mov rsi, [rsp+8]",
        "mov rdx, [rsp+16]",
        "mov rcx, [rsp+24]",
        "mov r8,  [rsp+32]",
        "mov r9,  [rsp+40]",
        "call qword ptr [rsp+80]",
        "mov [rsp+48], rax",
        // dispatch_return(site_id, &mut regs)
        "mov rdi, [rsp+88]",
        "mov rsi, rsp",
        "call {dispatch_return}",
        "mov rax, [rsp+48]",
        "add rsp, 104",
        "ret",
        dispatch_entry = sym dispatch_entry,
        dispatch_return = sym dispatch_return,
    )
}

/// Shared trampoline for *replaced* sites. The original function body
/// never runs; `dispatch_replace`'s return value becomes the call's
/// result directly.
#[unsafe(naked)]
pub unsafe extern "C" fn replace_trampoline() {
    naked_asm!(
        "sub rsp, 88",
        "mov [rsp+0], rdi",
        "mov [rsp+8], rsi",
        "mov [rsp+16], rdx",
        "mov [rsp+24], rcx",
        "mov [rsp+32], r8",
        "mov [rsp+40], r9",
        "mov qword ptr [rsp+48], 0",
        "mov qword ptr [rsp+56], 0",
        "lea rax, [rsp+88]",
        "mov [rsp+64], rax",
        "mov [rsp+72], rbp",
        "mov [rsp+80], r11",
        "mov rdi, [rsp+80]",
        "mov rsi, rsp",
        "call {dispatch_replace}",
        "add rsp, 88",
        "ret",
        dispatch_replace = sym dispatch_replace,
    )
}

extern "C" fn dispatch_entry(site_id: u64, regs: *mut RegsCapture) -> usize {
    crate::probe::on_entry(site_id, unsafe { &mut *regs })
}

extern "C" fn dispatch_return(site_id: u64, regs: *mut RegsCapture) {
    crate::probe::on_return(site_id, unsafe { &mut *regs });
}

extern "C" fn dispatch_replace(site_id: u64, regs: *mut RegsCapture) -> u64 {
    crate::probe::on_replace(site_id, unsafe { &*regs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_addresses_are_distinct_and_stable() {
        let a = entry_trampoline as usize;
        let b = replace_trampoline as usize;
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(a, entry_trampoline as usize);
    }
}
