//! Backend-agnostic code generation contract.
//!
//! A [`CodegenBackend`] turns a program's lifted [`JitFunction`]s into a
//! single callable entry point plus a per-program-counter code-address
//! table. Cranelift is the only backend shipped today; the trait exists so
//! an alternative backend could be swapped in later without touching the
//! decode/CFG/lift stages upstream of it.

use std::any::Any;

use rustc_hash::FxHashMap;

use crate::helpers::HelperTable;
use crate::ir::JitFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// The program's external entry-point ABI:
/// `(context_ptr, context_len) -> int64`.
pub type EntryFn = unsafe extern "C" fn(u64, u64) -> i64;

/// The result of one generation pass: an opaque callable plus the
/// per-program-counter code-address table used by the debugger/disassembly
/// collaborator. Generation is one-shot and the callable is immutable
/// for as long as this value is alive.
pub struct CompiledProgram {
    entry: EntryFn,
    pub pc_addresses: FxHashMap<usize, usize>,
    /// Keeps the backend's code-holding module (and thus the mapped
    /// executable memory) alive for the program's lifetime. Opaque to
    /// callers; never downcast.
    _keep_alive: Box<dyn Any>,
}

impl CompiledProgram {
    pub fn new(entry: EntryFn, pc_addresses: FxHashMap<usize, usize>, keep_alive: Box<dyn Any>) -> Self {
        CompiledProgram { entry, pc_addresses, _keep_alive: keep_alive }
    }

    /// Invoke the compiled program.
    ///
    /// # Safety
    /// `context_ptr` must point to at least `context_len` bytes valid for
    /// the duration of the call. The generator trusts the caller here; it
    /// does not verify memory safety of the program's own loads/stores
    /// against `context_ptr` (that is the eBPF verifier's job, out of
    /// scope per the stated scope).
    pub unsafe fn call(&self, context_ptr: u64, context_len: u64) -> i64 {
        (self.entry)(context_ptr, context_len)
    }
}

// The callable points at immutable executable memory that never changes
// after finalization, and the kept-alive module is never mutated or
// inspected again once wrapped here.
unsafe impl Send for CompiledProgram {}
unsafe impl Sync for CompiledProgram {}

pub trait CodegenBackend {
    /// Backend name, for diagnostics.
    fn name(&self) -> &str;

    fn target_info(&self) -> TargetInfo;

    /// Compile every subroutine of a program (the main entry at pc 0, plus
    /// one per BPF-to-BPF call target) into one executable callable.
    fn compile(&self, funcs: &[JitFunction], helpers: &HelperTable) -> Result<CompiledProgram, CodegenError>;
}
