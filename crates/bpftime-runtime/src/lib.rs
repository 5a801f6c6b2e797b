//! Facade binding the handler table, JIT compiler, and attach manager into
//! one runtime handle: the handler table is the root data store, the JIT
//! compiles program entries into callables, and the attach manager reads
//! program-attach-target links from the table and installs trampolines
//! that invoke those callables.

pub mod error;

use std::sync::Arc;

use bpftime_attach::{AttachManager, ProbeHandle};
use bpftime_jit::{CompiledProgram, HelperFn, HelperTable};
use bpftime_sdk::{EnvConfig, Instruction, ProgType, RegsCapture};
use bpftime_table::HandlerTable;
use dashmap::DashMap;

pub use error::BpftimeError;

/// A program attached at one perf-event site: the table identifiers of the
/// program, the perf event it's attached through, the link recording that
/// attachment, and the attach-manager handle needed to tear the probe
/// down. Returned by `attach_uprobe`/`attach_uretprobe`/`attach_replace`.
pub struct AttachedProgram {
    pub program_id: usize,
    pub perf_id: usize,
    pub link_id: usize,
    probe: ProbeHandle,
}

/// Binds a [`HandlerTable`], a [`HelperTable`], and an [`AttachManager`]
/// behind one handle. Compiled programs are cached by program id so
/// repeated attaches of the same program id reuse one JIT output, since
/// generation is one-shot and the resulting function is immutable.
pub struct Runtime {
    cfg: EnvConfig,
    table: HandlerTable,
    helpers: HelperTable,
    attach: AttachManager,
    compiled: DashMap<usize, Arc<CompiledProgram>>,
}

impl Runtime {
    /// Build a runtime from [`EnvConfig::from_env`] (the external interface's recognized
    /// options).
    pub fn from_env() -> Result<Self, BpftimeError> {
        Self::with_config(EnvConfig::from_env())
    }

    pub fn with_config(cfg: EnvConfig) -> Result<Self, BpftimeError> {
        let table = HandlerTable::with_defaults(&cfg)?;
        let attach = AttachManager::new(&cfg);
        Ok(Runtime { cfg, table, helpers: HelperTable::new(), attach, compiled: DashMap::new() })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.cfg
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// Register a helper at `index` before any program that calls it is
    /// compiled (the code generation contract "Calls": helper lookups happen once, at
    /// generation time).
    pub fn register_helper(&mut self, index: u32, f: HelperFn) {
        self.helpers.register(index, f);
    }

    /// Load a program's bytecode into the table (the handler table contract `add_program`).
    pub fn load_program(
        &self,
        name: &str,
        prog_type: ProgType,
        insns: Vec<Instruction>,
    ) -> Result<usize, BpftimeError> {
        Ok(self.table.add_program(name, prog_type, insns)?)
    }

    /// Compile `program_id`'s bytecode, caching the result so repeated
    /// attaches of the same program reuse one JIT output.
    pub fn compile(&self, program_id: usize) -> Result<Arc<CompiledProgram>, BpftimeError> {
        if let Some(existing) = self.compiled.get(&program_id) {
            log::debug!("program {program_id} compile cache hit");
            return Ok(existing.clone());
        }
        let handler = self.table.get(program_id).ok_or(BpftimeError::NotAProgram(program_id))?;
        let program =
            handler.as_program().ok_or(BpftimeError::NotAProgram(program_id))?;
        let compiled = Arc::new(bpftime_jit::compile_with_default_backend(&program.insns, &self.helpers)?);
        log::debug!("program {program_id} compiled ({} instructions)", program.insns.len());
        self.compiled.insert(program_id, compiled.clone());
        Ok(compiled)
    }

    /// Invoke `program_id`'s compiled code with `regs` as its context
    /// (the attach callback ABI of the external interface doubling as the program's
    /// `(context_ptr, context_len)` argument).
    fn run_with_regs(compiled: &CompiledProgram, regs: &RegsCapture) -> i64 {
        let ptr = regs as *const RegsCapture as u64;
        let len = std::mem::size_of::<RegsCapture>() as u64;
        unsafe { compiled.call(ptr, len) }
    }

    /// Attach `program_id` as an entry probe at `module`/`symbol`,
    /// recording a uprobe perf-event handle and a link in the table: the
    /// JIT output is wired into an attach-engine trampoline via the table.
    pub fn attach_uprobe(
        &self,
        program_id: usize,
        module: Option<&str>,
        symbol: &str,
        pid: i32,
        ref_ctr_offset: u64,
    ) -> Result<AttachedProgram, BpftimeError> {
        let compiled = self.compile(program_id)?;
        let addr = self.attach.resolve(module, symbol)?;
        let perf_id = self.table.add_uprobe(pid, module.unwrap_or_default(), addr as u64, ref_ctr_offset)?;
        self.table.add_attach_target(program_id, perf_id)?;
        let link_id = self.table.add_link(program_id, perf_id)?;
        let probe = self.attach.install_entry(
            addr,
            Arc::new(move |regs| {
                Self::run_with_regs(&compiled, regs);
            }),
        )?;
        log::debug!("attached program {program_id} as uprobe on {symbol:?} (perf {perf_id}, link {link_id})");
        Ok(AttachedProgram { program_id, perf_id, link_id, probe })
    }

    /// Attach `program_id` as a return probe, symmetric to
    /// [`Runtime::attach_uprobe`].
    pub fn attach_uretprobe(
        &self,
        program_id: usize,
        module: Option<&str>,
        symbol: &str,
        pid: i32,
        ref_ctr_offset: u64,
    ) -> Result<AttachedProgram, BpftimeError> {
        let compiled = self.compile(program_id)?;
        let addr = self.attach.resolve(module, symbol)?;
        let perf_id = self.table.add_uretprobe(pid, module.unwrap_or_default(), addr as u64, ref_ctr_offset)?;
        self.table.add_attach_target(program_id, perf_id)?;
        let link_id = self.table.add_link(program_id, perf_id)?;
        let probe = self.attach.install_return(
            addr,
            Arc::new(move |regs| {
                Self::run_with_regs(&compiled, regs);
            }),
        )?;
        Ok(AttachedProgram { program_id, perf_id, link_id, probe })
    }

    /// Attach `program_id` as a replace probe: the compiled program's
    /// return value (r0) becomes the target function's return value.
    pub fn attach_replace(
        &self,
        program_id: usize,
        module: Option<&str>,
        symbol: &str,
        pid: i32,
        ref_ctr_offset: u64,
    ) -> Result<AttachedProgram, BpftimeError> {
        let compiled = self.compile(program_id)?;
        let addr = self.attach.resolve(module, symbol)?;
        let perf_id = self.table.add_uprobe(pid, module.unwrap_or_default(), addr as u64, ref_ctr_offset)?;
        self.table.add_attach_target(program_id, perf_id)?;
        let link_id = self.table.add_link(program_id, perf_id)?;
        let probe = self.attach.install_replace(
            addr,
            Arc::new(move |regs| Self::run_with_regs(&compiled, regs) as u64),
        )?;
        Ok(AttachedProgram { program_id, perf_id, link_id, probe })
    }

    /// Tear down a previously attached program: destroys the probe,
    /// removes the link and attach-target, and removes the perf-event
    /// handle.
    pub fn detach(&self, attached: AttachedProgram) -> Result<(), BpftimeError> {
        log::debug!(
            "detaching program {} (perf {}, link {})",
            attached.program_id, attached.perf_id, attached.link_id
        );
        self.attach.destroy(attached.probe)?;
        self.table.remove(attached.link_id)?;
        self.table.remove_attach_target(attached.program_id, attached.perf_id)?;
        self.table.remove(attached.perf_id)?;
        Ok(())
    }

    /// Export the handler table to its JSON snapshot document (the snapshot format).
    pub fn export_snapshot(&self) -> String {
        bpftime_table::export_table(&self.table)
    }

    /// Import a JSON snapshot document into this runtime's table.
    pub fn import_snapshot(&self, json: &str) -> Result<(), BpftimeError> {
        Ok(bpftime_table::import_table(&self.table, json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpftime_sdk::Register;

    fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
        Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
    }

    fn test_cfg(suffix: &str) -> EnvConfig {
        let mut cfg = EnvConfig::default();
        cfg.shared_memory_name = format!("bpftime_runtime_test_{}_{}", std::process::id(), suffix);
        cfg
    }

    #[test]
    fn load_and_compile_round_trips_through_the_table() {
        let rt = Runtime::with_config(test_cfg("compile")).unwrap();
        let insns = vec![
            insn(0xb7, Register::R0.index() as u8, 0, 0, 42), // MOV64 r0, 42
            insn(0x95, 0, 0, 0, 0),                           // exit
        ];
        let id = rt.load_program("p", ProgType::Uprobe, insns).unwrap();
        let compiled = rt.compile(id).unwrap();
        assert_eq!(unsafe { compiled.call(0, 0) }, 42);
        let again = rt.compile(id).unwrap();
        assert!(Arc::ptr_eq(&compiled, &again), "second compile reuses the cached output");
    }

    #[test]
    fn compiling_a_non_program_handle_fails() {
        let rt = Runtime::with_config(test_cfg("nonprog")).unwrap();
        let perf_id = rt.table.add_uprobe(-1, "", 0, 0).unwrap();
        assert!(matches!(rt.compile(perf_id), Err(BpftimeError::NotAProgram(id)) if id == perf_id));
    }

    #[test]
    fn snapshot_round_trips_through_the_facade() {
        let rt = Runtime::with_config(test_cfg("snap")).unwrap();
        let insns = vec![insn(0x95, 0, 0, 0, 0)];
        rt.load_program("p", ProgType::Uprobe, insns).unwrap();
        let exported = rt.export_snapshot();

        let rt2 = Runtime::with_config(test_cfg("snap2")).unwrap();
        rt2.import_snapshot(&exported).unwrap();
        assert_eq!(rt.table().size(), rt2.table().size());
    }

    #[inline(never)]
    #[no_mangle]
    pub extern "C" fn __bpftime_runtime_test_replace_target(a: u64, b: u64) -> u64 {
        a.wrapping_add(b)
    }

    #[test]
    fn attach_and_detach_replace_probe_round_trips() {
        let rt = Runtime::with_config(test_cfg("replace")).unwrap();
        // r0 = 99; exit — the replaced function's return value becomes
        // whatever the compiled program leaves in r0 (the attach protocol "Replace").
        let insns =
            vec![insn(0xb7, Register::R0.index() as u8, 0, 0, 99), insn(0x95, 0, 0, 0, 0)];
        let id = rt.load_program("p", ProgType::Uprobe, insns).unwrap();
        let attached =
            rt.attach_replace(id, None, "__bpftime_runtime_test_replace_target", -1, 0).unwrap();
        assert_eq!(__bpftime_runtime_test_replace_target(1, 2), 99);
        rt.detach(attached).unwrap();
        assert_eq!(__bpftime_runtime_test_replace_target(1, 2), 3);
    }
}
