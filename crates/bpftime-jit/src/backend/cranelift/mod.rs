//! Cranelift code generation backend.
//!
//! Implements [`CodegenBackend`] by building every subroutine into one
//! [`cranelift_jit::JITModule`], wiring a small trampoline that adapts the
//! program's two-argument external entry ABI into the five-argument
//! internal ABI used between subroutines and helpers, then finalizing the
//! module into real executable memory.

pub mod lowering;

use std::sync::Arc;

use cranelift_codegen::ir::{self, InstBuilder};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use rustc_hash::FxHashMap;
use target_lexicon::Architecture;

use crate::backend::traits::{CodegenBackend, CodegenError, CompiledProgram, EntryFn, TargetArch, TargetInfo};
use crate::helpers::HelperTable;
use crate::ir::JitFunction;

use self::lowering::{entry_signature, internal_signature, LoweringContext};

/// Cranelift-based code generation backend.
pub struct CraneliftBackend {
    isa: Arc<dyn TargetIsa>,
}

impl CraneliftBackend {
    /// A backend targeting the host machine.
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::BackendError(format!("failed to set opt_level: {e}")))?;
        flag_builder
            .set("is_pic", "true")
            .map_err(|e| CodegenError::BackendError(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::BackendError(format!("no native ISA builder: {e}")))?
            .finish(flags)
            .map_err(|e| CodegenError::BackendError(format!("failed to finish ISA: {e}")))?;

        Ok(CraneliftBackend { isa })
    }

    pub fn with_isa(isa: Arc<dyn TargetIsa>) -> Self {
        CraneliftBackend { isa }
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::Aarch64,
            other => {
                log::warn!("targeting unrecognized architecture {other:?}, assuming x86_64 ABI shape");
                TargetArch::X86_64
            }
        };
        TargetInfo { arch, pointer_size: self.isa.pointer_bytes() as usize }
    }

    fn compile(&self, funcs: &[JitFunction], helpers: &HelperTable) -> Result<CompiledProgram, CodegenError> {
        let call_conv = self.isa.default_call_conv();
        let builder_isa = self.isa.clone();
        let jit_builder = JITBuilder::with_isa(builder_isa, cranelift_module::default_libcall_names());
        let mut module = JITModule::new(jit_builder);

        let mut func_ids: FxHashMap<u32, FuncId> = FxHashMap::default();
        for func in funcs {
            let sig = internal_signature(call_conv);
            let name = format!("bpf_sub_{}", func.func_index);
            let id = module
                .declare_function(&name, Linkage::Local, &sig)
                .map_err(|e| CodegenError::BackendError(format!("declare_function: {e}")))?;
            func_ids.insert(func.func_index, id);
        }

        let mut entry_block_to_func: FxHashMap<crate::cfg::BlockId, u32> = FxHashMap::default();
        for func in funcs {
            entry_block_to_func.insert(func.entry, func.func_index);
        }

        // Per-function table of (pc, code offset within the function) pairs
        // recorded from each block's source location, combined with the
        // function's finalized base address once the module is done.
        let mut func_srclocs: FxHashMap<u32, Vec<(usize, u32)>> = FxHashMap::default();

        let mut ctx = module.make_context();
        for func in funcs {
            ctx.func.signature = internal_signature(call_conv);
            ctx.func.name = ir::UserFuncName::user(0, func.func_index);

            let mut fb_ctx = FunctionBuilderContext::new();
            {
                let builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
                let lowering = LoweringContext::new(
                    func,
                    builder,
                    &module,
                    call_conv,
                    &func_ids,
                    &entry_block_to_func,
                    helpers,
                );
                lowering
                    .lower()
                    .map_err(|e| CodegenError::BackendError(format!("lowering func {}: {e}", func.func_index)))?;
            }

            let id = func_ids[&func.func_index];
            module
                .define_function(id, &mut ctx)
                .map_err(|e| CodegenError::BackendError(format!("define_function: {e}")))?;

            if let Some(compiled) = ctx.compiled_code() {
                let locs: Vec<(usize, u32)> = compiled
                    .buffer
                    .get_srclocs_sorted()
                    .iter()
                    .filter(|entry| !entry.loc.is_default())
                    .map(|entry| (entry.loc.bits() as usize, entry.start))
                    .collect();
                func_srclocs.insert(func.func_index, locs);
            }

            module.clear_context(&mut ctx);
        }

        let entry_func_id = *func_ids.get(&0).ok_or_else(|| {
            CodegenError::BackendError("program has no subroutine at func_index 0".to_string())
        })?;

        let trampoline_id = {
            let sig = entry_signature(call_conv);
            module
                .declare_function("bpf_entry", Linkage::Export, &sig)
                .map_err(|e| CodegenError::BackendError(format!("declare bpf_entry: {e}")))?
        };

        ctx.func.signature = entry_signature(call_conv);
        ctx.func.name = ir::UserFuncName::user(0, u32::MAX);
        {
            let mut fb_ctx = FunctionBuilderContext::new();
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let block = builder.create_block();
            builder.switch_to_block(block);
            builder.append_block_params_for_function_params(block);
            let params = builder.block_params(block).to_vec();
            let context_ptr = params[0];
            let context_len = params[1];

            let callee_ref = module.declare_func_in_func(entry_func_id, builder.func);
            let zero = builder.ins().iconst(ir::types::I64, 0);
            let call = builder.ins().call(callee_ref, &[context_ptr, context_len, zero, zero, zero]);
            let result = builder.inst_results(call)[0];
            builder.ins().return_(&[result]);

            builder.seal_all_blocks();
            builder.finalize();
        }
        module
            .define_function(trampoline_id, &mut ctx)
            .map_err(|e| CodegenError::BackendError(format!("define bpf_entry: {e}")))?;
        module.clear_context(&mut ctx);

        module
            .finalize_definitions()
            .map_err(|e| CodegenError::BackendError(format!("finalize_definitions: {e}")))?;

        // Per-program-counter code address table, at basic-block
        // granularity: each block's first instruction's source location was
        // recorded during lowering as its raw pc, carried through codegen as
        // a `SourceLoc`/offset pair; combine with the finalized function base
        // address now that the module's executable memory is mapped.
        let mut pc_addresses: FxHashMap<usize, usize> = FxHashMap::default();
        for func in funcs {
            let id = func_ids[&func.func_index];
            let base = module.get_finalized_function(id) as usize;
            if let Some(locs) = func_srclocs.get(&func.func_index) {
                for &(pc, offset) in locs {
                    pc_addresses.entry(pc).or_insert(base + offset as usize);
                }
            }
        }

        let entry_ptr = module.get_finalized_function(trampoline_id);
        let entry_fn: EntryFn = unsafe { std::mem::transmute::<*const u8, EntryFn>(entry_ptr) };

        Ok(CompiledProgram::new(entry_fn, pc_addresses, Box::new(module)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_backend_reports_pointer_size_eight() {
        let backend = CraneliftBackend::host().unwrap();
        assert_eq!(backend.name(), "cranelift");
        assert_eq!(backend.target_info().pointer_size, 8);
    }
}
