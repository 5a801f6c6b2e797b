//! Decode -> control-flow reconstruction -> lift -> Cranelift code
//! generation pipeline for user-space eBPF JIT compilation (the code generation contract).

pub mod backend;
pub mod cfg;
pub mod error;
pub mod helpers;
pub mod ir;
pub mod lift;
pub mod opcode;

use bpftime_sdk::Instruction;

pub use backend::cranelift::CraneliftBackend;
pub use backend::traits::{CodegenBackend, CodegenError, CompiledProgram, TargetArch, TargetInfo};
pub use error::GenerationError;
pub use helpers::{HelperFn, HelperTable};

/// Compile a raw instruction stream into one executable [`CompiledProgram`]
/// using a caller-supplied backend.
///
/// Runs decode (the caller has already turned bytes into [`Instruction`]s
/// via [`bpftime_sdk::Instruction::decode_program`]) through control-flow
/// reconstruction, lifting, and backend code generation.
pub fn compile_program(
    insns: &[Instruction],
    helpers: &HelperTable,
    backend: &dyn CodegenBackend,
) -> Result<CompiledProgram, GenerationError> {
    let cfg = cfg::build_cfg(insns)?;
    let funcs = lift::lift_program(insns, &cfg, helpers)?;
    backend
        .compile(&funcs, helpers)
        .map_err(|e| GenerationError::Backend(e.to_string()))
}

/// Compile using the host-native Cranelift backend (the only backend
/// shipped today).
pub fn compile_with_default_backend(
    insns: &[Instruction],
    helpers: &HelperTable,
) -> Result<CompiledProgram, GenerationError> {
    let backend = CraneliftBackend::host().map_err(|e| GenerationError::Backend(e.to_string()))?;
    compile_program(insns, helpers, &backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpftime_sdk::Register;

    fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
        Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
    }

    /// `r0 = 7; exit;` — simplest possible program, should run to
    /// completion and return 7 through the trampoline ABI.
    #[test]
    fn compiles_and_runs_immediate_return() {
        let insns = vec![
            insn(0xb7, Register::R0.index() as u8, 0, 0, 7), // MOV64 r0, 7
            insn(0x95, 0, 0, 0, 0),                          // exit
        ];
        let helpers = HelperTable::new();
        let program = compile_with_default_backend(&insns, &helpers).unwrap();
        let result = unsafe { program.call(0, 0) };
        assert_eq!(result, 7);
    }

    /// `r0 = r1 + r2; exit;` exercises the external-ABI-to-internal-ABI
    /// trampoline: r1/r2 are set from the two context arguments.
    #[test]
    fn entry_args_flow_into_r1_and_r2() {
        let insns = vec![
            insn(0x0f, Register::R1.index() as u8, Register::R2.index() as u8, 0, 0), // ADD64 r1, r2
            insn(0xbf, Register::R0.index() as u8, Register::R1.index() as u8, 0, 0), // MOV64 r0, r1
            insn(0x95, 0, 0, 0, 0),
        ];
        let helpers = HelperTable::new();
        let program = compile_with_default_backend(&insns, &helpers).unwrap();
        let result = unsafe { program.call(10, 32) };
        assert_eq!(result, 42);
    }

    #[test]
    fn missing_helper_index_fails_generation_with_locus() {
        let insns = vec![
            insn(0x85, 0, 0, 0, 99), // CALL imm=99, no such helper registered
            insn(0x95, 0, 0, 0, 0),
        ];
        let helpers = HelperTable::new();
        let err = compile_with_default_backend(&insns, &helpers).unwrap_err();
        match err {
            GenerationError::MissingHelper { index, .. } => assert_eq!(index, 99),
            other => panic!("expected MissingHelper, got {other:?}"),
        }
    }
}
