//! Lifts a decoded instruction stream plus its [`ControlFlowGraph`] into one
//! [`JitFunction`] per subroutine.

use bpftime_sdk::Instruction;

use crate::cfg::{CfgTerminator, ControlFlowGraph};
use crate::error::GenerationError;
use crate::helpers::HelperTable;
use crate::ir::{AluWidth, AtomicKind, CmpKind, JitBlock, JitFunction, JitInstr, JitTerminator, Reg, RegOrImm};
use crate::opcode::{self, AluOp, AtomicOp, InsnClass, JmpOp, MemMode, MemSize};

fn alu_width(class: InsnClass) -> AluWidth {
    if class == InsnClass::Alu64 {
        AluWidth::W64
    } else {
        AluWidth::W32
    }
}

fn rhs_operand(insn: Instruction) -> RegOrImm {
    if insn.uses_src_reg() {
        RegOrImm::Reg(Reg(insn.src_reg))
    } else {
        RegOrImm::Imm(insn.imm)
    }
}

fn cmp_kind(op: JmpOp) -> Option<CmpKind> {
    Some(match op {
        JmpOp::Eq => CmpKind::Eq,
        JmpOp::Ne => CmpKind::Ne,
        JmpOp::Gt => CmpKind::Gt,
        JmpOp::Ge => CmpKind::Ge,
        JmpOp::Lt => CmpKind::Lt,
        JmpOp::Le => CmpKind::Le,
        JmpOp::SGt => CmpKind::SGt,
        JmpOp::SGe => CmpKind::SGe,
        JmpOp::SLt => CmpKind::SLt,
        JmpOp::SLe => CmpKind::SLe,
        JmpOp::Set => CmpKind::SetNz,
        JmpOp::Ja | JmpOp::Call | JmpOp::Exit => return None,
    })
}

fn lift_instr(
    pc: usize,
    insns: &[Instruction],
    helpers: &HelperTable,
) -> Result<Option<JitInstr>, GenerationError> {
    let insn = insns[pc];
    if opcode::is_wide_load(insn) {
        let next = insns.get(pc + 1).copied().unwrap_or(Instruction {
            opcode: 0,
            dst_reg: 0,
            src_reg: 0,
            offset: 0,
            imm: 0,
        });
        let low = insn.imm as u32 as u64;
        let high = next.imm as u32 as u64;
        let value = (high << 32 | low) as i64;
        return Ok(Some(JitInstr::LoadImm64 { dst: Reg(insn.dst_reg), value }));
    }

    let class = InsnClass::from_opcode(insn.opcode)
        .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;

    Ok(Some(match class {
        InsnClass::Alu32 | InsnClass::Alu64 => {
            let op = AluOp::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            let width = alu_width(class);
            match op {
                AluOp::Neg => JitInstr::Neg { width, dst: Reg(insn.dst_reg) },
                AluOp::EndToLe | AluOp::EndToBe => {
                    if !matches!(insn.imm, 16 | 32 | 64) {
                        return Err(GenerationError::InvalidEndianImmediate { pc, imm: insn.imm });
                    }
                    JitInstr::Endian {
                        dst: Reg(insn.dst_reg),
                        bits: insn.imm as u32,
                        to_be: matches!(op, AluOp::EndToBe),
                    }
                }
                _ => JitInstr::Alu { op, width, dst: Reg(insn.dst_reg), rhs: rhs_operand(insn) },
            }
        }
        InsnClass::LdX => {
            let size = MemSize::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            match MemMode::from_opcode(insn.opcode) {
                MemMode::Mem => JitInstr::Load {
                    dst: Reg(insn.dst_reg),
                    base: Reg(insn.src_reg),
                    offset: insn.offset,
                    size,
                },
                MemMode::Atomic => {
                    let kind = AtomicOp::from_imm(insn.imm)
                        .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
                    let fetch = matches!(
                        kind,
                        AtomicOp::Add { fetch: true }
                            | AtomicOp::Or { fetch: true }
                            | AtomicOp::And { fetch: true }
                            | AtomicOp::Xor { fetch: true }
                            | AtomicOp::Xchg
                            | AtomicOp::CmpXchg
                    );
                    JitInstr::Atomic {
                        base: Reg(insn.dst_reg),
                        offset: insn.offset,
                        src: Reg(insn.src_reg),
                        kind: AtomicKind { op: kind },
                        width: size,
                        fetch,
                    }
                }
                _ => return Err(GenerationError::UnknownOpcode { pc, opcode: insn.opcode }),
            }
        }
        InsnClass::St => {
            let size = MemSize::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            JitInstr::StoreImm { base: Reg(insn.dst_reg), offset: insn.offset, imm: insn.imm, size }
        }
        InsnClass::StX => {
            let size = MemSize::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            match MemMode::from_opcode(insn.opcode) {
                MemMode::Mem => JitInstr::StoreReg {
                    base: Reg(insn.dst_reg),
                    offset: insn.offset,
                    src: Reg(insn.src_reg),
                    size,
                },
                MemMode::Atomic => {
                    let kind = AtomicOp::from_imm(insn.imm)
                        .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
                    let fetch = matches!(
                        kind,
                        AtomicOp::Add { fetch: true }
                            | AtomicOp::Or { fetch: true }
                            | AtomicOp::And { fetch: true }
                            | AtomicOp::Xor { fetch: true }
                            | AtomicOp::Xchg
                            | AtomicOp::CmpXchg
                    );
                    JitInstr::Atomic {
                        base: Reg(insn.dst_reg),
                        offset: insn.offset,
                        src: Reg(insn.src_reg),
                        kind: AtomicKind { op: kind },
                        width: size,
                        fetch,
                    }
                }
                _ => return Err(GenerationError::UnknownOpcode { pc, opcode: insn.opcode }),
            }
        }
        InsnClass::Jmp64 | InsnClass::Jmp32 => {
            let op = JmpOp::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            match op {
                JmpOp::Call if insn.src_reg == 0 => {
                    let index = insn.imm as u32;
                    if helpers.get(index).is_none() {
                        return Err(GenerationError::MissingHelper { pc, index });
                    }
                    return Ok(Some(JitInstr::HelperCall { index }));
                }
                JmpOp::Call | JmpOp::Exit | JmpOp::Ja => return Ok(None),
                _ => return Ok(None), // conditional branches are pure terminators
            }
        }
        InsnClass::Ld => return Err(GenerationError::UnknownOpcode { pc, opcode: insn.opcode }),
    }))
}

fn lift_terminator(
    block_end_pc: usize,
    insns: &[Instruction],
    cfg_term: &CfgTerminator,
) -> JitTerminator {
    match cfg_term {
        CfgTerminator::Return => JitTerminator::Return,
        CfgTerminator::Jump(b) => JitTerminator::Jump(*b),
        CfgTerminator::Call { target, return_to } => {
            JitTerminator::Call { target: *target, return_to: *return_to }
        }
        CfgTerminator::Branch { true_target, false_target } => {
            let insn = insns[block_end_pc];
            let class = InsnClass::from_opcode(insn.opcode).expect("validated in build_cfg");
            let op = JmpOp::from_opcode(insn.opcode).expect("validated in build_cfg");
            let cmp = cmp_kind(op).expect("conditional branch has a comparison");
            JitTerminator::Branch {
                cmp,
                width: alu_width(class),
                dst: Reg(insn.dst_reg),
                rhs: rhs_operand(insn),
                true_target: *true_target,
                false_target: *false_target,
            }
        }
        CfgTerminator::None => unreachable!("build_cfg always assigns a terminator"),
    }
}

/// Build one [`JitFunction`] per subroutine entry recorded in `cfg`.
pub fn lift_program(
    insns: &[Instruction],
    cfg: &ControlFlowGraph,
    helpers: &HelperTable,
) -> Result<Vec<JitFunction>, GenerationError> {
    let mut funcs = Vec::with_capacity(cfg.subroutine_entries.len());

    for (func_index, &entry_pc) in cfg.subroutine_entries.iter().enumerate() {
        let entry_block = cfg.pc_to_block[&entry_pc];
        let mut blocks = Vec::new();
        for cfg_block in &cfg.blocks {
            if cfg.owning_subroutine(cfg_block.start_pc) != entry_pc {
                continue;
            }
            let mut instrs = Vec::new();
            for &pc in &cfg_block.pcs {
                if let Some(instr) = lift_instr(pc, insns, helpers)? {
                    instrs.push(instr);
                }
            }
            let last_pc = *cfg_block.pcs.last().unwrap();
            let terminator = lift_terminator(last_pc, insns, &cfg_block.terminator);
            blocks.push(JitBlock {
                id: cfg_block.id,
                start_pc: cfg_block.start_pc,
                instrs,
                terminator,
                predecessors: cfg_block.predecessors.clone(),
            });
        }
        funcs.push(JitFunction { func_index: func_index as u32, entry_pc, entry: entry_block, blocks });
    }

    Ok(funcs)
}
