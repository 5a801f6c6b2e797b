//! Control-flow reconstruction (the code generation contract).
//!
//! Builds a mapping from program-counter (raw instruction slot index) to
//! basic block. Forced block heads: index 0, any branch target, the
//! instruction immediately following a branch or call, and any explicit
//! call target within the program. The set is computed in one pass, then
//! one basic block is emitted per head and every instruction is assigned to
//! the block of its head.

use bpftime_sdk::Instruction;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::GenerationError;
use crate::opcode::{self, InsnClass, JmpOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgTerminator {
    /// Unconditional jump or fallthrough to a single successor block.
    Jump(BlockId),
    /// Conditional branch: `true_target` taken when the comparison holds,
    /// `false_target` is the fallthrough.
    Branch { true_target: BlockId, false_target: BlockId },
    /// `exit`: return `r0` to the caller.
    Return,
    /// BPF-to-BPF call: invoke the subroutine at `target`, then continue at
    /// `return_to` once it returns.
    Call { target: BlockId, return_to: BlockId },
    /// Block has no instructions assigned past it yet (construction only).
    None,
}

#[derive(Debug, Clone)]
pub struct CfgBlock {
    pub id: BlockId,
    /// Raw instruction slot index of the block's first instruction.
    pub start_pc: usize,
    /// Raw instruction slot indices belonging to this block, in order. Does
    /// not include the continuation slot of a wide immediate load.
    pub pcs: Vec<usize>,
    pub terminator: CfgTerminator,
    pub predecessors: Vec<BlockId>,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<CfgBlock>,
    pub pc_to_block: FxHashMap<usize, BlockId>,
    /// pc=0 plus every BPF-to-BPF call target, in ascending order. Used to
    /// partition blocks into subroutines.
    pub subroutine_entries: Vec<usize>,
}

impl ControlFlowGraph {
    pub fn block(&self, id: BlockId) -> &CfgBlock {
        &self.blocks[id.0]
    }

    /// The subroutine entry pc that owns `pc` (largest entry `<= pc`).
    pub fn owning_subroutine(&self, pc: usize) -> usize {
        *self
            .subroutine_entries
            .iter()
            .rev()
            .find(|&&entry| entry <= pc)
            .unwrap_or(&0)
    }
}

/// Resolve a branch/call-relative target: `pc + 1 + offset`. Returns `None`
/// when the arithmetic would be negative (never a valid instruction index).
fn resolve_target(pc: usize, offset: i64) -> Option<i64> {
    Some(pc as i64 + 1 + offset)
}

pub fn build_cfg(insns: &[Instruction]) -> Result<ControlFlowGraph, GenerationError> {
    let mut block_starts: FxHashSet<usize> = FxHashSet::default();
    let mut subroutine_entries: FxHashSet<usize> = FxHashSet::default();
    block_starts.insert(0);
    subroutine_entries.insert(0);

    let mut pc = 0usize;
    while pc < insns.len() {
        let insn = insns[pc];
        if opcode::is_wide_load(insn) {
            pc += 2;
            continue;
        }
        let class = InsnClass::from_opcode(insn.opcode)
            .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;

        if class.is_jmp() {
            let op = JmpOp::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc, opcode: insn.opcode })?;
            match op {
                JmpOp::Exit => {}
                JmpOp::Call => {
                    if insn.src_reg == 1 {
                        let target = resolve_target(pc, insn.imm as i64)
                            .ok_or(GenerationError::IllegalBranchTarget { pc, target: -1 })?;
                        if target < 0 || target as usize >= insns.len() {
                            return Err(GenerationError::IllegalBranchTarget { pc, target });
                        }
                        block_starts.insert(target as usize);
                        subroutine_entries.insert(target as usize);
                    }
                    if pc + 1 < insns.len() {
                        block_starts.insert(pc + 1);
                    }
                }
                JmpOp::Ja => {
                    let target = resolve_target(pc, insn.offset as i64)
                        .ok_or(GenerationError::IllegalBranchTarget { pc, target: -1 })?;
                    if target < 0 || target as usize >= insns.len() {
                        return Err(GenerationError::IllegalBranchTarget { pc, target });
                    }
                    block_starts.insert(target as usize);
                    if pc + 1 < insns.len() {
                        block_starts.insert(pc + 1);
                    }
                }
                _ => {
                    // Conditional branch: both successors are forced heads.
                    let target = resolve_target(pc, insn.offset as i64)
                        .ok_or(GenerationError::IllegalBranchTarget { pc, target: -1 })?;
                    if target < 0 || target as usize >= insns.len() {
                        return Err(GenerationError::IllegalBranchTarget { pc, target });
                    }
                    block_starts.insert(target as usize);
                    if pc + 1 < insns.len() {
                        block_starts.insert(pc + 1);
                    }
                }
            }
        }
        pc += 1;
    }

    let mut sorted_starts: Vec<usize> = block_starts.into_iter().collect();
    sorted_starts.sort_unstable();

    let mut pc_to_block = FxHashMap::default();
    for (idx, &start) in sorted_starts.iter().enumerate() {
        pc_to_block.insert(start, BlockId(idx));
    }

    // Assign instructions to blocks by scanning forward from each head.
    let mut blocks: Vec<CfgBlock> = sorted_starts
        .iter()
        .enumerate()
        .map(|(idx, &start)| CfgBlock {
            id: BlockId(idx),
            start_pc: start,
            pcs: Vec::new(),
            terminator: CfgTerminator::None,
            predecessors: Vec::new(),
        })
        .collect();

    for (idx, &start) in sorted_starts.iter().enumerate() {
        let end = sorted_starts.get(idx + 1).copied().unwrap_or(insns.len());
        let mut pc = start;
        while pc < end {
            blocks[idx].pcs.push(pc);
            if opcode::is_wide_load(insns[pc]) {
                pc += 2;
            } else {
                pc += 1;
            }
        }
    }

    // Set terminators by inspecting each block's last real instruction.
    for idx in 0..blocks.len() {
        let last_pc = *blocks[idx].pcs.last().expect("block has at least one instruction");
        let insn = insns[last_pc];
        let fallthrough_pc = last_pc + if opcode::is_wide_load(insn) { 2 } else { 1 };
        let fallthrough_block = pc_to_block.get(&fallthrough_pc).copied();

        let class = InsnClass::from_opcode(insn.opcode)
            .ok_or(GenerationError::UnknownOpcode { pc: last_pc, opcode: insn.opcode })?;

        blocks[idx].terminator = if class.is_jmp() {
            let op = JmpOp::from_opcode(insn.opcode)
                .ok_or(GenerationError::UnknownOpcode { pc: last_pc, opcode: insn.opcode })?;
            match op {
                JmpOp::Exit => CfgTerminator::Return,
                JmpOp::Call if insn.src_reg == 1 => {
                    let target = resolve_target(last_pc, insn.imm as i64).unwrap();
                    let target_block = *pc_to_block.get(&(target as usize)).ok_or(
                        GenerationError::UnresolvedCallTarget { pc: last_pc, target },
                    )?;
                    let return_to = fallthrough_block.ok_or(GenerationError::IllegalBranchTarget {
                        pc: last_pc,
                        target: fallthrough_pc as i64,
                    })?;
                    CfgTerminator::Call { target: target_block, return_to }
                }
                JmpOp::Call => {
                    // Helper call: does not affect control flow.
                    CfgTerminator::Jump(fallthrough_block.ok_or(
                        GenerationError::IllegalBranchTarget { pc: last_pc, target: fallthrough_pc as i64 },
                    )?)
                }
                JmpOp::Ja => {
                    let target = resolve_target(last_pc, insn.offset as i64).unwrap();
                    let target_block = *pc_to_block.get(&(target as usize)).ok_or(
                        GenerationError::IllegalBranchTarget { pc: last_pc, target },
                    )?;
                    CfgTerminator::Jump(target_block)
                }
                _ => {
                    let target = resolve_target(last_pc, insn.offset as i64).unwrap();
                    let true_target = *pc_to_block.get(&(target as usize)).ok_or(
                        GenerationError::IllegalBranchTarget { pc: last_pc, target },
                    )?;
                    let false_target = fallthrough_block.ok_or(GenerationError::IllegalBranchTarget {
                        pc: last_pc,
                        target: fallthrough_pc as i64,
                    })?;
                    CfgTerminator::Branch { true_target, false_target }
                }
            }
        } else {
            // Falls through to the next block, if any (last block in the
            // stream with no terminating exit is malformed, but we let the
            // lowering pass catch a missing terminator rather than failing
            // here — a program can legally end right after a call whose
            // fallthrough block does not exist only when it's the final
            // instruction, which real eBPF disallows anyway).
            match fallthrough_block {
                Some(b) => CfgTerminator::Jump(b),
                None => CfgTerminator::Return,
            }
        };
    }

    // Build predecessor lists from successors.
    let successors_of = |term: &CfgTerminator| -> Vec<BlockId> {
        match term {
            CfgTerminator::Jump(b) => vec![*b],
            CfgTerminator::Branch { true_target, false_target } => vec![*true_target, *false_target],
            CfgTerminator::Call { target, return_to } => vec![*target, *return_to],
            CfgTerminator::Return | CfgTerminator::None => vec![],
        }
    };
    let all_terms: Vec<CfgTerminator> = blocks.iter().map(|b| b.terminator.clone()).collect();
    for (idx, term) in all_terms.iter().enumerate() {
        for succ in successors_of(term) {
            blocks[succ.0].predecessors.push(BlockId(idx));
        }
    }

    let mut subroutine_entries: Vec<usize> = subroutine_entries.into_iter().collect();
    subroutine_entries.sort_unstable();

    Ok(ControlFlowGraph { blocks, pc_to_block, subroutine_entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
        Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
    }

    #[test]
    fn single_exit_instruction_is_one_block() {
        let insns = vec![insn(0x95, 0, 0, 0, 0)];
        let cfg = build_cfg(&insns).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].terminator, CfgTerminator::Return);
    }

    #[test]
    fn illegal_branch_target_is_reported_with_locus() {
        // JA offset=+100 as the only instruction: pc=0, target = 0+1+100 = 101
        let insns = vec![insn(0x05, 0, 0, 100, 0)];
        let err = build_cfg(&insns).unwrap_err();
        match err {
            GenerationError::IllegalBranchTarget { pc, target } => {
                assert_eq!(pc, 0);
                assert_eq!(target, 101);
            }
            other => panic!("expected IllegalBranchTarget, got {:?}", other),
        }
    }

    #[test]
    fn conditional_branch_creates_two_successor_blocks() {
        // pc0: JEQ dst,0,+1  (opcode 0x15 = JMP|EQ|K)
        // pc1: exit
        // pc2: exit
        let insns = vec![
            insn(0x15, 1, 0, 1, 0),
            insn(0x95, 0, 0, 0, 0),
            insn(0x95, 0, 0, 0, 0),
        ];
        let cfg = build_cfg(&insns).unwrap();
        assert_eq!(cfg.blocks.len(), 3);
        match cfg.blocks[0].terminator {
            CfgTerminator::Branch { true_target, false_target } => {
                assert_eq!(true_target, BlockId(2));
                assert_eq!(false_target, BlockId(1));
            }
            ref other => panic!("expected Branch, got {:?}", other),
        }
    }
}
