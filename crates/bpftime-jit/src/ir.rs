//! SSA-adjacent JIT IR for eBPF programs, lifted from the decoded
//! instruction stream plus its control-flow graph. One [`JitFunction`] is
//! built per subroutine (the main entry at pc 0, plus one per BPF-to-BPF
//! call target); each holds the blocks reachable from its entry.

use bpftime_sdk::{Instruction, Register};

use crate::cfg::BlockId;
use crate::opcode::{AluOp, AtomicOp, MemSize};

/// An abstract eBPF register, `0..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub fn from_register(r: Register) -> Self {
        Reg(r.index() as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluWidth {
    W32,
    W64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOrImm {
    Reg(Reg),
    Imm(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    SGt,
    SGe,
    SLt,
    SLe,
    SetNz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicKind {
    pub op: AtomicOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitInstr {
    /// `dst = dst <op> rhs`, 32- or 64-bit. 32-bit results are
    /// zero-extended into the 64-bit register slot.
    Alu { op: AluOp, width: AluWidth, dst: Reg, rhs: RegOrImm },
    /// `dst = -dst`.
    Neg { width: AluWidth, dst: Reg },
    /// Endian conversion of `dst`'s low `bits` bits.
    Endian { dst: Reg, bits: u32, to_be: bool },
    /// `dst = zero_extend(*(base + offset), size)`.
    Load { dst: Reg, base: Reg, offset: i16, size: MemSize },
    /// `*(base + offset) = sign_extend_32(imm)` (ST) or the low bytes of
    /// `imm` when `size != Dw`.
    StoreImm { base: Reg, offset: i16, imm: i32, size: MemSize },
    /// `*(base + offset) = low_bytes(src, size)` (STX).
    StoreReg { base: Reg, offset: i16, src: Reg, size: MemSize },
    /// Two-instruction wide immediate load: `dst = value`.
    LoadImm64 { dst: Reg, value: i64 },
    /// Atomic read-modify-write at `*(base + offset)`.
    Atomic {
        base: Reg,
        offset: i16,
        src: Reg,
        kind: AtomicKind,
        width: MemSize,
        fetch: bool,
    },
    /// Helper call: dispatch through the runtime helper table by index,
    /// arguments in r1..r5, result in r0.
    HelperCall { index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitTerminator {
    /// `exit`: return the value of r0.
    Return,
    /// Unconditional jump / fallthrough.
    Jump(BlockId),
    /// Conditional branch comparing `dst` against `rhs`.
    Branch {
        cmp: CmpKind,
        width: AluWidth,
        dst: Reg,
        rhs: RegOrImm,
        true_target: BlockId,
        false_target: BlockId,
    },
    /// BPF-to-BPF call: invoke the subroutine whose entry is `target`'s
    /// owning subroutine, then continue at `return_to`.
    Call { target: BlockId, return_to: BlockId },
}

#[derive(Debug, Clone)]
pub struct JitBlock {
    pub id: BlockId,
    /// Raw instruction slot index of the block's first instruction. Used to
    /// key the per-program-counter code-address table the generator
    /// returns alongside the callable.
    pub start_pc: usize,
    pub instrs: Vec<JitInstr>,
    pub terminator: JitTerminator,
    pub predecessors: Vec<BlockId>,
}

/// One compiled unit: the main program (pc 0) or a BPF-to-BPF subroutine.
/// `func_index` names the Cranelift-level function; `entry_pc` is the
/// subroutine's first instruction's program counter, used to resolve calls
/// between subroutines.
#[derive(Debug, Clone)]
pub struct JitFunction {
    pub func_index: u32,
    pub entry_pc: usize,
    pub entry: BlockId,
    pub blocks: Vec<JitBlock>,
}

impl JitFunction {
    pub fn block(&self, id: BlockId) -> &JitBlock {
        self.blocks.iter().find(|b| b.id == id).expect("block id within function")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_from_register_maps_r10_to_10() {
        assert_eq!(Reg::from_register(Register::R10), Reg(10));
    }
}
