//! eBPF JIT IR -> Cranelift IR lowering: register lowering, ALU, memory,
//! atomics, branches, calls.
//!
//! The eleven abstract registers are eleven stack-resident 64-bit slots,
//! addressed by pointer with register allocation left to the back-end
//! optimizer — so unlike a typical SSA-variable lowering,
//! abstract registers here are plain memory loads/stores through one
//! dedicated stack slot, and Cranelift's `Variable`/phi machinery is not
//! used at all. Every basic block's predecessor set is already known from
//! the control-flow graph before any block is filled, so (unlike a lowering
//! built on `use_var`/`def_var`) there is no need to defer sealing loop
//! headers: every block is sealed once, after the whole function body has
//! been emitted.

use cranelift_codegen::ir::{
    self, condcodes::IntCC, types, AbiParam, AtomicRmwOp, InstBuilder, MemFlags, Signature,
    SourceLoc, StackSlotData, StackSlotKind,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::FunctionBuilder;
use cranelift_module::{FuncId, Module};
use rustc_hash::FxHashMap;

use crate::backend::traits::CodegenError;
use crate::cfg::BlockId;
use crate::helpers::HelperTable;
use crate::ir::{AluWidth, CmpKind, JitFunction, JitInstr, JitTerminator, Reg, RegOrImm};
use crate::opcode::{AluOp, AtomicOp, MemSize};

/// Register-file slot count and per-invocation BPF stack size: eleven
/// 64-bit slots, plus a 512-byte stack area pointed to by r10.
const NUM_REGS: u32 = 11;
const REG_FILE_BYTES: u32 = NUM_REGS * 8;
const BPF_STACK_BYTES: u32 = 512;

fn mem_ty(size: MemSize) -> ir::Type {
    match size {
        MemSize::B => types::I8,
        MemSize::H => types::I16,
        MemSize::W => types::I32,
        MemSize::Dw => types::I64,
    }
}

fn alu_ty(width: AluWidth) -> ir::Type {
    match width {
        AluWidth::W32 => types::I32,
        AluWidth::W64 => types::I64,
    }
}

fn cmp_code(kind: CmpKind) -> Option<IntCC> {
    Some(match kind {
        CmpKind::Eq => IntCC::Equal,
        CmpKind::Ne => IntCC::NotEqual,
        CmpKind::Gt => IntCC::UnsignedGreaterThan,
        CmpKind::Ge => IntCC::UnsignedGreaterThanOrEqual,
        CmpKind::Lt => IntCC::UnsignedLessThan,
        CmpKind::Le => IntCC::UnsignedLessThanOrEqual,
        CmpKind::SGt => IntCC::SignedGreaterThan,
        CmpKind::SGe => IntCC::SignedGreaterThanOrEqual,
        CmpKind::SLt => IntCC::SignedLessThan,
        CmpKind::SLe => IntCC::SignedLessThanOrEqual,
        CmpKind::SetNz => None?,
    })
}

/// The uniform five-argument internal calling convention used for every
/// subroutine, including the one at pc 0 (invoked by the trampoline with
/// r1 = context_ptr, r2 = context_len, r3..r5 = 0). Matches the fixed
/// five-argument shape of a helper call.
pub fn internal_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    for _ in 0..5 {
        sig.params.push(AbiParam::new(types::I64));
    }
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// The program's external ABI:
/// `(context_ptr, context_len) -> int64`.
pub fn entry_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64));
    sig.params.push(AbiParam::new(types::I64));
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

pub struct LoweringContext<'a, 'b, M: Module> {
    func: &'a JitFunction,
    builder: FunctionBuilder<'b>,
    module: &'a M,
    call_conv: CallConv,
    func_ids: &'a FxHashMap<u32, FuncId>,
    entry_block_to_func: &'a FxHashMap<BlockId, u32>,
    helpers: &'a HelperTable,
    block_map: FxHashMap<BlockId, ir::Block>,
    reg_file: ir::StackSlot,
    bpf_stack: ir::StackSlot,
}

impl<'a, 'b, M: Module> LoweringContext<'a, 'b, M> {
    pub fn new(
        func: &'a JitFunction,
        mut builder: FunctionBuilder<'b>,
        module: &'a M,
        call_conv: CallConv,
        func_ids: &'a FxHashMap<u32, FuncId>,
        entry_block_to_func: &'a FxHashMap<BlockId, u32>,
        helpers: &'a HelperTable,
    ) -> Self {
        let reg_file = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            REG_FILE_BYTES,
            3,
        ));
        let bpf_stack = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            BPF_STACK_BYTES,
            3,
        ));
        LoweringContext {
            func,
            builder,
            module,
            call_conv,
            func_ids,
            entry_block_to_func,
            helpers,
            block_map: FxHashMap::default(),
            reg_file,
            bpf_stack,
        }
    }

    fn reg_offset(reg: Reg) -> i32 {
        reg.0 as i32 * 8
    }

    fn load_reg(&mut self, reg: Reg) -> ir::Value {
        self.builder.ins().stack_load(types::I64, self.reg_file, Self::reg_offset(reg))
    }

    fn store_reg(&mut self, reg: Reg, val: ir::Value) {
        self.builder.ins().stack_store(val, self.reg_file, Self::reg_offset(reg));
    }

    /// Load `reg` narrowed to `width` (ALU32 reads only the low 32 bits).
    fn load_reg_width(&mut self, reg: Reg, width: AluWidth) -> ir::Value {
        let full = self.load_reg(reg);
        match width {
            AluWidth::W64 => full,
            AluWidth::W32 => self.builder.ins().ireduce(types::I32, full),
        }
    }

    /// Store a `width`-wide result, zero-extending ALU32 results into the
    /// 64-bit slot — never sign-extend.
    fn store_reg_width(&mut self, reg: Reg, val: ir::Value, width: AluWidth) {
        let full = match width {
            AluWidth::W64 => val,
            AluWidth::W32 => self.builder.ins().uextend(types::I64, val),
        };
        self.store_reg(reg, full);
    }

    fn operand_width(&mut self, rhs: RegOrImm, width: AluWidth) -> ir::Value {
        match rhs {
            RegOrImm::Reg(r) => self.load_reg_width(r, width),
            RegOrImm::Imm(imm) => self.builder.ins().iconst(alu_ty(width), imm as i64),
        }
    }

    /// Mask a shift amount modulo the operand width (documented boundary
    /// behavior: "right shift by a count greater than width is defined as
    /// masking the count modulo width"), applied uniformly to all three
    /// shift ops.
    fn mask_shift_amount(&mut self, amount: ir::Value, width: AluWidth) -> ir::Value {
        let mask = match width {
            AluWidth::W32 => 31,
            AluWidth::W64 => 63,
        };
        let mask_val = self.builder.ins().iconst(alu_ty(width), mask);
        self.builder.ins().band(amount, mask_val)
    }

    /// Consume the builder and lower the whole function.
    pub fn lower(mut self) -> Result<(), CodegenError> {
        for block in &self.func.blocks {
            let cl_block = self.builder.create_block();
            self.block_map.insert(block.id, cl_block);
        }

        let entry_block = self.block_map[&self.func.entry];
        self.builder.switch_to_block(entry_block);
        self.builder.append_block_params_for_function_params(entry_block);
        let params: Vec<ir::Value> = self.builder.block_params(entry_block).to_vec();
        for (i, val) in params.iter().enumerate() {
            self.store_reg(Reg((i + 1) as u8), *val);
        }
        let zero = self.builder.ins().iconst(types::I64, 0);
        self.store_reg(Reg(0), zero);
        for reg_idx in 6..=9u8 {
            self.store_reg(Reg(reg_idx), zero);
        }
        let frame_top = self.builder.ins().stack_addr(types::I64, self.bpf_stack, BPF_STACK_BYTES as i32);
        self.store_reg(Reg(10), frame_top);

        let block_ids: Vec<BlockId> = self.func.blocks.iter().map(|b| b.id).collect();
        for (idx, block_id) in block_ids.iter().enumerate() {
            if idx > 0 {
                let cl_block = self.block_map[block_id];
                self.builder.switch_to_block(cl_block);
            }
            self.lower_block(*block_id)?;
        }

        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    fn lower_block(&mut self, block_id: BlockId) -> Result<(), CodegenError> {
        let block = self.func.block(block_id).clone();
        self.builder.set_srcloc(SourceLoc::new(block.start_pc as u32));
        for instr in &block.instrs {
            self.lower_instr(instr)?;
        }
        self.lower_terminator(&block.terminator)?;
        Ok(())
    }

    fn lower_instr(&mut self, instr: &JitInstr) -> Result<(), CodegenError> {
        match *instr {
            JitInstr::Alu { op, width, dst, rhs } => self.lower_alu(op, width, dst, rhs)?,
            JitInstr::Neg { width, dst } => {
                let v = self.load_reg_width(dst, width);
                let neg = self.builder.ins().ineg(v);
                self.store_reg_width(dst, neg, width);
            }
            JitInstr::Endian { dst, bits, to_be } => self.lower_endian(dst, bits, to_be),
            JitInstr::Load { dst, base, offset, size } => {
                let base_val = self.load_reg(base);
                let ty = mem_ty(size);
                let loaded = self.builder.ins().load(ty, MemFlags::trusted(), base_val, offset as i32);
                let ext =
                    if ty == types::I64 { loaded } else { self.builder.ins().uextend(types::I64, loaded) };
                self.store_reg(dst, ext);
            }
            JitInstr::StoreImm { base, offset, imm, size } => {
                let base_val = self.load_reg(base);
                let ty = mem_ty(size);
                let imm_val = self.builder.ins().iconst(ty, imm as i64);
                self.builder.ins().store(MemFlags::trusted(), imm_val, base_val, offset as i32);
            }
            JitInstr::StoreReg { base, offset, src, size } => {
                let base_val = self.load_reg(base);
                let src_val = self.load_reg(src);
                let ty = mem_ty(size);
                let truncated =
                    if ty == types::I64 { src_val } else { self.builder.ins().ireduce(ty, src_val) };
                self.builder.ins().store(MemFlags::trusted(), truncated, base_val, offset as i32);
            }
            JitInstr::LoadImm64 { dst, value } => {
                let v = self.builder.ins().iconst(types::I64, value);
                self.store_reg(dst, v);
            }
            JitInstr::Atomic { base, offset, src, kind, width, fetch } => {
                self.lower_atomic(base, offset, src, kind.op, width, fetch)?;
            }
            JitInstr::HelperCall { index } => self.lower_helper_call(index)?,
        }
        Ok(())
    }

    fn lower_alu(&mut self, op: AluOp, width: AluWidth, dst: Reg, rhs: RegOrImm) -> Result<(), CodegenError> {
        match op {
            AluOp::Div => return self.lower_div_mod(dst, rhs, width, false),
            AluOp::Mod => return self.lower_div_mod(dst, rhs, width, true),
            AluOp::Neg | AluOp::EndToLe | AluOp::EndToBe => {
                return Err(CodegenError::BackendError(format!("{op:?} is lowered separately")));
            }
            _ => {}
        }
        let lhs = self.load_reg_width(dst, width);
        let rhs_val = self.operand_width(rhs, width);
        let result = match op {
            AluOp::Add => self.builder.ins().iadd(lhs, rhs_val),
            AluOp::Sub => self.builder.ins().isub(lhs, rhs_val),
            AluOp::Mul => self.builder.ins().imul(lhs, rhs_val),
            AluOp::Or => self.builder.ins().bor(lhs, rhs_val),
            AluOp::And => self.builder.ins().band(lhs, rhs_val),
            AluOp::Xor => self.builder.ins().bxor(lhs, rhs_val),
            AluOp::Mov => rhs_val,
            AluOp::Lsh => {
                let amount = self.mask_shift_amount(rhs_val, width);
                self.builder.ins().ishl(lhs, amount)
            }
            AluOp::Rsh => {
                let amount = self.mask_shift_amount(rhs_val, width);
                self.builder.ins().ushr(lhs, amount)
            }
            AluOp::Arsh => {
                let amount = self.mask_shift_amount(rhs_val, width);
                self.builder.ins().sshr(lhs, amount)
            }
            AluOp::Div | AluOp::Mod | AluOp::Neg | AluOp::EndToLe | AluOp::EndToBe => {
                unreachable!("handled above")
            }
        };
        self.store_reg_width(dst, result, width);
        Ok(())
    }

    /// Division/modulo by zero leaves the destination unchanged rather than
    /// trapping (documented boundary behavior). Implemented as a guarded block
    /// rather than a select, since the "unchanged" branch does nothing at
    /// all — the stack slot still holds whatever `dst` held before.
    fn lower_div_mod(&mut self, dst: Reg, rhs: RegOrImm, width: AluWidth, is_mod: bool) -> Result<(), CodegenError> {
        let ty = alu_ty(width);
        let lhs = self.load_reg_width(dst, width);
        let rhs_val = self.operand_width(rhs, width);
        let zero = self.builder.ins().iconst(ty, 0);
        let is_zero = self.builder.ins().icmp(IntCC::Equal, rhs_val, zero);
        let compute_block = self.builder.create_block();
        let merge_block = self.builder.create_block();
        self.builder.ins().brif(is_zero, merge_block, &[], compute_block, &[]);

        self.builder.switch_to_block(compute_block);
        let result = if is_mod {
            self.builder.ins().urem(lhs, rhs_val)
        } else {
            self.builder.ins().udiv(lhs, rhs_val)
        };
        self.store_reg_width(dst, result, width);
        self.builder.ins().jump(merge_block, &[]);

        self.builder.switch_to_block(merge_block);
        Ok(())
    }

    fn lower_endian(&mut self, dst: Reg, bits: u32, to_be: bool) {
        let v = self.load_reg(dst);
        let result = if !to_be {
            // "to little endian" is a no-op on little-endian hosts.
            v
        } else {
            match bits {
                16 => {
                    let t = self.builder.ins().ireduce(types::I16, v);
                    let s = self.builder.ins().bswap(t);
                    self.builder.ins().uextend(types::I64, s)
                }
                32 => {
                    let t = self.builder.ins().ireduce(types::I32, v);
                    let s = self.builder.ins().bswap(t);
                    self.builder.ins().uextend(types::I64, s)
                }
                _ => self.builder.ins().bswap(v),
            }
        };
        self.store_reg(dst, result);
    }

    fn lower_atomic(
        &mut self,
        base: Reg,
        offset: i16,
        src: Reg,
        op: AtomicOp,
        width: MemSize,
        fetch: bool,
    ) -> Result<(), CodegenError> {
        let base_val = self.load_reg(base);
        let addr = self.builder.ins().iadd_imm(base_val, offset as i64);
        let ty = mem_ty(width);

        match op {
            AtomicOp::CmpXchg => {
                let expected_full = self.load_reg(Reg(0));
                let replacement_full = self.load_reg(src);
                let (expected, replacement) = if ty == types::I64 {
                    (expected_full, replacement_full)
                } else {
                    (
                        self.builder.ins().ireduce(ty, expected_full),
                        self.builder.ins().ireduce(ty, replacement_full),
                    )
                };
                let old = self.builder.ins().atomic_cas(MemFlags::trusted(), addr, expected, replacement);
                let old_ext = if ty == types::I64 { old } else { self.builder.ins().uextend(types::I64, old) };
                // The fetch bit writes the pre-operation value back into
                // src_reg; CmpXchg is always a fetch op.
                self.store_reg(src, old_ext);
            }
            AtomicOp::Xchg => {
                let operand = self.atomic_operand(src, ty);
                let old = self.builder.ins().atomic_rmw(ty, MemFlags::trusted(), AtomicRmwOp::Xchg, addr, operand);
                let old_ext = if ty == types::I64 { old } else { self.builder.ins().uextend(types::I64, old) };
                self.store_reg(src, old_ext);
            }
            AtomicOp::Add { .. } | AtomicOp::Or { .. } | AtomicOp::And { .. } | AtomicOp::Xor { .. } => {
                let rmw_op = match op {
                    AtomicOp::Add { .. } => AtomicRmwOp::Add,
                    AtomicOp::Or { .. } => AtomicRmwOp::Or,
                    AtomicOp::And { .. } => AtomicRmwOp::And,
                    AtomicOp::Xor { .. } => AtomicRmwOp::Xor,
                    AtomicOp::Xchg | AtomicOp::CmpXchg => unreachable!("handled above"),
                };
                let operand = self.atomic_operand(src, ty);
                let old = self.builder.ins().atomic_rmw(ty, MemFlags::trusted(), rmw_op, addr, operand);
                if fetch {
                    let old_ext =
                        if ty == types::I64 { old } else { self.builder.ins().uextend(types::I64, old) };
                    self.store_reg(src, old_ext);
                }
            }
        }
        Ok(())
    }

    fn atomic_operand(&mut self, src: Reg, ty: ir::Type) -> ir::Value {
        let full = self.load_reg(src);
        if ty == types::I64 {
            full
        } else {
            self.builder.ins().ireduce(ty, full)
        }
    }

    /// Dispatch through the helper table: the resolved address is baked in
    /// as a constant (resolution happens once, at generation time) and
    /// invoked via an indirect call with the fixed five-argument signature.
    fn lower_helper_call(&mut self, index: u32) -> Result<(), CodegenError> {
        let f = self
            .helpers
            .get(index)
            .ok_or_else(|| CodegenError::BackendError(format!("helper index {index} not registered")))?;
        let addr = f as usize as i64;
        let callee_addr = self.builder.ins().iconst(types::I64, addr);
        let sig = internal_signature(self.call_conv);
        let sig_ref = self.builder.import_signature(sig);
        let args: Vec<ir::Value> = (1..=5).map(|i| self.load_reg(Reg(i))).collect();
        let call = self.builder.ins().call_indirect(sig_ref, callee_addr, &args);
        let result = self.builder.inst_results(call)[0];
        self.store_reg(Reg(0), result);
        Ok(())
    }

    fn lower_terminator(&mut self, term: &JitTerminator) -> Result<(), CodegenError> {
        match term {
            JitTerminator::Return => {
                let r0 = self.load_reg(Reg(0));
                self.builder.ins().return_(&[r0]);
            }
            JitTerminator::Jump(target) => {
                let cl_target = self.block_map[target];
                self.builder.ins().jump(cl_target, &[]);
            }
            JitTerminator::Branch { cmp, width, dst, rhs, true_target, false_target } => {
                let lhs = self.load_reg_width(*dst, *width);
                let rhs_val = self.operand_width(*rhs, *width);
                let cond = match cmp_code(*cmp) {
                    Some(cc) => self.builder.ins().icmp(cc, lhs, rhs_val),
                    None => {
                        let anded = self.builder.ins().band(lhs, rhs_val);
                        let zero = self.builder.ins().iconst(alu_ty(*width), 0);
                        self.builder.ins().icmp(IntCC::NotEqual, anded, zero)
                    }
                };
                let true_block = self.block_map[true_target];
                let false_block = self.block_map[false_target];
                self.builder.ins().brif(cond, true_block, &[], false_block, &[]);
            }
            JitTerminator::Call { target, return_to } => {
                let callee_func_index = *self.entry_block_to_func.get(target).ok_or_else(|| {
                    CodegenError::BackendError(format!("call target block {target:?} is not a subroutine entry"))
                })?;
                let callee_id = self.func_ids[&callee_func_index];
                let callee_ref = self.module.declare_func_in_func(callee_id, self.builder.func);
                let args: Vec<ir::Value> = (1..=5).map(|i| self.load_reg(Reg(i))).collect();
                let call = self.builder.ins().call(callee_ref, &args);
                let result = self.builder.inst_results(call)[0];
                self.store_reg(Reg(0), result);
                let return_block = self.block_map[return_to];
                self.builder.ins().jump(return_block, &[]);
            }
        }
        Ok(())
    }
}
