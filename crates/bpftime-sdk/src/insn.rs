//! The eBPF instruction encoding: a fixed-width 64-bit word with an opcode,
//! two register indices, a signed 16-bit offset, and a signed 32-bit
//! immediate.

/// One of the eleven abstract eBPF registers. `R10` is the read-only frame
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
}

impl Register {
    /// Decode a 4-bit register field. Values above 10 are not valid eBPF
    /// registers; callers that accept untrusted nibbles should check
    /// `raw <= 10` first.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Register::R0,
            1 => Register::R1,
            2 => Register::R2,
            3 => Register::R3,
            4 => Register::R4,
            5 => Register::R5,
            6 => Register::R6,
            7 => Register::R7,
            8 => Register::R8,
            9 => Register::R9,
            10 => Register::R10,
            _ => return None,
        })
    }

    pub fn index(self) -> usize {
        match self {
            Register::R0 => 0,
            Register::R1 => 1,
            Register::R2 => 2,
            Register::R3 => 3,
            Register::R4 => 4,
            Register::R5 => 5,
            Register::R6 => 6,
            Register::R7 => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
        }
    }

    pub fn is_frame_pointer(self) -> bool {
        matches!(self, Register::R10)
    }
}

/// A single decoded eBPF instruction. `dst_reg`/`src_reg` are kept as raw
/// nibbles rather than `Register` so that instruction-stream decoding can
/// report an illegal-register diagnostic at the point of use instead of
/// failing to even represent the bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub dst_reg: u8,
    pub src_reg: u8,
    pub offset: i16,
    pub imm: i32,
}

impl Instruction {
    pub const SIZE: usize = 8;

    /// Decode one instruction from its 8-byte little-endian wire encoding:
    /// `opcode(1) | dst_reg:src_reg(1, packed nibbles) | offset(2, LE) | imm(4, LE)`.
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Instruction {
            opcode: bytes[0],
            dst_reg: bytes[1] & 0x0f,
            src_reg: (bytes[1] >> 4) & 0x0f,
            offset: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.opcode;
        out[1] = (self.dst_reg & 0x0f) | ((self.src_reg & 0x0f) << 4);
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    /// Decode an entire program from its raw byte buffer. `buf.len()` must
    /// be a multiple of 8; the caller (handler table) enforces this at
    /// insertion time.
    pub fn decode_program(buf: &[u8]) -> Vec<Instruction> {
        buf.chunks_exact(Instruction::SIZE)
            .map(|chunk| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(chunk);
                Instruction::from_bytes(&arr)
            })
            .collect()
    }

    pub fn encode_program(insns: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::with_capacity(insns.len() * Instruction::SIZE);
        for insn in insns {
            out.extend_from_slice(&insn.to_bytes());
        }
        out
    }

    /// Low three bits of the opcode classify the instruction.
    pub fn opcode_class(self) -> u8 {
        self.opcode & 0x07
    }

    /// Bit 0x08 of the opcode: clear selects the sign-extended immediate,
    /// set selects the source register.
    pub fn uses_src_reg(self) -> bool {
        self.opcode & 0x08 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let insn = Instruction {
            opcode: 0x07,
            dst_reg: 3,
            src_reg: 0,
            offset: -1,
            imm: 0x1234,
        };
        let bytes = insn.to_bytes();
        assert_eq!(Instruction::from_bytes(&bytes), insn);
    }

    #[test]
    fn decode_program_splits_on_eight_bytes() {
        let insns = vec![
            Instruction { opcode: 0x07, dst_reg: 0, src_reg: 0, offset: 0, imm: 1 },
            Instruction { opcode: 0x95, dst_reg: 0, src_reg: 0, offset: 0, imm: 0 },
        ];
        let buf = Instruction::encode_program(&insns);
        assert_eq!(buf.len(), 16);
        assert_eq!(Instruction::decode_program(&buf), insns);
    }
}
