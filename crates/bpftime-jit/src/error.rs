//! Generation errors (the error taxonomy): malformed bytecode, illegal branch targets,
//! invalid endian immediates, missing helpers.

use bpftime_sdk::Diagnostic;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("unknown opcode 0x{opcode:02x} at pc={pc}")]
    UnknownOpcode { pc: usize, opcode: u8 },

    #[error("illegal branch target: pc={pc}, target={target}")]
    IllegalBranchTarget { pc: usize, target: i64 },

    #[error("invalid endian immediate {imm} at pc={pc} (must be 16, 32, or 64)")]
    InvalidEndianImmediate { pc: usize, imm: i32 },

    #[error("unregistered helper index {index} at pc={pc}")]
    MissingHelper { pc: usize, index: u32 },

    #[error("call to unresolved subroutine target pc={target} from pc={pc}")]
    UnresolvedCallTarget { pc: usize, target: i64 },

    #[error("{0}")]
    Backend(String),
}

impl GenerationError {
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            GenerationError::UnknownOpcode { pc, .. } => {
                Diagnostic::at("unknown-opcode", self.to_string(), *pc)
            }
            GenerationError::IllegalBranchTarget { pc, .. } => {
                Diagnostic::at("illegal-target", self.to_string(), *pc)
            }
            GenerationError::InvalidEndianImmediate { pc, .. } => {
                Diagnostic::at("invalid-endian-imm", self.to_string(), *pc)
            }
            GenerationError::MissingHelper { pc, .. } => {
                Diagnostic::at("missing-helper", self.to_string(), *pc)
            }
            GenerationError::UnresolvedCallTarget { pc, .. } => {
                Diagnostic::at("unresolved-call", self.to_string(), *pc)
            }
            GenerationError::Backend(msg) => Diagnostic::new("backend-error", msg.clone()),
        }
    }
}
