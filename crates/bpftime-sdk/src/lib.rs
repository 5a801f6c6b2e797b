//! Shared domain types for bpftime-rs.
//!
//! Every other crate in the workspace depends on this one for the eBPF
//! instruction encoding, the abstract register set, the attach-callback
//! register-capture ABI, environment configuration, and the common
//! diagnostic shape used by generation/codec errors.

pub mod config;
pub mod diag;
pub mod insn;
pub mod prog_type;
pub mod regs;

pub use config::EnvConfig;
pub use diag::Diagnostic;
pub use insn::{Instruction, Register};
pub use prog_type::ProgType;
pub use regs::RegsCapture;
