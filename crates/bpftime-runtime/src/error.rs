//! Aggregating error type for the runtime facade (the error taxonomy, `SPEC_FULL.md`
//! §10 "error handling").
//!
//! Lives here rather than in `bpftime-sdk` because `bpftime-sdk` is a
//! dependency *of* `bpftime-jit`/`bpftime-table`/`bpftime-attach`, not the
//! reverse (see `DESIGN.md`'s correction note); this is the one crate that
//! legitimately depends on all three subsystem errors and can wrap them.

use bpftime_attach::AttachError;
use bpftime_jit::GenerationError;
use bpftime_table::{CodecError, TableError};

#[derive(Debug, thiserror::Error)]
pub enum BpftimeError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("program {0} has no compiled code cached and is not a program handle")]
    NotAProgram(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
