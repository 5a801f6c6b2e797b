//! Table and codec errors (the error taxonomy).

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("handler table is full (max {max} slots)")]
    Full { max: usize },
    #[error("identifier {0} is not allocated")]
    NotAllocated(usize),
    #[error("identifier {id} holds a {actual} handler, expected {expected}")]
    TypeMismatch { id: usize, expected: &'static str, actual: &'static str },
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown handler type tag: {0}")]
    UnknownTag(String),
    #[error("insns hex length {actual} does not match cnt*8 ({expected})")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("malformed hex string: {0}")]
    MalformedHex(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
