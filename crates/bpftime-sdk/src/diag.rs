//! Common diagnostic shape for generation/codec errors (the error taxonomy: "kind +
//! human message + locus").

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: &'static str,
    pub message: String,
    /// Program-counter locus, when the error can be pinned to one
    /// instruction.
    pub locus: Option<usize>,
}

impl Diagnostic {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Diagnostic { kind, message: message.into(), locus: None }
    }

    pub fn at(kind: &'static str, message: impl Into<String>, locus: usize) -> Self {
        Diagnostic { kind, message: message.into(), locus: Some(locus) }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locus {
            Some(pc) => write!(f, "{}: {} (pc={})", self.kind, self.message, pc),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
