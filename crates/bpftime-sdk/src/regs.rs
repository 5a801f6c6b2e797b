//! Attach-callback register capture ABI (the external interface).

/// Fixed register-capture struct passed by pointer to probe callbacks.
/// Matches the x86-64 integer-argument and return registers plus
/// instruction/stack/base pointers, in the field order the original
/// implementation's `pt_regs`-derived struct uses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegsCapture {
    pub di: u64,
    pub si: u64,
    pub dx: u64,
    pub cx: u64,
    pub r8: u64,
    pub r9: u64,
    pub ax: u64,
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
}

impl RegsCapture {
    /// Integer argument registers in System V x86-64 calling-convention
    /// order, for probes that want to read up to six call arguments.
    pub fn args(&self) -> [u64; 6] {
        [self.di, self.si, self.dx, self.cx, self.r8, self.r9]
    }
}
