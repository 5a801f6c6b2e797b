//! Program-type tag carried by a Program handle, used for dispatch at
//! attach time and for the `attr.type` field of the snapshot encoding.
//! Numeric values match the upstream wire encoding so snapshots exported
//! by one version remain byte-compatible with another.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ProgType {
    Unspec = 0,
    Kprobe = 2,
    Uprobe = 3,
    Tracepoint = 4,
    Xdp = 5,
    SyscallTracepoint = 6,
}

impl ProgType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => ProgType::Unspec,
            2 => ProgType::Kprobe,
            3 => ProgType::Uprobe,
            4 => ProgType::Tracepoint,
            5 => ProgType::Xdp,
            6 => ProgType::SyscallTracepoint,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}
