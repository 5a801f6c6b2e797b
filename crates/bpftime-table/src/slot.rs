//! The five handler variants a table slot can hold (the data model), plus the
//! map-type tag and its derived storage shape and the perf-event-type tag.
//!
//! The program handle carries type, instructions, attach ids, and name;
//! the other variants carry the field lists their snapshot encoding needs
//! for map/perf-event/link records.

use bpftime_sdk::{Instruction, ProgType};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Map-type tag; storage shape (hash / array / ring / percpu variants) is
/// derived from it. Numeric values match the upstream `bpf_map_type` wire
/// encoding so snapshots stay interoperable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MapType {
    Unspec = 0,
    Hash = 1,
    Array = 2,
    PerCpuHash = 5,
    PerCpuArray = 6,
    RingBuf = 27,
}

impl MapType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => MapType::Unspec,
            1 => MapType::Hash,
            2 => MapType::Array,
            5 => MapType::PerCpuHash,
            6 => MapType::PerCpuArray,
            27 => MapType::RingBuf,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// The map's keyed storage, shaped by [`MapType`]. Not part of the
/// snapshot (the snapshot format: "up to map storage, which is not part of the
/// snapshot").
#[derive(Debug, Clone)]
pub enum MapStorage {
    Hash(FxHashMap<Vec<u8>, Vec<u8>>),
    Array(Vec<Vec<u8>>),
    PerCpuHash(Vec<FxHashMap<Vec<u8>, Vec<u8>>>),
    PerCpuArray(Vec<Vec<Vec<u8>>>),
    RingBuf(VecDeque<Vec<u8>>),
}

impl MapStorage {
    /// Build the storage shape implied by `map_type`, sized for
    /// `max_entries` where the shape calls for a preallocated collection.
    /// `num_cpus` only matters for the percpu variants.
    pub fn new(map_type: MapType, max_entries: u32, num_cpus: usize) -> Self {
        match map_type {
            MapType::Hash | MapType::Unspec => MapStorage::Hash(FxHashMap::default()),
            MapType::Array => MapStorage::Array(vec![Vec::new(); max_entries as usize]),
            MapType::PerCpuHash => {
                MapStorage::PerCpuHash(vec![FxHashMap::default(); num_cpus.max(1)])
            }
            MapType::PerCpuArray => MapStorage::PerCpuArray(vec![
                vec![Vec::new(); max_entries as usize];
                num_cpus.max(1)
            ]),
            MapType::RingBuf => MapStorage::RingBuf(VecDeque::new()),
        }
    }
}

/// The full attribute set a Map handle carries, matching the upstream
/// `bpf_map_attr` field list in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAttr {
    pub map_type: i32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub ifindex: u32,
    pub btf_vmlinux_value_type_id: u32,
    pub btf_id: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
    pub map_extra: u64,
    pub kernel_bpf_map_id: i32,
}

#[derive(Debug, Clone)]
pub struct ProgramHandle {
    pub prog_type: ProgType,
    pub name: String,
    pub insns: Vec<Instruction>,
    /// Identifiers of perf-event handles this program is currently
    /// attached to (the table invariant on live links).
    pub attach_targets: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct MapHandle {
    pub name: String,
    pub attr: MapAttr,
    pub storage: MapStorage,
}

/// Perf-event-type tag (the data model's `{entry-uprobe, return-uprobe,
/// tracepoint, other}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PerfEventType {
    EntryUprobe = 3,
    ReturnUprobe = 8,
    Tracepoint = 4,
    Other = 0,
}

impl PerfEventType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            3 => PerfEventType::EntryUprobe,
            8 => PerfEventType::ReturnUprobe,
            4 => PerfEventType::Tracepoint,
            0 => PerfEventType::Other,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone)]
pub struct PerfEventHandle {
    pub event_type: PerfEventType,
    /// Target module name (file path), or empty for the main binary.
    pub module_name: String,
    pub offset: u64,
    /// -1 = any pid.
    pub pid: i32,
    /// Reference-counter offset for USDT semaphore increment.
    pub ref_ctr_offset: u64,
    /// Tracepoint identifier, when `event_type == Tracepoint`.
    pub tracepoint_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHandle {
    pub program_id: usize,
    pub target_perf_id: usize,
}

/// A stand-in for an epoll-managed event source; holds no further state at
/// the table level (the data model).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpollHandle;

/// One table slot's contents; exactly one variant per allocated slot
/// (the one-variant-per-slot invariant: "no two variants share a slot").
#[derive(Debug, Clone)]
pub enum Handler {
    Program(ProgramHandle),
    Map(MapHandle),
    PerfEvent(PerfEventHandle),
    Link(LinkHandle),
    Epoll(EpollHandle),
}

impl Handler {
    /// Short name for diagnostics (`TableError::TypeMismatch`).
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Program(_) => "program",
            Handler::Map(_) => "map",
            Handler::PerfEvent(_) => "perf_event",
            Handler::Link(_) => "link",
            Handler::Epoll(_) => "epoll",
        }
    }

    pub fn as_program(&self) -> Option<&ProgramHandle> {
        match self {
            Handler::Program(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_program_mut(&mut self) -> Option<&mut ProgramHandle> {
        match self {
            Handler::Program(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapHandle> {
        match self {
            Handler::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapHandle> {
        match self {
            Handler::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_perf_event(&self) -> Option<&PerfEventHandle> {
        match self {
            Handler::PerfEvent(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkHandle> {
        match self {
            Handler::Link(l) => Some(l),
            _ => None,
        }
    }
}
