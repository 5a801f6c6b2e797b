//! The handler table itself (the handler table contract): an ordered, slotted collection of
//! [`Handler`] variants indexed by small dense integers, guarded by one
//! table-wide mutex.
//!
//! A single struct of registries behind one lock, collapsed here to the
//! one table-wide mutex the data model and concurrency rules require. The
//! mutex itself is the cross-process [`ShmSegment`] lock; the slot vector
//! is process-local Rust state — the snapshot codec is the documented
//! cross-process handoff mechanism, since live struct sharing across the
//! process boundary is out of scope for this crate (see `DESIGN.md`).

use bpftime_sdk::{EnvConfig, ProgType};
use parking_lot::Mutex;

use crate::error::TableError;
use crate::shm::ShmSegment;
use crate::slot::{
    EpollHandle, Handler, LinkHandle, MapAttr, MapHandle, MapStorage, MapType, PerfEventHandle,
    PerfEventType, ProgramHandle,
};
use bpftime_sdk::Instruction;

/// Default maximum table size (the handler table contract).
pub const DEFAULT_MAX_SIZE: usize = 65536;

/// Size, in bytes, of the named segment mapped purely to host the
/// cross-process lock word (the external interface's segment also nominally holds "a
/// mutex, an allocator arena"; the arena is reserved but unused by this
/// implementation, see module doc).
const SEGMENT_SIZE: usize = 4096;

struct TableInner {
    slots: Vec<Option<Handler>>,
}

impl TableInner {
    fn alloc(&mut self, handler: Handler, max_size: usize) -> Result<usize, TableError> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(handler);
            return Ok(idx);
        }
        if self.slots.len() >= max_size {
            log::warn!("handler table exhausted at {max_size} slots");
            return Err(TableError::Full { max: max_size });
        }
        self.slots.push(Some(handler));
        Ok(self.slots.len() - 1)
    }
}

/// The handler table (the handler table contract).
pub struct HandlerTable {
    shm: ShmSegment,
    inner: Mutex<TableInner>,
    max_size: usize,
}

impl HandlerTable {
    /// Open (or create) the named shared memory segment from `cfg` and
    /// start with an empty table bounded by `max_size`.
    pub fn new(cfg: &EnvConfig, max_size: usize) -> std::io::Result<Self> {
        let shm = ShmSegment::open_or_create(&cfg.shared_memory_name, SEGMENT_SIZE)?;
        Ok(HandlerTable { shm, inner: Mutex::new(TableInner { slots: Vec::new() }), max_size })
    }

    /// Convenience constructor using [`DEFAULT_MAX_SIZE`].
    pub fn with_defaults(cfg: &EnvConfig) -> std::io::Result<Self> {
        Self::new(cfg, DEFAULT_MAX_SIZE)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut TableInner) -> R) -> R {
        let _guard = self.shm.lock();
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    pub fn add_program(
        &self,
        name: &str,
        prog_type: ProgType,
        insns: Vec<Instruction>,
    ) -> Result<usize, TableError> {
        let handler = Handler::Program(ProgramHandle {
            prog_type,
            name: name.to_string(),
            insns,
            attach_targets: Vec::new(),
        });
        let max = self.max_size;
        let id = self.with_lock(|inner| inner.alloc(handler, max))?;
        log::debug!("added program {name:?} (prog_type {prog_type:?}) at id {id}");
        Ok(id)
    }

    pub fn add_map(&self, name: &str, attr: MapAttr) -> Result<usize, TableError> {
        let map_type = MapType::from_raw(attr.map_type);
        if matches!(map_type, Some(MapType::Hash) | Some(MapType::PerCpuHash)) && attr.key_size == 0
        {
            return Err(TableError::InvariantViolation("hash map key_size must be > 0"));
        }
        let storage = MapStorage::new(map_type.unwrap_or(MapType::Unspec), attr.max_entries, 1);
        let handler = Handler::Map(MapHandle { name: name.to_string(), attr, storage });
        let max = self.max_size;
        let id = self.with_lock(|inner| inner.alloc(handler, max))?;
        log::debug!("added map {name:?} at id {id}");
        Ok(id)
    }

    fn add_perf_event(&self, handle: PerfEventHandle) -> Result<usize, TableError> {
        let max = self.max_size;
        self.with_lock(|inner| inner.alloc(Handler::PerfEvent(handle), max))
    }

    pub fn add_uprobe(
        &self,
        pid: i32,
        module_name: &str,
        offset: u64,
        ref_ctr_offset: u64,
    ) -> Result<usize, TableError> {
        self.add_perf_event(PerfEventHandle {
            event_type: PerfEventType::EntryUprobe,
            module_name: module_name.to_string(),
            offset,
            pid,
            ref_ctr_offset,
            tracepoint_id: -1,
        })
    }

    pub fn add_uretprobe(
        &self,
        pid: i32,
        module_name: &str,
        offset: u64,
        ref_ctr_offset: u64,
    ) -> Result<usize, TableError> {
        self.add_perf_event(PerfEventHandle {
            event_type: PerfEventType::ReturnUprobe,
            module_name: module_name.to_string(),
            offset,
            pid,
            ref_ctr_offset,
            tracepoint_id: -1,
        })
    }

    pub fn add_tracepoint(&self, pid: i32, tracepoint_id: i32) -> Result<usize, TableError> {
        self.add_perf_event(PerfEventHandle {
            event_type: PerfEventType::Tracepoint,
            module_name: String::new(),
            offset: 0,
            pid,
            ref_ctr_offset: 0,
            tracepoint_id,
        })
    }

    pub fn add_link(&self, program_id: usize, target_perf_id: usize) -> Result<usize, TableError> {
        let max = self.max_size;
        self.with_lock(|inner| {
            require_live(inner, program_id, "program")?;
            require_live(inner, target_perf_id, "perf_event")?;
            inner.alloc(Handler::Link(LinkHandle { program_id, target_perf_id }), max)
        })
    }

    pub fn add_epoll(&self) -> Result<usize, TableError> {
        let max = self.max_size;
        self.with_lock(|inner| inner.alloc(Handler::Epoll(EpollHandle), max))
    }

    /// Record that `program_id` is now attached to `perf_id` (the handler table contract:
    /// "fails if either identifier is not live or the program is already
    /// present in the set").
    pub fn add_attach_target(&self, program_id: usize, perf_id: usize) -> Result<(), TableError> {
        self.with_lock(|inner| {
            require_live(inner, perf_id, "perf_event")?;
            let slot = inner
                .slots
                .get_mut(program_id)
                .and_then(|s| s.as_mut())
                .ok_or(TableError::NotAllocated(program_id))?;
            let prog = slot.as_program_mut().ok_or(TableError::TypeMismatch {
                id: program_id,
                expected: "program",
                actual: slot.kind(),
            })?;
            if prog.attach_targets.contains(&perf_id) {
                return Err(TableError::InvariantViolation(
                    "program is already attached to this perf event",
                ));
            }
            prog.attach_targets.push(perf_id);
            Ok(())
        })
    }

    /// Remove the target identifier from a program's attach-set: the
    /// inverse of `add_attach_target`, used by the attach manager on
    /// detach to keep the live-links invariant intact.
    pub fn remove_attach_target(&self, program_id: usize, perf_id: usize) -> Result<(), TableError> {
        self.with_lock(|inner| {
            let slot = inner
                .slots
                .get_mut(program_id)
                .and_then(|s| s.as_mut())
                .ok_or(TableError::NotAllocated(program_id))?;
            let prog = slot.as_program_mut().ok_or(TableError::TypeMismatch {
                id: program_id,
                expected: "program",
                actual: slot.kind(),
            })?;
            prog.attach_targets.retain(|&id| id != perf_id);
            Ok(())
        })
    }

    pub fn remove(&self, id: usize) -> Result<Handler, TableError> {
        self.with_lock(|inner| {
            let slot = inner.slots.get_mut(id).ok_or(TableError::NotAllocated(id))?;
            slot.take().ok_or(TableError::NotAllocated(id))
        })
        .map(|h| {
            log::debug!("removed id {id} ({})", h.kind());
            h
        })
    }

    /// Place `handler` at exactly identifier `id`, growing the slot vector
    /// if needed. Used by the snapshot codec's import path, which must
    /// preserve original identifiers (the snapshot format) rather than allocate
    /// fresh ones. Panics if `id` is already allocated — import is only
    /// meaningful against an empty table or disjoint identifier ranges.
    pub fn insert_at(&self, id: usize, handler: Handler) {
        self.with_lock(|inner| {
            if id >= inner.slots.len() {
                inner.slots.resize(id + 1, None);
            }
            assert!(inner.slots[id].is_none(), "import: identifier {id} already allocated");
            inner.slots[id] = Some(handler);
        });
    }

    pub fn get(&self, id: usize) -> Option<Handler> {
        self.inner.lock().slots.get(id).and_then(|s| s.clone())
    }

    /// Current extent of the index-based view: `is_allocated(i)` is valid
    /// for `i in [0, size())`.
    pub fn size(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_allocated(&self, i: usize) -> bool {
        self.inner.lock().slots.get(i).map(|s| s.is_some()).unwrap_or(false)
    }

    /// Visit every allocated `(id, handler)` pair in ascending id order.
    pub fn iterate(&self, mut f: impl FnMut(usize, &Handler)) {
        let inner = self.inner.lock();
        for (id, slot) in inner.slots.iter().enumerate() {
            if let Some(h) = slot {
                f(id, h);
            }
        }
    }
}

fn require_live(inner: &TableInner, id: usize, _expected: &'static str) -> Result<(), TableError> {
    match inner.slots.get(id).and_then(|s| s.as_ref()) {
        Some(_) => Ok(()),
        None => Err(TableError::NotAllocated(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpftime_sdk::Register;

    fn test_cfg(suffix: &str) -> EnvConfig {
        let mut cfg = EnvConfig::default();
        cfg.shared_memory_name = format!("bpftime_table_test_{}_{}", std::process::id(), suffix);
        cfg
    }

    fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
        Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
    }

    #[test]
    fn lowest_free_slot_is_reused_after_removal() {
        let table = HandlerTable::with_defaults(&test_cfg("reuse")).unwrap();
        let a = table.add_epoll().unwrap();
        let b = table.add_epoll().unwrap();
        assert_eq!((a, b), (0, 1));
        table.remove(a).unwrap();
        let c = table.add_epoll().unwrap();
        assert_eq!(c, 0, "lowest free slot is reused, not appended");
        assert_eq!(table.size(), 2, "removal does not compact the table");
    }

    #[test]
    fn add_attach_target_rejects_dead_identifiers_and_duplicates() {
        let table = HandlerTable::with_defaults(&test_cfg("attach")).unwrap();
        let prog = table
            .add_program(
                "p",
                ProgType::Uprobe,
                vec![insn(0x95, Register::R0.index() as u8, 0, 0, 0)],
            )
            .unwrap();
        let perf = table.add_uprobe(-1, "", 0x1000, 0).unwrap();

        assert!(table.add_attach_target(prog, 999).is_err());
        assert!(table.add_attach_target(999, perf).is_err());

        table.add_attach_target(prog, perf).unwrap();
        assert!(table.add_attach_target(prog, perf).is_err(), "duplicate target must fail");

        let got = table.get(prog).unwrap();
        assert_eq!(got.as_program().unwrap().attach_targets, vec![perf]);
    }

    #[test]
    fn hash_map_requires_nonzero_key_size() {
        let table = HandlerTable::with_defaults(&test_cfg("mapkey")).unwrap();
        let attr = MapAttr {
            map_type: MapType::Hash.as_raw(),
            key_size: 0,
            value_size: 8,
            max_entries: 16,
            flags: 0,
            ifindex: 0,
            btf_vmlinux_value_type_id: 0,
            btf_id: 0,
            btf_key_type_id: 0,
            btf_value_type_id: 0,
            map_extra: 0,
            kernel_bpf_map_id: 0,
        };
        assert!(table.add_map("m", attr).is_err());
    }

    #[test]
    fn iterate_visits_every_allocated_slot_in_order() {
        let table = HandlerTable::with_defaults(&test_cfg("iter")).unwrap();
        table.add_epoll().unwrap();
        let mid = table.add_epoll().unwrap();
        table.add_epoll().unwrap();
        table.remove(mid).unwrap();

        let mut seen = Vec::new();
        table.iterate(|id, _| seen.push(id));
        assert_eq!(seen, vec![0, 2]);
    }
}
