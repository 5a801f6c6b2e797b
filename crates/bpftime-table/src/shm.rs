//! Named shared memory segment (the external interface): a `/dev/shm/<name>` file mapped
//! with `memmap2`, holding a table-wide spinlock in its first bytes
//! followed by an opaque arena reserved for future cross-process struct
//! sharing (see the "shared-memory layout" note in `table.rs`).
//!
//! Uses `memmap2`'s file-mapping support against a `/dev/shm` path
//! instead of an on-disk binary, so the mapping is visible to every
//! process that opens the same name.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

/// Bytes reserved at the front of the segment for the lock word. The
/// remainder of the segment is an arena reserved for a sum type backed by
/// the shared segment, for future cross-process struct sharing.
pub const LOCK_WORD_SIZE: usize = std::mem::size_of::<AtomicU32>();

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

fn segment_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/shm").join(name)
}

/// A mapped, named shared memory segment plus the process-shared mutex
/// living in its first bytes (the data model: "mutations are guarded by a
/// table-wide mutex").
pub struct ShmSegment {
    mmap: MmapMut,
    name: String,
}

impl ShmSegment {
    /// Open or create the named segment, truncating/growing it to `size`
    /// bytes. `size` must be at least [`LOCK_WORD_SIZE`].
    pub fn open_or_create(name: &str, size: usize) -> std::io::Result<Self> {
        let size = size.max(LOCK_WORD_SIZE);
        let path = segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        log::debug!("mapped shared memory segment {name} ({size} bytes) at {path:?}");
        Ok(ShmSegment { mmap, name: name.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_word(&self) -> &AtomicU32 {
        // Safety: the mapping is at least LOCK_WORD_SIZE bytes and suitably
        // aligned (the segment starts at a page boundary).
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU32) }
    }

    /// Acquire the table-wide mutex. Cross-process-safe: any process that
    /// mapped the same segment contends on the same atomic word.
    pub fn lock(&self) -> ShmGuard<'_> {
        let word = self.lock_word();
        let mut spins = 0u32;
        while word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 100 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        ShmGuard { segment: self }
    }

    /// The arena portion of the segment, past the lock word.
    pub fn arena(&self) -> &[u8] {
        &self.mmap[LOCK_WORD_SIZE..]
    }

    pub fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[LOCK_WORD_SIZE..]
    }
}

/// RAII guard for [`ShmSegment::lock`]; releases the lock word on drop.
pub struct ShmGuard<'a> {
    segment: &'a ShmSegment,
}

impl Drop for ShmGuard<'_> {
    fn drop(&mut self) {
        self.segment.lock_word().store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_handles_to_the_same_segment_see_each_others_writes() {
        let name = format!("bpftime_test_shm_{}", std::process::id());
        let mut a = ShmSegment::open_or_create(&name, 4096).unwrap();
        let b = ShmSegment::open_or_create(&name, 4096).unwrap();
        a.arena_mut()[0] = 0x42;
        assert_eq!(b.arena()[0], 0x42);
        std::fs::remove_file(segment_path(&name)).ok();
    }

    #[test]
    fn lock_excludes_concurrent_acquirers_within_process() {
        let name = format!("bpftime_test_lock_{}", std::process::id());
        let seg = std::sync::Arc::new(ShmSegment::open_or_create(&name, 4096).unwrap());
        let seg2 = seg.clone();
        let guard = seg.lock();
        let handle = std::thread::spawn(move || {
            // This would deadlock if the lock weren't held; prove liveness
            // by dropping the outer guard from the main thread first.
            let _g = seg2.lock();
        });
        drop(guard);
        handle.join().unwrap();
        std::fs::remove_file(segment_path(&name)).ok();
    }
}
