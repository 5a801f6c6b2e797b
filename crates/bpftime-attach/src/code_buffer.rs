//! Executable memory allocation for generated continuation stubs that
//! re-execute a target's displaced prologue. Mirrors the W^X discipline
//! the JIT backend's Cranelift module already applies to its own
//! generated code: map writable, write, then flip to executable.

use std::io;

/// One page-rounded region of RWX-capable memory holding exactly one
/// generated stub. Freed (`munmap`) on drop.
pub struct CodeBuffer {
    ptr: *mut libc::c_void,
    len: usize,
}

impl CodeBuffer {
    /// Allocate a region sized to hold `code`, write `code` into it, then
    /// make it executable (and no longer writable).
    pub fn emit(code: &[u8]) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = code.len().div_ceil(page_size).max(1) * page_size;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            if libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, len);
                return Err(err);
            }
        }
        Ok(CodeBuffer { ptr, len })
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Overwrite `bytes.len()` bytes of already-mapped, already-executable
/// code at `addr` (a live target function's prologue). Flips the
/// containing pages writable for the duration of the copy and back to
/// executable afterward, matching the W^X discipline `CodeBuffer::emit`
/// applies to freshly allocated stubs.
///
/// # Safety
/// `addr` must point at `bytes.len()` bytes of mapped memory that the
/// caller has already quiesced against concurrent execution (the attach protocol's
/// "concurrency and safety of patching").
pub unsafe fn patch_live_code(addr: usize, bytes: &[u8]) -> io::Result<()> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let page_start = addr & !(page_size - 1);
    let span = (addr + bytes.len()) - page_start;
    let mapped_len = span.div_ceil(page_size) * page_size;

    unsafe {
        if libc::mprotect(
            page_start as *mut libc::c_void,
            mapped_len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        if libc::mprotect(
            page_start as *mut libc::c_void,
            mapped_len,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// The mapping is immutable (PROT_READ|PROT_EXEC) after `emit` returns and
// never inspected again except by the CPU executing it.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_and_runs_a_trivial_function() {
        // `mov eax, 42; ret`
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let buf = CodeBuffer::emit(&code).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(buf.addr()) };
        assert_eq!(f(), 42);
    }
}
