//! Resolve a function name to an address using the dynamic loader's symbol
//! tables, including loaded shared objects (the attach protocol installation
//! mechanism, part (a)).
//!
//! `find_function_addr_by_name` resolves targets such as
//! `__bpftime_func_to_replace`/`__test_simple_add` before installing
//! probes on them, built directly on `libc`'s `dlsym`/`dlopen` — already a
//! dependency of this crate, just newly used here for `dlsym` instead of
//! native-module FFI.

use std::ffi::CString;

use crate::error::AttachError;

/// Resolve `name` to a function address.
///
/// `module` names a shared object already loaded into the process (a file
/// path, matching the data model's perf-event "target module name"); `None`
/// searches the main binary and every already-loaded shared object via
/// `RTLD_DEFAULT`.
pub fn find_function_addr_by_name(module: Option<&str>, name: &str) -> Result<usize, AttachError> {
    let cname = CString::new(name).map_err(|_| AttachError::SymbolNotFound {
        module: module.map(String::from),
        name: name.to_string(),
    })?;

    let handle = match module {
        None => libc::RTLD_DEFAULT,
        Some(path) => {
            let cpath = CString::new(path).map_err(|_| AttachError::SymbolNotFound {
                module: Some(path.to_string()),
                name: name.to_string(),
            })?;
            // RTLD_NOLOAD: only resolve against a module already mapped
            // into this process; the attach manager never loads new code.
            let h = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
            if h.is_null() {
                return Err(AttachError::SymbolNotFound {
                    module: Some(path.to_string()),
                    name: name.to_string(),
                });
            }
            h
        }
    };

    let addr = unsafe { libc::dlsym(handle, cname.as_ptr()) };
    if addr.is_null() {
        return Err(AttachError::SymbolNotFound {
            module: module.map(String::from),
            name: name.to_string(),
        });
    }
    Ok(addr as usize)
}

/// Reverse-resolve an address to the module that maps it, via `dladdr`.
/// Returns `None` when the address isn't inside any mapped shared object
/// (e.g. the main executable on some platforms, or heap/stack/JIT memory).
pub fn module_containing(addr: usize) -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) };
    Some(cstr.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_libc_symbol_from_the_default_scope() {
        // `getpid` is guaranteed linked into any process on a unix host.
        let addr = find_function_addr_by_name(None, "getpid").unwrap();
        assert_ne!(addr, 0);
    }

    #[test]
    fn unknown_symbol_is_not_found() {
        let err = find_function_addr_by_name(None, "__definitely_not_a_real_symbol__").unwrap_err();
        assert!(matches!(err, AttachError::SymbolNotFound { .. }));
    }
}
