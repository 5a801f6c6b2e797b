//! Public attach-manager API (the attach protocol contract): resolve a symbol,
//! install entry/return/replace probes on its address, destroy them
//! individually or all at once.
//!
//! The installation sequence (scan prologue, quiesce, patch, resume)
//! matches the protocol's own ordering, and failures roll back any
//! partial state before surfacing to the caller.

use std::slice;

use bpftime_sdk::config::EnvConfig;

use crate::code_buffer::{self, CodeBuffer};
use crate::error::AttachError;
use crate::patch;
use crate::probe::{self, AddressState, EntryCallback, ReplaceCallback, ReturnCallback};
use crate::prologue;
use crate::quiesce;
use crate::symbol;
use crate::trampoline;

/// Handle returned by every `install_*` call; pass to [`AttachManager::destroy`]
/// to remove exactly that callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHandle {
    site_id: u64,
    callback_id: u64,
}

/// How far past `addr` the prologue scanner is allowed to look while
/// searching for enough whole instructions to cover the hook stub.
const SCAN_WINDOW: usize = 32;

pub struct AttachManager {
    enabled: bool,
}

impl AttachManager {
    pub fn new(config: &EnvConfig) -> Self {
        AttachManager { enabled: config.whether_enabled }
    }

    /// Resolve `name` (optionally scoped to an already-loaded `module`) to
    /// an address, per the attach protocol installation mechanism part (a).
    pub fn resolve(&self, module: Option<&str>, name: &str) -> Result<usize, AttachError> {
        symbol::find_function_addr_by_name(module, name)
    }

    pub fn install_entry(
        &self,
        addr: usize,
        callback: EntryCallback,
    ) -> Result<ProbeHandle, AttachError> {
        if !self.enabled {
            return Ok(ProbeHandle { site_id: 0, callback_id: 0 });
        }
        let site_id = self.entry_capable_site(addr)?;
        let callback_id = probe::add_entry(site_id, callback);
        log::info!("installed entry probe at {addr:#x} (site {site_id}, callback {callback_id})");
        Ok(ProbeHandle { site_id, callback_id })
    }

    pub fn install_return(
        &self,
        addr: usize,
        callback: ReturnCallback,
    ) -> Result<ProbeHandle, AttachError> {
        if !self.enabled {
            return Ok(ProbeHandle { site_id: 0, callback_id: 0 });
        }
        let site_id = self.entry_capable_site(addr)?;
        let callback_id = probe::add_return(site_id, callback);
        log::info!("installed return probe at {addr:#x} (site {site_id}, callback {callback_id})");
        Ok(ProbeHandle { site_id, callback_id })
    }

    pub fn install_replace(
        &self,
        addr: usize,
        callback: ReplaceCallback,
    ) -> Result<ProbeHandle, AttachError> {
        if !self.enabled {
            return Ok(ProbeHandle { site_id: 0, callback_id: 0 });
        }
        if probe::existing_site_id(addr).is_some() {
            return Err(AttachError::ReplaceConflict { addr });
        }
        let site_id = self.patch_new_site(addr, trampoline::replace_trampoline as usize, false)?;
        let callback_id = probe::set_replace(site_id, callback);
        log::info!("installed replace probe at {addr:#x} (site {site_id}, callback {callback_id})");
        Ok(ProbeHandle { site_id, callback_id })
    }

    /// Find or create an entry/return-capable site at `addr`,
    /// transitioning it per the protocol's "install-entry: any state except
    /// replaced" / "install-return: symmetric" rule.
    fn entry_capable_site(&self, addr: usize) -> Result<u64, AttachError> {
        if let Some(site_id) = probe::existing_site_id(addr) {
            if probe::state_of(site_id) == AddressState::Replaced {
                return Err(AttachError::AddressIsReplaced { addr });
            }
            return Ok(site_id);
        }
        self.patch_new_site(addr, trampoline::entry_trampoline as usize, true)
    }

    /// Overwrite `addr`'s prologue with a hook stub pointing at
    /// `trampoline_addr`, under quiescence, rolling back on any failure
    /// before the patch is committed (the error taxonomy "installation rolled back").
    fn patch_new_site(
        &self,
        addr: usize,
        trampoline_addr: usize,
        needs_continuation: bool,
    ) -> Result<u64, AttachError> {
        let window = unsafe { slice::from_raw_parts(addr as *const u8, SCAN_WINDOW) };
        let patch_len = prologue::prologue_length(window, patch::HOOK_STUB_LEN)
            .ok_or(AttachError::UnsupportedTarget { addr })?;
        let original_bytes = window[..patch_len].to_vec();

        let site_id = probe::reserve_site_id();
        log::debug!("patching site {site_id} at {addr:#x} ({patch_len} prologue bytes)");
        let hook_code = patch::build_hook_stub(site_id, trampoline_addr);
        let hook_stub = CodeBuffer::emit(&hook_code)
            .map_err(|e| AttachError::BackendError(format!("hook stub allocation: {e}")))?;
        let hook_addr = hook_stub.addr();

        if needs_continuation {
            let resume_addr = addr + patch_len;
            let continuation_code = patch::build_continuation_stub(&original_bytes, resume_addr);
            let continuation = CodeBuffer::emit(&continuation_code).map_err(|e| {
                AttachError::BackendError(format!("continuation stub allocation: {e}"))
            })?;
            probe::allocate_site(site_id, addr, original_bytes, patch_len, hook_stub);
            probe::set_continuation(site_id, continuation);
        } else {
            probe::allocate_site(site_id, addr, original_bytes, patch_len, hook_stub);
        }

        let patch_code = patch::encode_movabs_r11_jmp(hook_addr);
        let result = quiesce::with_quiescence(|| unsafe {
            code_buffer::patch_live_code(addr, &patch_code)
        });
        // The hook jump is exactly `patch::HOOK_STUB_LEN` bytes; any extra
        // bytes within `patch_len` belong to whichever original
        // instruction the scanner included to reach a whole-instruction
        // boundary and are left untouched in the target (they are still
        // restored verbatim on teardown, since `original_bytes` captured
        // the full `patch_len` span).
        if let Err(e) = result {
            log::warn!("prologue patch at {addr:#x} failed, rolling back site {site_id}: {e}");
            probe::teardown_site(site_id);
            return Err(AttachError::BackendError(format!("prologue patch failed: {e}")));
        }
        Ok(site_id)
    }

    pub fn destroy(&self, handle: ProbeHandle) -> Result<(), AttachError> {
        if !self.enabled {
            return Ok(());
        }
        let removed = probe::remove_callback(handle.callback_id)
            .ok_or(AttachError::NoSuchProbeId(handle.callback_id))?;
        log::info!("destroyed callback {} on site {}", handle.callback_id, removed.site_id);
        if removed.new_state == AddressState::Unhooked {
            self.revert(removed.site_id)?;
        }
        Ok(())
    }

    pub fn destroy_by_address(&self, addr: usize) -> Result<(), AttachError> {
        if !self.enabled {
            return Ok(());
        }
        let site_id = probe::existing_site_id(addr).ok_or(AttachError::NoSuchProbe { addr })?;
        for callback_id in probe::callback_ids_at(addr) {
            probe::remove_callback(callback_id);
        }
        log::info!("destroyed all callbacks at {addr:#x} (site {site_id})");
        self.revert(site_id)
    }

    fn revert(&self, site_id: u64) -> Result<(), AttachError> {
        let Some((addr, original_bytes, _patch_len)) = probe::teardown_site(site_id) else {
            return Ok(());
        };
        log::debug!("reverting site {site_id} at {addr:#x} to its original prologue");
        quiesce::with_quiescence(|| unsafe { code_buffer::patch_live_code(addr, &original_bytes) })
            .map_err(|e| AttachError::BackendError(format!("prologue revert failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn config(enabled: bool) -> EnvConfig {
        let mut c = EnvConfig::default();
        c.whether_enabled = enabled;
        c
    }

    #[test]
    fn disabled_manager_is_a_no_op() {
        let mgr = AttachManager::new(&config(false));
        let hits = Arc::new(AtomicU64::new(0));
        let h2 = hits.clone();
        let handle = mgr
            .install_entry(0x1000, Arc::new(move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        mgr.destroy(handle).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unresolvable_symbol_is_not_found() {
        let mgr = AttachManager::new(&config(true));
        let err = mgr.resolve(None, "__definitely_not_a_real_symbol__").unwrap_err();
        assert!(matches!(err, AttachError::SymbolNotFound { .. }));
    }
}
