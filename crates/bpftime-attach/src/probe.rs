//! Per-address probe state (the attach protocol "Per-address state machine") and the
//! process-wide site registry the shared trampolines (`trampoline.rs`)
//! dispatch through.
//!
//! The registry lives behind a process-wide `once_cell::sync::Lazy`, the
//! same shape used elsewhere in this workspace for global lookup tables.
//! Callbacks are boxed trait objects rather than function pointers, so
//! each address holds an owned sequence of type-erased callables invoked
//! in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bpftime_sdk::regs::RegsCapture;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::code_buffer::CodeBuffer;

pub type EntryCallback = Arc<dyn Fn(&RegsCapture) + Send + Sync>;
pub type ReturnCallback = Arc<dyn Fn(&RegsCapture) + Send + Sync>;
pub type ReplaceCallback = Arc<dyn Fn(&RegsCapture) -> u64 + Send + Sync>;

/// The attach protocol's five address states, derived from which callback lists are
/// populated rather than tracked as a separate field (so it can never
/// drift out of sync with the lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    Unhooked,
    EntryOnly,
    ReturnOnly,
    EntryAndReturn,
    Replaced,
}

pub(crate) struct Site {
    pub addr: usize,
    pub original_bytes: Vec<u8>,
    pub patch_len: usize,
    /// Keeps the per-site hook stub's executable mapping alive for as
    /// long as the site exists; never read again once installed.
    #[allow(dead_code)]
    pub hook_stub: CodeBuffer,
    pub continuation: Option<CodeBuffer>,
    pub continuation_addr: usize,
    pub entries: Vec<(u64, EntryCallback)>,
    pub returns: Vec<(u64, ReturnCallback)>,
    pub replace: Option<(u64, ReplaceCallback)>,
}

impl Site {
    pub fn state(&self) -> AddressState {
        if self.replace.is_some() {
            AddressState::Replaced
        } else {
            match (!self.entries.is_empty(), !self.returns.is_empty()) {
                (true, true) => AddressState::EntryAndReturn,
                (true, false) => AddressState::EntryOnly,
                (false, true) => AddressState::ReturnOnly,
                (false, false) => AddressState::Unhooked,
            }
        }
    }
}

pub(crate) struct RemovedCallback {
    pub site_id: u64,
    pub addr: usize,
    pub new_state: AddressState,
}

static NEXT_SITE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

#[allow(clippy::type_complexity)]
static SITES: Lazy<RwLock<FxHashMap<u64, Arc<Mutex<Site>>>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));
static SITES_BY_ADDR: Lazy<RwLock<FxHashMap<usize, u64>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

pub(crate) fn existing_site_id(addr: usize) -> Option<u64> {
    SITES_BY_ADDR.read().get(&addr).copied()
}

pub(crate) fn state_of(site_id: u64) -> AddressState {
    SITES.read().get(&site_id).map(|s| s.lock().state()).unwrap_or(AddressState::Unhooked)
}

/// Reserve a site id before the hook stub is built, since the stub's
/// machine code has the id baked in as an immediate (`patch::build_hook_stub`)
/// and so must be generated after the id exists but before the site
/// itself is registered.
pub(crate) fn reserve_site_id() -> u64 {
    NEXT_SITE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn allocate_site(
    id: u64,
    addr: usize,
    original_bytes: Vec<u8>,
    patch_len: usize,
    hook_stub: CodeBuffer,
) -> u64 {
    let site = Site {
        addr,
        original_bytes,
        patch_len,
        hook_stub,
        continuation: None,
        continuation_addr: 0,
        entries: Vec::new(),
        returns: Vec::new(),
        replace: None,
    };
    SITES.write().insert(id, Arc::new(Mutex::new(site)));
    SITES_BY_ADDR.write().insert(addr, id);
    id
}

pub(crate) fn set_continuation(site_id: u64, continuation: CodeBuffer) {
    if let Some(site_arc) = SITES.read().get(&site_id).cloned() {
        let mut site = site_arc.lock();
        site.continuation_addr = continuation.addr();
        site.continuation = Some(continuation);
    }
}

fn next_callback_id() -> u64 {
    NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn add_entry(site_id: u64, cb: EntryCallback) -> u64 {
    let id = next_callback_id();
    if let Some(site_arc) = SITES.read().get(&site_id).cloned() {
        site_arc.lock().entries.push((id, cb));
    }
    id
}

pub(crate) fn add_return(site_id: u64, cb: ReturnCallback) -> u64 {
    let id = next_callback_id();
    if let Some(site_arc) = SITES.read().get(&site_id).cloned() {
        site_arc.lock().returns.push((id, cb));
    }
    id
}

pub(crate) fn set_replace(site_id: u64, cb: ReplaceCallback) -> u64 {
    let id = next_callback_id();
    if let Some(site_arc) = SITES.read().get(&site_id).cloned() {
        site_arc.lock().replace = Some((id, cb));
    }
    id
}

/// Remove a single callback by id, wherever it lives. Multiple entry or
/// return callbacks can share an address, so every site is checked.
pub(crate) fn remove_callback(callback_id: u64) -> Option<RemovedCallback> {
    let sites = SITES.read();
    for (&site_id, site_arc) in sites.iter() {
        let mut site = site_arc.lock();
        let entries_before = site.entries.len();
        site.entries.retain(|(id, _)| *id != callback_id);
        let returns_before = site.returns.len();
        site.returns.retain(|(id, _)| *id != callback_id);
        let replace_removed =
            site.replace.as_ref().is_some_and(|(id, _)| *id == callback_id);
        if replace_removed {
            site.replace = None;
        }
        if entries_before != site.entries.len()
            || returns_before != site.returns.len()
            || replace_removed
        {
            return Some(RemovedCallback { site_id, addr: site.addr, new_state: site.state() });
        }
    }
    None
}

/// All callback ids currently installed at `addr`, in no particular
/// order; used by `destroy_by_address`.
pub(crate) fn callback_ids_at(addr: usize) -> Vec<u64> {
    let Some(site_id) = existing_site_id(addr) else {
        return Vec::new();
    };
    let Some(site_arc) = SITES.read().get(&site_id).cloned() else {
        return Vec::new();
    };
    let site = site_arc.lock();
    let mut ids: Vec<u64> = site.entries.iter().map(|(id, _)| *id).collect();
    ids.extend(site.returns.iter().map(|(id, _)| *id));
    if let Some((id, _)) = &site.replace {
        ids.push(*id);
    }
    ids
}

/// Remove a fully-unhooked site from the registry and hand back what's
/// needed to restore the target's original bytes.
pub(crate) fn teardown_site(site_id: u64) -> Option<(usize, Vec<u8>, usize)> {
    let mut sites = SITES.write();
    let site_arc = sites.remove(&site_id)?;
    let site = site_arc.lock();
    SITES_BY_ADDR.write().remove(&site.addr);
    Some((site.addr, site.original_bytes.clone(), site.patch_len))
}

pub(crate) fn on_entry(site_id: u64, regs: &mut RegsCapture) -> usize {
    let Some(site_arc) = SITES.read().get(&site_id).cloned() else {
        return 0;
    };
    let (callbacks, continuation_addr, addr) = {
        let site = site_arc.lock();
        (
            site.entries.iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>(),
            site.continuation_addr,
            site.addr,
        )
    };
    regs.ip = addr as u64;
    for cb in &callbacks {
        cb(regs);
    }
    continuation_addr
}

pub(crate) fn on_return(site_id: u64, regs: &mut RegsCapture) {
    let Some(site_arc) = SITES.read().get(&site_id).cloned() else {
        return;
    };
    let callbacks = {
        let site = site_arc.lock();
        site.returns.iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>()
    };
    for cb in &callbacks {
        cb(regs);
    }
}

pub(crate) fn on_replace(site_id: u64, regs: &RegsCapture) -> u64 {
    let Some(site_arc) = SITES.read().get(&site_id).cloned() else {
        return 0;
    };
    let cb = {
        let site = site_arc.lock();
        site.replace.as_ref().map(|(_, cb)| cb.clone())
    };
    cb.map(|cb| cb(regs)).unwrap_or(0)
}
