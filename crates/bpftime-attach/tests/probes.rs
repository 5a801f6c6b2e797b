//! Integration tests covering the attach manager's probe scenarios. Target
//! functions are ordinary `extern "C"` functions compiled directly into
//! this test binary and resolved by name through the dynamic symbol
//! table, exactly as the attach manager would resolve a uprobe target in
//! a real process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bpftime_attach::{find_function_addr_by_name, AttachManager};
use bpftime_sdk::config::EnvConfig;

fn manager() -> AttachManager {
    AttachManager::new(&EnvConfig::default())
}

#[inline(never)]
#[no_mangle]
pub extern "C" fn __bpftime_test_replace_target(a: u64, b: u64) -> u64 {
    (a << 32) | b
}

#[test]
fn replace_and_revert() {
    let mgr = manager();
    let addr = find_function_addr_by_name(None, "__bpftime_test_replace_target").unwrap();

    let handle = mgr
        .install_replace(
            addr,
            Arc::new(|regs| {
                let args = regs.args();
                args[0].wrapping_add(args[1])
            }),
        )
        .unwrap();
    assert_eq!(__bpftime_test_replace_target(0xabce, 0x1234), 0xabce + 0x1234);
    assert_eq!(__bpftime_test_replace_target(0xabce, 0x1234), 0xacf02);

    mgr.destroy(handle).unwrap();
    assert_eq!(__bpftime_test_replace_target(0xabce, 0x1234), 0xabce00001234);
}

#[inline(never)]
#[no_mangle]
pub extern "C" fn __bpftime_test_stacked_entry_target(a: u64, b: u64) -> u64 {
    a.wrapping_mul(2).wrapping_add(b)
}

#[test]
fn stacked_entry_probes_each_fire_once_in_order() {
    let mgr = manager();
    let addr = find_function_addr_by_name(None, "__bpftime_test_stacked_entry_target").unwrap();

    let counter_a = Arc::new(AtomicU64::new(0));
    let seen_a = Arc::new((AtomicU64::new(0), AtomicU64::new(0)));
    let (ca, sa) = (counter_a.clone(), seen_a.clone());
    let h1 = mgr
        .install_entry(
            addr,
            Arc::new(move |regs| {
                ca.fetch_add(1, Ordering::SeqCst);
                let args = regs.args();
                sa.0.store(args[0], Ordering::SeqCst);
                sa.1.store(args[1], Ordering::SeqCst);
            }),
        )
        .unwrap();

    let counter_b = Arc::new(AtomicU64::new(0));
    let seen_b = Arc::new((AtomicU64::new(0), AtomicU64::new(0)));
    let (cb, sb) = (counter_b.clone(), seen_b.clone());
    let h2 = mgr
        .install_entry(
            addr,
            Arc::new(move |regs| {
                cb.fetch_add(1, Ordering::SeqCst);
                let args = regs.args();
                sb.0.store(args[0], Ordering::SeqCst);
                sb.1.store(args[1], Ordering::SeqCst);
            }),
        )
        .unwrap();

    let result = __bpftime_test_stacked_entry_target(2333, 6666);

    assert_eq!(result, 2333 * 2 + 6666);
    assert_eq!(counter_a.load(Ordering::SeqCst), 1);
    assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    assert_eq!(seen_a.0.load(Ordering::SeqCst), 2333);
    assert_eq!(seen_a.1.load(Ordering::SeqCst), 6666);
    assert_eq!(seen_b.0.load(Ordering::SeqCst), 2333);
    assert_eq!(seen_b.1.load(Ordering::SeqCst), 6666);

    mgr.destroy(h1).unwrap();
    mgr.destroy(h2).unwrap();
}

#[inline(never)]
#[no_mangle]
pub extern "C" fn __bpftime_test_return_probe_target(a: u64, b: u64) -> u64 {
    a.wrapping_mul(2).wrapping_add(b)
}

#[test]
fn return_probe_captures_result() {
    let mgr = manager();
    let addr = find_function_addr_by_name(None, "__bpftime_test_return_probe_target").unwrap();

    let observed = Arc::new(AtomicU64::new(0));
    let o = observed.clone();
    let handle = mgr
        .install_return(
            addr,
            Arc::new(move |regs| {
                o.store(regs.ax, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let result = __bpftime_test_return_probe_target(2333, 6666);
    assert_eq!(result, 11332);
    assert_eq!(observed.load(Ordering::SeqCst), 11332);

    mgr.destroy(handle).unwrap();
}

#[inline(never)]
#[no_mangle]
pub extern "C" fn __bpftime_test_mixed_probe_target(a: u64, b: u64) -> u64 {
    a.wrapping_mul(2).wrapping_add(b)
}

#[test]
fn mixed_uprobe_and_uretprobe_fire_once_per_call() {
    let mgr = manager();
    let addr = find_function_addr_by_name(None, "__bpftime_test_mixed_probe_target").unwrap();

    let entry_hits = Arc::new(AtomicU64::new(0));
    let eh = entry_hits.clone();
    let entry_handle =
        mgr.install_entry(addr, Arc::new(move |_| { eh.fetch_add(1, Ordering::SeqCst); } )).unwrap();

    let return_hits = Arc::new(AtomicU64::new(0));
    let last_result = Arc::new(AtomicU64::new(0));
    let (rh, lr) = (return_hits.clone(), last_result.clone());
    let return_handle = mgr
        .install_return(
            addr,
            Arc::new(move |regs| {
                rh.fetch_add(1, Ordering::SeqCst);
                lr.store(regs.ax, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let pairs: [(u64, u64); 10] = [
        (3, 700),
        (17, 2),
        (500, 999),
        (1, 1),
        (1000, 1000),
        (42, 58),
        (250, 750),
        (999, 0),
        (0, 999),
        (123, 456),
    ];

    for (i, (a, b)) in pairs.iter().enumerate() {
        let result = __bpftime_test_mixed_probe_target(*a, *b);
        assert_eq!(result, a.wrapping_mul(2).wrapping_add(*b));
        assert_eq!(entry_hits.load(Ordering::SeqCst), (i + 1) as u64);
        assert_eq!(return_hits.load(Ordering::SeqCst), (i + 1) as u64);
        assert_eq!(last_result.load(Ordering::SeqCst), result);
    }

    mgr.destroy(entry_handle).unwrap();
    mgr.destroy(return_handle).unwrap();
}

#[test]
fn disabled_manager_resolves_symbols_but_never_patches() {
    let mut cfg = EnvConfig::default();
    cfg.whether_enabled = false;
    let mgr = AttachManager::new(&cfg);
    let handle = mgr
        .install_entry(0x1, Arc::new(|_| panic!("must never run when disabled")))
        .unwrap();
    mgr.destroy(handle).unwrap();
}
