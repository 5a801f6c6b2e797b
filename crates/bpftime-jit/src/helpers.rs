//! Integer-indexed helper-function table installed at JIT start: an
//! integer-indexed table of function pointers standing in for
//! string-keyed dispatch, failing generation on out-of-range indices.

use rustc_hash::FxHashMap;

/// The fixed five-argument calling convention shared by every helper
/// (GLOSSARY: "Helper function").
pub type HelperFn = extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// Helpers registered by index before a program is compiled. Lookups
/// happen once, during generation; the resolved function address is baked
/// into the generated code rather than re-resolved at call time.
#[derive(Default)]
pub struct HelperTable {
    fns: FxHashMap<u32, HelperFn>,
}

impl HelperTable {
    pub fn new() -> Self {
        HelperTable::default()
    }

    pub fn register(&mut self, index: u32, f: HelperFn) {
        self.fns.insert(index, f);
    }

    pub fn get(&self, index: u32) -> Option<HelperFn> {
        self.fns.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn double_first(a: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> u64 {
        a * 2
    }

    #[test]
    fn registered_helper_is_retrievable_by_index() {
        let mut table = HelperTable::new();
        table.register(7, double_first);
        let f = table.get(7).unwrap();
        assert_eq!(f(21, 0, 0, 0, 0), 42);
    }

    #[test]
    fn unregistered_index_is_none() {
        let table = HelperTable::new();
        assert!(table.get(3).is_none());
    }
}
