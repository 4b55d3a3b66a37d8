//! Block-address → code-pointer table.

use std::sync::RwLock;

use arx_ir::LocationDescriptor;
use rustc_hash::FxHashMap;

/// Entry point of a compiled block within its code buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodePtr(pub *const u8);

// The pointee is immutable executable code once published.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

/// Shared map from location descriptors to compiled entry points.
///
/// Single writer, many readers; readers observe either absence or a
/// fully-formed pointer. Eviction policy is the embedder's business: the
/// only bulk operation is `clear`.
#[derive(Default)]
pub struct BlockCache {
    map: RwLock<FxHashMap<u64, CodePtr>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, descriptor: LocationDescriptor) -> Option<CodePtr> {
        self.map.read().unwrap().get(&descriptor.to_u64()).copied()
    }

    pub fn insert(&self, descriptor: LocationDescriptor, ptr: CodePtr) {
        self.map.write().unwrap().insert(descriptor.to_u64(), ptr);
    }

    pub fn clear(&self) {
        self.map.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_insert_clear() {
        let cache = BlockCache::new();
        let loc = LocationDescriptor::new(0x1000, true, 0);
        assert!(cache.lookup(loc).is_none());

        cache.insert(loc, CodePtr(0x1234 as *const u8));
        assert_eq!(cache.lookup(loc), Some(CodePtr(0x1234 as *const u8)));

        // Same PC, different ISA bit: distinct block.
        let arm = LocationDescriptor::new(0x1000, false, 0);
        assert!(cache.lookup(arm).is_none());

        cache.clear();
        assert!(cache.is_empty());
    }
}
