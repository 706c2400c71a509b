//! Size-keyed cache of released device buffers.
//!
//! Deallocated buffers are not returned to the system; they park here keyed
//! by their allocated size and are handed back out for new requests of the
//! same magnitude, skipping the allocator entirely.

use std::collections::BTreeMap;

use metal::Buffer;

/// A released buffer must be at least the requested size to be reused, but
/// never more than twice it, so small requests cannot pin huge buffers.
const REUSE_WASTE_FACTOR: u64 = 2;

#[derive(Default)]
pub struct BufferCache {
    pools: BTreeMap<u64, Vec<Buffer>>,
    total_bytes: u64,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes currently parked in the cache.
    pub fn size(&self) -> u64 {
        self.total_bytes
    }

    /// Take a buffer of at least `size` bytes out of the cache, preferring
    /// the tightest fit. Returns `None` when nothing suitable is cached.
    pub fn reuse(&mut self, size: u64) -> Option<Buffer> {
        let key = {
            let (key, _) = self
                .pools
                .range(size..=size.saturating_mul(REUSE_WASTE_FACTOR))
                .find(|(_, pool)| !pool.is_empty())?;
            *key
        };
        let pool = self.pools.get_mut(&key)?;
        let buffer = pool.pop()?;
        if pool.is_empty() {
            self.pools.remove(&key);
        }
        self.total_bytes -= key;
        Some(buffer)
    }

    /// Park a buffer for later reuse.
    pub fn recycle(&mut self, buffer: Buffer) {
        let key = buffer.length();
        self.total_bytes += key;
        self.pools.entry(key).or_default().push(buffer);
    }

    /// Release every cached buffer.
    pub fn clear(&mut self) {
        self.pools.clear();
        self.total_bytes = 0;
    }

    /// Evict the largest entries until at least `bytes` bytes have been
    /// released.
    pub fn reduce_size(&mut self, bytes: u64) {
        let mut freed = 0u64;
        while freed < bytes {
            let Some((&key, _)) = self.pools.iter().next_back() else {
                break;
            };
            let pool = self.pools.get_mut(&key).expect("pool disappeared");
            if pool.pop().is_some() {
                freed += key;
                self.total_bytes -= key;
            }
            if pool.is_empty() {
                self.pools.remove(&key);
            }
        }
    }
}
