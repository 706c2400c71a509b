//! Heap-backed buffer allocator.
//!
//! Buffers are sub-allocated from a growing set of shared-storage MTLHeaps.
//! Heaps whose buffers have all been released can be returned to the system
//! with [`MetalAllocator::clear_empty_heaps`] when an allocation would
//! otherwise fail.

use metal::{Buffer, Heap, HeapDescriptor, MTLResourceOptions, MTLStorageMode};

/// Granularity of newly created heaps. Requests larger than this get a heap
/// of their own.
const HEAP_GRANULARITY: u64 = 64 * 1024 * 1024;

/// Apple Silicon page size; heap sizes are rounded up to it.
const PAGE_SIZE: u64 = 16384;

pub struct MetalAllocator {
    device: metal::Device,
    heaps: Vec<Heap>,
    alignment: u64,
}

impl MetalAllocator {
    pub fn new(device: metal::Device, alignment: u64) -> Self {
        MetalAllocator {
            device,
            heaps: Vec::new(),
            alignment,
        }
    }

    /// Allocate a buffer of exactly `size` bytes from the first heap with
    /// room, growing the heap set if necessary. Returns `None` only when the
    /// device itself refuses the allocation.
    pub fn alloc(&mut self, size: u64) -> Option<Buffer> {
        for heap in &self.heaps {
            if heap.max_available_size(self.alignment) >= size {
                if let Some(buffer) =
                    heap.new_buffer(size, MTLResourceOptions::StorageModeShared)
                {
                    return Some(buffer);
                }
            }
        }

        let heap_size = round_up(size.max(HEAP_GRANULARITY), PAGE_SIZE);
        let descriptor = HeapDescriptor::new();
        descriptor.set_size(heap_size);
        descriptor.set_storage_mode(MTLStorageMode::Shared);
        let heap = self.device.new_heap(&descriptor);
        let buffer = heap.new_buffer(size, MTLResourceOptions::StorageModeShared);
        self.heaps.push(heap);
        buffer
    }

    /// Drop heaps that no longer back any live buffer.
    pub fn clear_empty_heaps(&mut self) {
        self.heaps.retain(|heap| heap.used_size() > 0);
    }
}

fn round_up(value: u64, step: u64) -> u64 {
    value.div_ceil(step) * step
}
