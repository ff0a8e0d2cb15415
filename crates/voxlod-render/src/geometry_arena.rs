//! Fixed-capacity GPU arena for quad geometry.
//!
//! The arena is split into blocks of `block_quads` quads. Allocations take a
//! contiguous run of whole blocks, found by a first-fit scan of a bitmap.
//! Nothing is ever moved, so fragmentation is accepted; the node cleaner is
//! what keeps free space available.

use std::sync::{Mutex, MutexGuard, PoisonError};

use voxlod_mesh::{QUAD_BYTES, Quad};

/// A live byte range of the arena. Owned by exactly one node and returned
/// to [`BlockAllocator::free`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ArenaAllocation {
    offset_bytes: u64,
    quad_count: u32,
    first_block: u32,
    block_count: u32,
}

impl ArenaAllocation {
    pub fn offset_bytes(&self) -> u64 {
        self.offset_bytes
    }

    /// Offset in quads, as stored in the node record.
    pub fn offset_quads(&self) -> u32 {
        (self.offset_bytes / QUAD_BYTES as u64) as u32
    }

    pub fn quad_count(&self) -> u32 {
        self.quad_count
    }

    pub fn size_bytes(&self) -> u64 {
        u64::from(self.quad_count) * QUAD_BYTES as u64
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }
}

struct Bitmap {
    words: Vec<u64>,
    blocks: u32,
    free: u32,
}

impl Bitmap {
    fn is_used(&self, block: u32) -> bool {
        self.words[(block / 64) as usize] & (1 << (block % 64)) != 0
    }

    fn set_range(&mut self, first: u32, count: u32, used: bool) {
        for block in first..first + count {
            let word = &mut self.words[(block / 64) as usize];
            let bit = 1u64 << (block % 64);
            if used {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }

    /// First run of `count` free blocks.
    fn first_fit(&self, count: u32) -> Option<u32> {
        let mut block = 0;
        let mut run_start = 0;
        let mut run_len = 0;
        while block < self.blocks {
            // Skip whole words of used blocks at word boundaries.
            if block % 64 == 0 && self.words[(block / 64) as usize] == u64::MAX {
                block += 64;
                run_len = 0;
                continue;
            }
            if self.is_used(block) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            block += 1;
        }
        None
    }

    fn largest_free_run(&self) -> u32 {
        let (mut best, mut run) = (0, 0);
        for block in 0..self.blocks {
            if self.is_used(block) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }
}

/// Thread-safe block allocator. All state sits behind one mutex, which is
/// never held across a GPU call.
pub struct BlockAllocator {
    block_quads: u32,
    state: Mutex<Bitmap>,
}

impl BlockAllocator {
    /// An allocator over `capacity_bytes`, rounded down to whole blocks.
    pub fn new(capacity_bytes: u64, block_quads: u32) -> Self {
        let block_quads = block_quads.max(1);
        let block_bytes = u64::from(block_quads) * QUAD_BYTES as u64;
        let blocks = (capacity_bytes / block_bytes).min(u64::from(u32::MAX)) as u32;
        Self {
            block_quads,
            state: Mutex::new(Bitmap {
                words: vec![0; blocks.div_ceil(64) as usize],
                blocks,
                free: blocks,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bitmap> {
        // The bitmap is consistent after every statement, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_bytes(&self) -> u64 {
        u64::from(self.block_quads) * QUAD_BYTES as u64
    }

    /// Reserve space for `quad_count` quads. `None` when no contiguous run
    /// is large enough or `quad_count` is zero.
    pub fn allocate(&self, quad_count: u32) -> Option<ArenaAllocation> {
        if quad_count == 0 {
            return None;
        }
        let blocks = quad_count.div_ceil(self.block_quads);
        let mut state = self.lock();
        if blocks > state.free {
            return None;
        }
        let first = state.first_fit(blocks)?;
        state.set_range(first, blocks, true);
        state.free -= blocks;
        Some(ArenaAllocation {
            offset_bytes: u64::from(first) * self.block_bytes(),
            quad_count,
            first_block: first,
            block_count: blocks,
        })
    }

    /// Release an allocation. Consumes it, so each range is freed once.
    pub fn free(&self, allocation: ArenaAllocation) {
        let mut state = self.lock();
        let end = allocation.first_block + allocation.block_count;
        if end > state.blocks {
            tracing::error!(?allocation, "freeing allocation outside the arena");
            return;
        }
        let all_used = (allocation.first_block..end).all(|b| state.is_used(b));
        if !all_used {
            tracing::error!(?allocation, "freeing a range that is not fully allocated");
        }
        let were_used = (allocation.first_block..end)
            .filter(|&b| state.is_used(b))
            .count() as u32;
        state.set_range(allocation.first_block, allocation.block_count, false);
        state.free += were_used;
    }

    pub fn total_blocks(&self) -> u32 {
        self.lock().blocks
    }

    pub fn free_blocks(&self) -> u32 {
        self.lock().free
    }

    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.total_blocks()) * self.block_bytes()
    }

    pub fn used_bytes(&self) -> u64 {
        let state = self.lock();
        u64::from(state.blocks - state.free) * self.block_bytes()
    }

    /// Longest run of free blocks, a fragmentation indicator.
    pub fn largest_free_run(&self) -> u32 {
        self.lock().largest_free_run()
    }
}

/// The allocator plus the storage buffer the quads live in. A headless
/// arena (no device) only tracks allocations.
pub struct GeometryArena {
    allocator: BlockAllocator,
    buffer: Option<wgpu::Buffer>,
}

impl GeometryArena {
    pub fn new(capacity_bytes: u64, block_quads: u32) -> Self {
        Self {
            allocator: BlockAllocator::new(capacity_bytes, block_quads),
            buffer: None,
        }
    }

    /// An arena backed by a storage buffer on `device`. The capacity is
    /// clamped to what the device can bind in one storage binding.
    pub fn with_device(device: &wgpu::Device, capacity_bytes: u64, block_quads: u32) -> Self {
        let limits = device.limits();
        let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        if capacity_bytes > max {
            tracing::warn!(requested = capacity_bytes, max, "geometry arena clamped to device limit");
        }
        let allocator = BlockAllocator::new(capacity_bytes.min(max), block_quads);
        let size = allocator.capacity_bytes().max(QUAD_BYTES as u64);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lod_geometry_arena"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        tracing::info!(bytes = size, blocks = allocator.total_blocks(), "geometry arena created");
        Self {
            allocator,
            buffer: Some(buffer),
        }
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.as_ref()
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn allocate(&self, quad_count: u32) -> Option<ArenaAllocation> {
        self.allocator.allocate(quad_count)
    }

    pub fn free(&self, allocation: ArenaAllocation) {
        self.allocator.free(allocation);
    }

    /// Copy `quads` into the allocation's range. A no-op when headless.
    pub fn upload(&self, queue: &wgpu::Queue, allocation: &ArenaAllocation, quads: &[Quad]) {
        debug_assert!(quads.len() as u32 <= allocation.quad_count);
        if let Some(buffer) = &self.buffer {
            queue.write_buffer(buffer, allocation.offset_bytes, bytemuck::cast_slice(quads));
        }
    }
}
