//! Pooled, short-lived upload memory.
//!
//! The manager carves [`StagingSlice`]s out of large pooled chunks. A chunk
//! with live slices is always referenced by the command list that consumes
//! them, so a chunk whose GPU refcount has dropped to zero provably has no
//! live slices and can be rewound and reused. Chunks are only ever created,
//! rewound, or handed back, never freed mid-frame, which amortizes
//! allocation cost across submissions.

use crate::backend::GpuBackend;
use crate::error::GpuResult;
use crate::format::align_up;
use crate::resource::{BufferDesc, BufferId, BufferResource, BufferUsage, ResourceArena};

/// A sub-range of a pooled upload buffer.
///
/// Valid until the command list that consumes it retires; the manager never
/// hands out overlapping live slices.
#[derive(Clone, Copy, Debug)]
pub struct StagingSlice {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
struct Chunk {
    buffer: BufferId,
    capacity: u64,
    cursor: u64,
}

impl Chunk {
    fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let offset = align_up(self.cursor, alignment);
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        Some(offset)
    }
}

/// Allocates short-lived CPU-writable slices used to stage uploads.
pub struct StagingBufferManager<B: GpuBackend> {
    usage: BufferUsage,
    chunk_size: u64,
    active: Option<Chunk>,
    /// Full (or oversized) chunks waiting for their consuming lists to
    /// retire.
    pending: Vec<Chunk>,
    free: Vec<Chunk>,
    bytes_allocated: u64,
    _backend: std::marker::PhantomData<B>,
}

impl<B: GpuBackend> StagingBufferManager<B> {
    pub fn new(usage: BufferUsage, chunk_size: u64) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            usage,
            chunk_size,
            active: None,
            pending: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            _backend: std::marker::PhantomData,
        }
    }

    /// Total bytes handed out since creation.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    fn new_chunk(
        &mut self,
        backend: &mut B,
        arena: &mut ResourceArena<B>,
        capacity: u64,
    ) -> GpuResult<Chunk> {
        let desc = BufferDesc {
            size: capacity,
            usage: self.usage,
        };
        let native = backend.create_buffer(&desc)?;
        let buffer = arena.insert_buffer(BufferResource { native, desc });
        Ok(Chunk {
            buffer,
            capacity,
            cursor: 0,
        })
    }

    /// Allocate `size` bytes at `alignment`.
    ///
    /// The caller must register `slice.buffer` on the command list that
    /// records the consuming copy; that reference is what keeps the chunk
    /// out of the reuse pool until the device is done with it.
    pub fn allocate(
        &mut self,
        backend: &mut B,
        arena: &mut ResourceArena<B>,
        size: u64,
        alignment: u64,
    ) -> GpuResult<StagingSlice> {
        let alignment = alignment.max(4);
        let size = align_up(size.max(1), 4);

        // Oversized requests get a dedicated chunk.
        if size > self.chunk_size {
            let mut chunk = self.new_chunk(backend, arena, align_up(size, alignment))?;
            let offset = chunk.alloc(size, alignment).expect("fresh oversized chunk");
            let slice = StagingSlice {
                buffer: chunk.buffer,
                offset,
                size,
            };
            self.pending.push(chunk);
            self.bytes_allocated += size;
            return Ok(slice);
        }

        if let Some(chunk) = self.active.as_mut() {
            if let Some(offset) = chunk.alloc(size, alignment) {
                self.bytes_allocated += size;
                return Ok(StagingSlice {
                    buffer: chunk.buffer,
                    offset,
                    size,
                });
            }
            let full = self.active.take().expect("active chunk");
            self.pending.push(full);
        }

        let mut chunk = match self.free.pop() {
            Some(chunk) => chunk,
            None => self.new_chunk(backend, arena, self.chunk_size)?,
        };
        let offset = chunk.alloc(size, alignment).expect("fresh chunk fits request");
        let slice = StagingSlice {
            buffer: chunk.buffer,
            offset,
            size,
        };
        self.active = Some(chunk);
        self.bytes_allocated += size;
        Ok(slice)
    }

    /// Move retired chunks back into the reuse pool.
    ///
    /// A chunk is reusable once no in-flight command list references its
    /// buffer; the device calls this after each retirement sweep.
    pub fn reclaim(&mut self, arena: &ResourceArena<B>) {
        let mut i = 0;
        while i < self.pending.len() {
            if arena.gpu_ref_count(self.pending[i].buffer.into()) == 0 {
                let mut chunk = self.pending.swap_remove(i);
                chunk.cursor = 0;
                self.free.push(chunk);
            } else {
                i += 1;
            }
        }
    }

    /// Number of chunks waiting on in-flight lists. Test/diagnostic hook.
    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// Destroy every pooled chunk. Call only after the queue has drained.
    pub fn destroy(&mut self, arena: &mut ResourceArena<B>) {
        for chunk in self
            .pending
            .drain(..)
            .chain(self.free.drain(..))
            .chain(self.active.take())
        {
            // Deferred automatically if something still holds a reference.
            let _ = arena.destroy(chunk.buffer.into());
        }
    }
}
