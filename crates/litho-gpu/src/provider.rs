//! Factory and recycling pools for command lists and pipeline objects.
//!
//! Command lists and pipeline state objects are expensive to create, so both
//! are pooled for the lifetime of the device: retired lists are rewound and
//! reused, pipelines are cached by key and only torn down with the device.

use std::collections::HashMap;

use crate::backend::GpuBackend;
use crate::cmd::CommandList;
use crate::error::GpuResult;
use crate::format::PixelFormat;
use crate::resource::{BufferId, ResourceArena};

/// Handle into the device's pipeline cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u32);

/// Key describing a pipeline state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Color target format the pipeline renders into.
    pub target_format: PixelFormat,
    pub sample_count: u32,
}

/// Where the most recent uniform block for a pipeline was staged.
#[derive(Clone, Copy, Debug)]
struct UniformBlock {
    value: [f32; 4],
    buffer: BufferId,
    offset: u64,
}

struct PipelineSlot<B: GpuBackend> {
    native: B::Pipeline,
    /// Last uniform block uploaded for this pipeline, or `None` when the
    /// cache is dirty and the next draw must re-upload.
    uniforms: Option<UniformBlock>,
}

/// Lookup table handed to backends when sealing a recorded op stream.
pub struct PipelineTable<B: GpuBackend> {
    slots: Vec<PipelineSlot<B>>,
}

impl<B: GpuBackend> PipelineTable<B> {
    pub fn native(&self, id: PipelineId) -> Option<&B::Pipeline> {
        self.slots.get(id.0 as usize).map(|s| &s.native)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Per-device pool of command lists and pipeline objects.
pub struct ResourceProvider<B: GpuBackend> {
    free_lists: Vec<CommandList<B>>,
    lists_created: u64,
    lists_recycled: u64,
    pipelines_by_key: HashMap<PipelineKey, PipelineId>,
    table: PipelineTable<B>,
}

impl<B: GpuBackend> ResourceProvider<B> {
    pub fn new() -> Self {
        Self {
            free_lists: Vec::new(),
            lists_created: 0,
            lists_recycled: 0,
            pipelines_by_key: HashMap::new(),
            table: PipelineTable { slots: Vec::new() },
        }
    }

    /// A recording-ready command list, recycled when possible.
    pub fn find_or_create_command_list(&mut self) -> CommandList<B> {
        match self.free_lists.pop() {
            Some(list) => list,
            None => {
                self.lists_created += 1;
                CommandList::new()
            }
        }
    }

    /// Rewind a retired (or discarded) list and return it to the pool.
    pub fn recycle_command_list(&mut self, mut list: CommandList<B>, arena: &mut ResourceArena<B>) {
        list.reset(arena);
        self.lists_recycled += 1;
        self.free_lists.push(list);
    }

    pub fn lists_created(&self) -> u64 {
        self.lists_created
    }

    pub fn lists_recycled(&self) -> u64 {
        self.lists_recycled
    }

    pub fn find_or_create_pipeline(
        &mut self,
        backend: &mut B,
        key: PipelineKey,
    ) -> GpuResult<PipelineId> {
        if let Some(&id) = self.pipelines_by_key.get(&key) {
            return Ok(id);
        }
        let native = backend.create_pipeline(&key)?;
        let id = PipelineId(self.table.slots.len() as u32);
        self.table.slots.push(PipelineSlot {
            native,
            uniforms: None,
        });
        self.pipelines_by_key.insert(key, id);
        Ok(id)
    }

    pub fn pipelines(&self) -> &PipelineTable<B> {
        &self.table
    }

    /// The staged location of `value` for this pipeline, if the last upload
    /// still matches. `None` means the caller must stage a fresh block and
    /// report it back via [`store_uniform_binding`](Self::store_uniform_binding).
    pub fn cached_uniform_binding(
        &self,
        id: PipelineId,
        value: [f32; 4],
    ) -> Option<(BufferId, u64)> {
        let slot = &self.table.slots[id.0 as usize];
        slot.uniforms
            .filter(|u| u.value == value)
            .map(|u| (u.buffer, u.offset))
    }

    pub fn store_uniform_binding(
        &mut self,
        id: PipelineId,
        value: [f32; 4],
        buffer: BufferId,
        offset: u64,
    ) {
        self.table.slots[id.0 as usize].uniforms = Some(UniformBlock {
            value,
            buffer,
            offset,
        });
    }

    /// Submission-boundary bookkeeping: a new command list carries no
    /// CPU-side assumptions about bound device state, so every pipeline's
    /// cached uniform block is invalidated.
    pub fn prep_for_submit(&mut self) {
        for slot in &mut self.table.slots {
            slot.uniforms = None;
        }
    }
}

impl<B: GpuBackend> Default for ResourceProvider<B> {
    fn default() -> Self {
        Self::new()
    }
}
