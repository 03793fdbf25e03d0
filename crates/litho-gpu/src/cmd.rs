//! Backend-agnostic recorded command stream and the command-list lifecycle.
//!
//! A [`CommandList`] moves through `Recording → Closed → Submitted →
//! Retired`. While recording it accumulates [`Op`]s, the set of resources
//! the ops reference, and a batch of pending resource barriers. Barriers are
//! not flushed at the call site: native APIs charge a fixed cost per barrier
//! submission, and coalescing everything issued between two points of actual
//! GPU work cannot change observed ordering on a single command stream. The
//! batch is flushed immediately before any affected operation and
//! unconditionally when the list is closed.

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::format::{Rect, SubresourceFootprint};
use crate::provider::PipelineId;
use crate::resource::{BufferId, FinishedCallback, ResourceArena, ResourceId, TextureId};
use crate::state::BarrierTransition;

/// What happens to a render-pass color target when the pass opens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp {
    Load,
    Clear([f32; 4]),
}

/// One recorded operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// A flushed batch of state transitions.
    Barriers(Vec<BarrierTransition>),
    CopyBufferToTexture {
        src: BufferId,
        dst: TextureId,
        /// One footprint per uploaded mip level, offsets absolute within
        /// `src`.
        footprints: Vec<SubresourceFootprint>,
        /// Base-level extent of the uploaded region.
        width: u32,
        height: u32,
        dst_x: u32,
        dst_y: u32,
    },
    CopyTextureToBuffer {
        src: TextureId,
        src_rect: Rect,
        dst: BufferId,
        footprint: SubresourceFootprint,
    },
    CopyTextureToTexture {
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_x: u32,
        dst_y: u32,
    },
    CopyBufferToBuffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    ResolveTexture {
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_x: u32,
        dst_y: u32,
    },
    BeginRenderPass {
        target: TextureId,
        load: LoadOp,
    },
    EndRenderPass,
    SetPipeline(PipelineId),
    SetVertexBuffer {
        buffer: BufferId,
        offset: u64,
    },
    SetUniforms {
        buffer: BufferId,
        offset: u64,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
}

impl Op {
    /// Operations whose results depend on previously requested transitions.
    fn is_affected_by_barriers(&self) -> bool {
        matches!(
            self,
            Op::CopyBufferToTexture { .. }
                | Op::CopyTextureToBuffer { .. }
                | Op::CopyTextureToTexture { .. }
                | Op::CopyBufferToBuffer { .. }
                | Op::ResolveTexture { .. }
                | Op::BeginRenderPass { .. }
                | Op::Draw { .. }
        )
    }

    /// Whether recording this op gives the list queue-worthy work.
    fn counts_as_work(&self) -> bool {
        !matches!(
            self,
            Op::SetPipeline(_) | Op::SetVertexBuffer { .. } | Op::SetUniforms { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListState {
    Recording,
    Closed,
    Submitted,
    Retired,
}

/// A bounded sequence of recorded GPU operations plus everything needed to
/// keep its resources alive until the device finishes executing them.
pub struct CommandList<B: GpuBackend> {
    state: ListState,
    ops: Vec<Op>,
    has_work: bool,

    tracked: Vec<ResourceId>,
    tracked_set: HashSet<ResourceId>,

    pending_barriers: Vec<BarrierTransition>,
    barrier_batches: u64,
    barrier_transitions: u64,

    bound_pipeline: Option<PipelineId>,
    bound_vertex: Option<(BufferId, u64)>,
    bound_uniforms: Option<(BufferId, u64)>,

    callbacks: Vec<Arc<FinishedCallback>>,
    sealed: Option<B::SealedList>,
    fence_value: Option<u64>,
}

impl<B: GpuBackend> CommandList<B> {
    pub fn new() -> Self {
        Self {
            state: ListState::Recording,
            ops: Vec::new(),
            has_work: false,
            tracked: Vec::new(),
            tracked_set: HashSet::new(),
            pending_barriers: Vec::new(),
            barrier_batches: 0,
            barrier_transitions: 0,
            bound_pipeline: None,
            bound_vertex: None,
            bound_uniforms: None,
            callbacks: Vec::new(),
            sealed: None,
            fence_value: None,
        }
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn has_work(&self) -> bool {
        self.has_work
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn barrier_batches(&self) -> u64 {
        self.barrier_batches
    }

    pub fn barrier_transitions(&self) -> u64 {
        self.barrier_transitions
    }

    pub fn fence_value(&self) -> Option<u64> {
        self.fence_value
    }

    fn assert_recording(&self) {
        assert_eq!(
            self.state,
            ListState::Recording,
            "operation recorded on a non-recording command list"
        );
    }

    /// Register shared ownership of `id` for the lifetime of this list.
    ///
    /// Duplicate registration is tolerated; the resource is released once per
    /// list at retirement regardless of how many times it was added. Returns
    /// whether this was the first registration.
    pub fn add_resource(&mut self, id: ResourceId) -> bool {
        self.assert_recording();
        if self.tracked_set.insert(id) {
            self.tracked.push(id);
            true
        } else {
            false
        }
    }

    pub fn references(&self, id: ResourceId) -> bool {
        self.tracked_set.contains(&id)
    }

    /// Queue a state transition. Not issued until the next affected
    /// operation (or closing the list) flushes the batch.
    pub fn resource_barrier(&mut self, transition: BarrierTransition) {
        self.assert_recording();
        self.pending_barriers.push(transition);
        self.has_work = true;
    }

    /// Flush all pending transitions as one native barrier submission.
    pub fn submit_resource_barriers(&mut self) {
        self.assert_recording();
        if self.pending_barriers.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_barriers);
        self.barrier_batches += 1;
        self.barrier_transitions += batch.len() as u64;
        self.ops.push(Op::Barriers(batch));
    }

    /// Record an operation, flushing pending barriers first when the op is
    /// one they could affect.
    pub fn record(&mut self, op: Op) {
        self.assert_recording();
        if op.is_affected_by_barriers() {
            self.submit_resource_barriers();
        }
        if op.counts_as_work() {
            self.has_work = true;
        }
        self.ops.push(op);
    }

    /// Bind a pipeline; a no-op when it is already bound.
    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        if self.bound_pipeline == Some(pipeline) {
            return;
        }
        self.bound_pipeline = Some(pipeline);
        self.record(Op::SetPipeline(pipeline));
    }

    /// Bind a vertex buffer range; a no-op when already bound.
    pub fn set_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        if self.bound_vertex == Some((buffer, offset)) {
            return;
        }
        self.bound_vertex = Some((buffer, offset));
        self.record(Op::SetVertexBuffer { buffer, offset });
    }

    /// Bind a uniform block; a no-op when already bound.
    pub fn set_uniforms(&mut self, buffer: BufferId, offset: u64) {
        if self.bound_uniforms == Some((buffer, offset)) {
            return;
        }
        self.bound_uniforms = Some((buffer, offset));
        self.record(Op::SetUniforms { buffer, offset });
    }

    /// Forget bound pipeline/vertex/uniform state.
    ///
    /// Render-pass boundaries reset native binding state on the
    /// command-buffer backends, so the idempotence caches must not carry
    /// across them.
    pub fn invalidate_bindings(&mut self) {
        self.bound_pipeline = None;
        self.bound_vertex = None;
        self.bound_uniforms = None;
    }

    /// Stop recording: flush any pending barriers and mark the list ready to
    /// be finalized by the backend. Closing twice without a reset is a
    /// programming error.
    pub fn finish_recording(&mut self) {
        self.assert_recording();
        self.submit_resource_barriers();
        self.state = ListState::Closed;
    }

    pub fn set_sealed(&mut self, sealed: B::SealedList) {
        assert_eq!(self.state, ListState::Closed);
        self.sealed = Some(sealed);
    }

    pub fn take_sealed(&mut self) -> Option<B::SealedList> {
        self.sealed.take()
    }

    pub fn mark_submitted(&mut self, fence_value: u64) {
        assert_eq!(self.state, ListState::Closed);
        self.state = ListState::Submitted;
        self.fence_value = Some(fence_value);
    }

    pub fn add_finished_callback(&mut self, callback: Arc<FinishedCallback>) {
        self.callbacks.push(callback);
    }

    /// Drop all held callback handles; each fires as soon as its last holder
    /// lets go.
    pub fn fire_finished_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Release every referenced resource (once each) and fire callbacks.
    ///
    /// Called when the device observes this list's fence value retired.
    pub fn retire(&mut self, arena: &mut ResourceArena<B>) {
        assert_eq!(self.state, ListState::Submitted, "retire of unsubmitted list");
        for id in self.tracked.drain(..) {
            arena.release_gpu_ref(id);
        }
        self.tracked_set.clear();
        self.fire_finished_callbacks();
        self.state = ListState::Retired;
    }

    /// Return the list to a fresh `Recording` state.
    ///
    /// Releases any resources still tracked (the discard path for a list
    /// that never reached the queue). Illegal while `Submitted`.
    pub fn reset(&mut self, arena: &mut ResourceArena<B>) {
        assert_ne!(self.state, ListState::Submitted, "reset of an in-flight list");
        for id in self.tracked.drain(..) {
            arena.release_gpu_ref(id);
        }
        self.tracked_set.clear();
        self.fire_finished_callbacks();

        self.ops.clear();
        self.pending_barriers.clear();
        self.has_work = false;
        self.bound_pipeline = None;
        self.bound_vertex = None;
        self.bound_uniforms = None;
        self.sealed = None;
        self.fence_value = None;
        self.barrier_batches = 0;
        self.barrier_transitions = 0;
        self.state = ListState::Recording;
    }
}

impl<B: GpuBackend> Default for CommandList<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftBackend;
    use crate::backend::GpuBackend as _;
    use crate::resource::{BufferDesc, BufferResource, BufferUsage, TextureDesc, TextureResource};
    use crate::state::{ResourceState, StateTracker};

    fn test_list() -> CommandList<SoftBackend> {
        CommandList::new()
    }

    fn arena_with_texture() -> (ResourceArena<SoftBackend>, TextureId) {
        let mut backend = SoftBackend::new();
        let mut arena = ResourceArena::new();
        let desc = TextureDesc {
            width: 4,
            height: 4,
            format: crate::format::PixelFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: crate::resource::TextureUsage::COPY_DST | crate::resource::TextureUsage::COPY_SRC,
            protected: crate::resource::Protected::No,
        };
        let native = backend.create_texture(&desc).unwrap();
        let id = arena.insert_texture(TextureResource {
            state: StateTracker::new(desc.initial_state()),
            native,
            desc,
            mipmap_status: crate::resource::MipmapStatus::NotAllocated,
        });
        (arena, id)
    }

    fn barrier(texture: TextureId, from: ResourceState, to: ResourceState) -> BarrierTransition {
        BarrierTransition { texture, from, to }
    }

    #[test]
    fn pending_barriers_coalesce_into_one_batch() {
        let mut list = test_list();
        let (_, tex) = arena_with_texture();

        list.resource_barrier(barrier(tex, ResourceState::CopyDst, ResourceState::CopySrc));
        list.resource_barrier(barrier(tex, ResourceState::CopySrc, ResourceState::CopyDst));
        assert!(list.ops().is_empty());

        // The first affected op flushes the whole batch as one submission.
        list.record(Op::CopyBufferToBuffer {
            src: BufferId(0),
            src_offset: 0,
            dst: BufferId(1),
            dst_offset: 0,
            size: 4,
        });

        assert_eq!(list.barrier_batches(), 1);
        assert_eq!(list.barrier_transitions(), 2);
        assert!(matches!(&list.ops()[0], Op::Barriers(b) if b.len() == 2));
        assert_eq!(list.ops().len(), 2);
    }

    #[test]
    fn close_flushes_pending_barriers_unconditionally() {
        let mut list = test_list();
        let (_, tex) = arena_with_texture();

        list.resource_barrier(barrier(tex, ResourceState::CopyDst, ResourceState::Present));
        assert!(list.has_work());

        list.finish_recording();
        assert_eq!(list.state(), ListState::Closed);
        assert_eq!(list.barrier_batches(), 1);
    }

    #[test]
    fn state_setters_are_idempotent() {
        let mut list = test_list();
        let pipeline = PipelineId(7);

        list.set_pipeline(pipeline);
        list.set_pipeline(pipeline);
        list.set_vertex_buffer(BufferId(3), 0);
        list.set_vertex_buffer(BufferId(3), 0);
        assert_eq!(list.ops().len(), 2);

        // A different binding records again.
        list.set_vertex_buffer(BufferId(3), 64);
        assert_eq!(list.ops().len(), 3);

        // Setters alone are not queue-worthy work.
        assert!(!list.has_work());
    }

    #[test]
    fn invalidated_bindings_record_again() {
        let mut list = test_list();
        list.set_pipeline(PipelineId(0));
        list.invalidate_bindings();
        list.set_pipeline(PipelineId(0));
        assert_eq!(list.ops().len(), 2);
    }

    #[test]
    fn duplicate_registration_releases_once_per_list() {
        let (mut arena, tex) = arena_with_texture();
        let mut list = test_list();

        assert!(list.add_resource(tex.into()));
        assert!(!list.add_resource(tex.into()));
        arena.add_gpu_ref(tex.into());

        list.record(Op::CopyBufferToBuffer {
            src: BufferId(0),
            src_offset: 0,
            dst: BufferId(1),
            dst_offset: 0,
            size: 4,
        });
        list.finish_recording();
        list.mark_submitted(1);
        list.retire(&mut arena);

        assert_eq!(arena.gpu_ref_count(tex.into()), 0);
    }

    #[test]
    fn reset_releases_tracked_resources_of_a_discarded_list() {
        let mut backend = SoftBackend::new();
        let mut arena: ResourceArena<SoftBackend> = ResourceArena::new();
        let desc = BufferDesc {
            size: 16,
            usage: BufferUsage::COPY_SRC,
        };
        let native = backend.create_buffer(&desc).unwrap();
        let id = arena.insert_buffer(BufferResource { native, desc });

        let mut list = test_list();
        assert!(list.add_resource(id.into()));
        arena.add_gpu_ref(id.into());

        list.reset(&mut arena);
        assert_eq!(arena.gpu_ref_count(id.into()), 0);
        assert_eq!(list.state(), ListState::Recording);
        assert!(!list.has_work());
    }

    #[test]
    #[should_panic(expected = "non-recording")]
    fn closing_twice_is_fatal() {
        let mut list = test_list();
        list.finish_recording();
        list.finish_recording();
    }

    #[test]
    #[should_panic(expected = "in-flight")]
    fn reset_while_submitted_is_fatal() {
        let (mut arena, _) = arena_with_texture();
        let mut list = test_list();
        list.record(Op::EndRenderPass);
        list.finish_recording();
        list.mark_submitted(1);
        list.reset(&mut arena);
    }
}
