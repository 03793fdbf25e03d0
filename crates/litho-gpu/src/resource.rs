//! Tracked GPU-visible resources.
//!
//! Every buffer and texture lives in a [`ResourceArena`] and is addressed by
//! a typed id. Command lists register shared ownership by id; the arena keeps
//! the GPU-work refcount and fires "work finished" hooks exactly once per
//! retirement event, so no caller has to reason about duplicate call sites.
//! A resource asked to be destroyed while still referenced by an in-flight
//! command list is only torn down when its last reference retires.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::backend::GpuBackend;
use crate::error::{GpuError, GpuResult};
use crate::format::PixelFormat;
use crate::state::StateTracker;

/// Handle to a texture in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Handle to a buffer in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Any tracked resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Texture(TextureId),
    Buffer(BufferId),
}

impl From<TextureId> for ResourceId {
    fn from(id: TextureId) -> Self {
        ResourceId::Texture(id)
    }
}

impl From<BufferId> for ResourceId {
    fn from(id: BufferId) -> Self {
        ResourceId::Buffer(id)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const MAP_READ = 1 << 2;
        const UNIFORM = 1 << 3;
        const VERTEX = 1 << 4;
    }
}

/// Whether a resource lives in protected memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protected {
    No,
    Yes,
}

/// Mip level population of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MipmapStatus {
    /// Single level, or levels never written.
    NotAllocated,
    /// Base level written but higher levels stale; regeneration is the
    /// drawing collaborator's job.
    Dirty,
    /// All levels hold valid data.
    Valid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub usage: TextureUsage,
    pub protected: Protected,
}

impl TextureDesc {
    /// The state a freshly created texture starts in: render targets are
    /// created ready to render, everything else ready to receive an upload.
    pub fn initial_state(&self) -> crate::state::ResourceState {
        if self.usage.contains(TextureUsage::RENDER_TARGET) {
            crate::state::ResourceState::RenderTarget
        } else {
            crate::state::ResourceState::CopyDst
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

pub struct TextureResource<B: GpuBackend> {
    pub native: B::Texture,
    pub desc: TextureDesc,
    pub state: StateTracker,
    pub mipmap_status: MipmapStatus,
}

pub struct BufferResource<B: GpuBackend> {
    pub native: B::Buffer,
    pub desc: BufferDesc,
}

/// Hook fired each time a retirement event releases the resource.
pub type FinishedHook = Box<dyn FnMut() + Send>;

struct Tracked<T> {
    payload: Option<T>,
    gpu_refs: u32,
    pending_destroy: bool,
    finished_hook: Option<FinishedHook>,
}

impl<T> Tracked<T> {
    fn new(payload: T) -> Self {
        Self {
            payload: Some(payload),
            gpu_refs: 0,
            pending_destroy: false,
            finished_hook: None,
        }
    }

    fn is_live(&self) -> bool {
        self.payload.is_some() && !self.pending_destroy
    }
}

/// Arena of all tracked resources owned by one device.
pub struct ResourceArena<B: GpuBackend> {
    textures: Vec<Tracked<TextureResource<B>>>,
    buffers: Vec<Tracked<BufferResource<B>>>,
}

impl<B: GpuBackend> ResourceArena<B> {
    pub fn new() -> Self {
        Self {
            textures: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn insert_texture(&mut self, resource: TextureResource<B>) -> TextureId {
        let id = TextureId(self.textures.len() as u32);
        self.textures.push(Tracked::new(resource));
        id
    }

    pub fn insert_buffer(&mut self, resource: BufferResource<B>) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(Tracked::new(resource));
        id
    }

    pub fn texture(&self, id: TextureId) -> GpuResult<&TextureResource<B>> {
        self.textures
            .get(id.0 as usize)
            .filter(|t| t.is_live())
            .and_then(|t| t.payload.as_ref())
            .ok_or_else(|| GpuError::validation(format!("texture {:?} is not live", id)))
    }

    pub fn texture_mut(&mut self, id: TextureId) -> GpuResult<&mut TextureResource<B>> {
        self.textures
            .get_mut(id.0 as usize)
            .filter(|t| t.is_live())
            .and_then(|t| t.payload.as_mut())
            .ok_or_else(|| GpuError::validation(format!("texture {:?} is not live", id)))
    }

    pub fn buffer(&self, id: BufferId) -> GpuResult<&BufferResource<B>> {
        self.buffers
            .get(id.0 as usize)
            .filter(|b| b.is_live())
            .and_then(|b| b.payload.as_ref())
            .ok_or_else(|| GpuError::validation(format!("buffer {:?} is not live", id)))
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        match id {
            ResourceId::Texture(t) => self
                .textures
                .get(t.0 as usize)
                .is_some_and(Tracked::is_live),
            ResourceId::Buffer(b) => self.buffers.get(b.0 as usize).is_some_and(Tracked::is_live),
        }
    }

    pub fn gpu_ref_count(&self, id: ResourceId) -> u32 {
        match id {
            ResourceId::Texture(t) => self.textures.get(t.0 as usize).map_or(0, |e| e.gpu_refs),
            ResourceId::Buffer(b) => self.buffers.get(b.0 as usize).map_or(0, |e| e.gpu_refs),
        }
    }

    /// Register one command-list reference.
    pub fn add_gpu_ref(&mut self, id: ResourceId) {
        match id {
            ResourceId::Texture(t) => self.textures[t.0 as usize].gpu_refs += 1,
            ResourceId::Buffer(b) => self.buffers[b.0 as usize].gpu_refs += 1,
        }
    }

    /// Release one command-list reference.
    ///
    /// Fires the finished hook, and completes a deferred destroy if this was
    /// the last reference.
    pub fn release_gpu_ref(&mut self, id: ResourceId) {
        match id {
            ResourceId::Texture(t) => Self::release_entry(&mut self.textures[t.0 as usize]),
            ResourceId::Buffer(b) => Self::release_entry(&mut self.buffers[b.0 as usize]),
        }
    }

    fn release_entry<T>(entry: &mut Tracked<T>) {
        assert!(entry.gpu_refs > 0, "gpu refcount underflow");
        entry.gpu_refs -= 1;
        if let Some(hook) = entry.finished_hook.as_mut() {
            hook();
        }
        if entry.gpu_refs == 0 && entry.pending_destroy {
            entry.payload = None;
            entry.finished_hook = None;
        }
    }

    /// Install a hook fired once per retirement event referencing `id`.
    pub fn set_finished_hook(&mut self, id: ResourceId, hook: FinishedHook) -> GpuResult<()> {
        let slot = match id {
            ResourceId::Texture(t) => self
                .textures
                .get_mut(t.0 as usize)
                .filter(|e| e.is_live())
                .map(|e| &mut e.finished_hook),
            ResourceId::Buffer(b) => self
                .buffers
                .get_mut(b.0 as usize)
                .filter(|e| e.is_live())
                .map(|e| &mut e.finished_hook),
        };
        match slot {
            Some(s) => {
                *s = Some(hook);
                Ok(())
            }
            None => Err(GpuError::validation(format!("{id:?} is not live"))),
        }
    }

    /// Drop CPU ownership of a resource.
    ///
    /// Frees immediately when no command list references it; otherwise the
    /// teardown happens at the last retirement.
    pub fn destroy(&mut self, id: ResourceId) -> GpuResult<()> {
        match id {
            ResourceId::Texture(t) => Self::destroy_entry(
                self.textures
                    .get_mut(t.0 as usize)
                    .ok_or_else(|| GpuError::validation(format!("{id:?} out of range")))?,
            ),
            ResourceId::Buffer(b) => Self::destroy_entry(
                self.buffers
                    .get_mut(b.0 as usize)
                    .ok_or_else(|| GpuError::validation(format!("{id:?} out of range")))?,
            ),
        }
    }

    fn destroy_entry<T>(entry: &mut Tracked<T>) -> GpuResult<()> {
        if entry.payload.is_none() || entry.pending_destroy {
            return Err(GpuError::validation("resource already destroyed"));
        }
        if entry.gpu_refs == 0 {
            entry.payload = None;
            entry.finished_hook = None;
        } else {
            entry.pending_destroy = true;
        }
        Ok(())
    }
}

impl<B: GpuBackend> Default for ResourceArena<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A callback that fires once all GPU work recorded up to its registration
/// has retired.
///
/// Each command list that may complete the work holds a clone; the callback
/// fires when the last holder drops its handle, which the in-order retirement
/// walk guarantees is no earlier than the completion of all prior work.
pub struct FinishedCallback {
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FinishedCallback {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }
}

impl Drop for FinishedCallback {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.lock().unwrap().take() {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn finished_callback_fires_once_on_last_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let cb = FinishedCallback::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let second = Arc::clone(&cb);
        drop(cb);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(second);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
