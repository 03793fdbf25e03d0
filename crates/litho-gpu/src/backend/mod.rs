//! The native-API seam.
//!
//! [`GpuBackend`] is everything the engine asks of a native graphics API:
//! resource creation, mapped-buffer IO, turning a recorded op stream into a
//! native command list, queue execution, and fence/semaphore signaling. One
//! implementation exists per native API; the shared scaffolding (outstanding
//! FIFO, staging manager, state tracking) is composed around it by
//! [`GpuDevice`](crate::GpuDevice) and written only once.

pub mod soft;
pub mod wgpu_backend;

use crate::caps::GpuCaps;
use crate::cmd::Op;
use crate::error::GpuResult;
use crate::provider::{PipelineKey, PipelineTable};
use crate::resource::{BufferDesc, ResourceArena, TextureDesc};

/// A native graphics API driven by the engine.
///
/// All methods are called from the single submitter thread. The only
/// asynchronous actor behind this trait is the device itself, observed
/// exclusively through the monotonic fence: [`signal_fence`] enqueues a
/// signal behind all previously executed work, and [`completed_fence`]
/// reports the highest value the device has provably reached.
///
/// [`signal_fence`]: GpuBackend::signal_fence
/// [`completed_fence`]: GpuBackend::completed_fence
pub trait GpuBackend: Sized + 'static {
    type Texture;
    type Buffer;
    type Pipeline;
    /// A closed, queue-ready native command list.
    type SealedList;
    type Semaphore: Clone;

    fn caps(&self) -> &GpuCaps;

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<Self::Texture>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> GpuResult<Self::Buffer>;

    /// Write bytes into a CPU-visible buffer region.
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Read back a CPU-visible buffer region. Callers guarantee the device
    /// has finished writing the range.
    fn read_buffer(&mut self, buffer: &Self::Buffer, offset: u64, size: u64)
        -> GpuResult<Vec<u8>>;

    fn create_pipeline(&mut self, key: &PipelineKey) -> GpuResult<Self::Pipeline>;

    /// Finalize a recorded op stream into a native command list.
    ///
    /// This is the native "close" call: a failure here means the list must
    /// not be submitted.
    fn seal(
        &mut self,
        ops: &[Op],
        arena: &ResourceArena<Self>,
        pipelines: &PipelineTable<Self>,
    ) -> GpuResult<Self::SealedList>;

    /// Hand a sealed list to the queue.
    fn execute(&mut self, list: Self::SealedList) -> GpuResult<()>;

    /// Enqueue a fence signal behind everything executed so far.
    fn signal_fence(&mut self, value: u64) -> GpuResult<()>;

    /// Highest fence value the device has reached.
    fn completed_fence(&mut self) -> u64;

    /// Block the calling thread until the fence reaches `value`.
    fn wait_fence(&mut self, value: u64) -> GpuResult<()>;

    fn create_semaphore(&mut self) -> GpuResult<Self::Semaphore>;

    /// Enqueue a semaphore signal on the queue.
    fn signal_semaphore(&mut self, semaphore: &Self::Semaphore, value: u64) -> GpuResult<()>;

    /// Make the queue wait until the semaphore reaches `value`.
    fn wait_semaphore(&mut self, semaphore: &Self::Semaphore, value: u64) -> GpuResult<()>;
}
