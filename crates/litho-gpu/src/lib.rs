//! `litho-gpu` is the command-submission and resource-lifetime engine under
//! the litho renderer.
//!
//! It turns draw/copy/clear operations into backend-native command lists,
//! tracks every GPU-visible resource those lists reference, and reclaims
//! resources only once the device's monotonic fence proves the work
//! finished. One [`GpuDevice`] exists per native API; the backends plug in
//! through [`backend::GpuBackend`]:
//!
//! - [`backend::soft::SoftBackend`]: a software queue with the discrete
//!   command-list model and explicit barrier validation.
//! - [`backend::wgpu_backend::WgpuBackend`]: the command-buffer model with
//!   implicit hazard tracking.

pub mod backend;
pub mod caps;
pub mod cmd;
pub mod device;
pub mod error;
pub mod format;
pub mod provider;
pub mod resource;
pub mod staging;
pub mod state;
pub mod stats;

pub use caps::GpuCaps;
pub use cmd::{CommandList, ListState, LoadOp};
pub use device::{DrawDesc, GpuDevice, MipData, SyncQueue};
pub use error::{GpuError, GpuResult};
pub use format::{ColorType, PixelFormat, Rect};
pub use provider::{PipelineId, PipelineKey};
pub use resource::{
    BufferDesc, BufferId, BufferUsage, FinishedCallback, FinishedHook, MipmapStatus, Protected,
    ResourceId, TextureDesc, TextureId, TextureUsage,
};
pub use staging::StagingSlice;
pub use state::ResourceState;
pub use stats::GpuStats;
