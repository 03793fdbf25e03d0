//! The per-backend device: command queue, monotonic fence, current command
//! list, and the FIFO of outstanding submissions.
//!
//! All recording and submission happens on one logical thread. The device
//! discovers completion only by polling the fence, opportunistically after
//! each submission, or by blocking at explicit sync points (forced flush,
//! readback, teardown). Because fence values are monotonic and lists are
//! submitted in increasing fence order, the FIFO head is always the
//! oldest-possibly-unretired list and lists retire in exactly the order they
//! were submitted.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::GpuBackend;
use crate::caps::GpuCaps;
use crate::cmd::{CommandList, ListState, LoadOp, Op};
use crate::error::{GpuError, GpuResult};
use crate::format::{
    compressed_data_size, copyable_footprints, full_mip_chain_len, mip_dimension, ColorType,
    PixelFormat, Rect, PLACEMENT_ALIGNMENT,
};
use crate::provider::{PipelineKey, ResourceProvider};
use crate::resource::{
    BufferDesc, BufferId, BufferResource, BufferUsage, FinishedCallback, FinishedHook,
    MipmapStatus, Protected, ResourceArena, ResourceId, TextureDesc, TextureId, TextureResource,
    TextureUsage,
};
use crate::staging::StagingBufferManager;
use crate::state::ResourceState;
use crate::stats::GpuStats;

const STAGING_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
const UNIFORM_RING_SIZE: u64 = 128 * 1024;
const UNIFORM_BLOCK_SIZE: usize = 16;

/// Whether a submission should block until the queue drains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncQueue {
    Skip,
    Force,
}

/// One mip level of source pixels for an upload.
#[derive(Clone, Copy, Debug)]
pub struct MipData<'a> {
    pub pixels: &'a [u8],
    /// Source row stride in bytes; 0 means tightly packed.
    pub row_bytes: usize,
}

/// A solid-color draw into the open render pass.
#[derive(Clone, Copy, Debug)]
pub struct DrawDesc {
    pub vertex_buffer: BufferId,
    pub vertex_offset: u64,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub color: [f32; 4],
}

struct OutstandingSubmission<B: GpuBackend> {
    list: CommandList<B>,
    fence_value: u64,
}

/// GPU device: owns the queue, the fence, the current command list, and
/// every tracked resource.
pub struct GpuDevice<B: GpuBackend> {
    backend: B,
    caps: GpuCaps,
    arena: ResourceArena<B>,
    provider: ResourceProvider<B>,
    staging: StagingBufferManager<B>,
    uniform_ring: StagingBufferManager<B>,
    current: Option<CommandList<B>>,
    outstanding: VecDeque<OutstandingSubmission<B>>,
    current_fence_value: u64,
    device_lost: bool,
    active_pass: Option<TextureId>,
    stats: GpuStats,
}

impl<B: GpuBackend> GpuDevice<B> {
    pub fn new(backend: B) -> Self {
        let caps = *backend.caps();
        let mut provider = ResourceProvider::new();
        let current = Some(provider.find_or_create_command_list());
        Self {
            backend,
            caps,
            arena: ResourceArena::new(),
            provider,
            staging: StagingBufferManager::new(
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
                STAGING_CHUNK_SIZE,
            ),
            uniform_ring: StagingBufferManager::new(
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                UNIFORM_RING_SIZE,
            ),
            current,
            outstanding: VecDeque::new(),
            current_fence_value: 0,
            device_lost: false,
            active_pass: None,
            stats: GpuStats::default(),
        }
    }

    pub fn caps(&self) -> &GpuCaps {
        &self.caps
    }

    pub fn stats(&self) -> GpuStats {
        self.stats
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// The last fence value handed to the queue.
    pub fn current_fence_value(&self) -> u64 {
        self.current_fence_value
    }

    pub fn outstanding_submissions(&self) -> usize {
        self.outstanding.len()
    }

    /// Escape hatch to the native backend (capability probes, test
    /// controllers).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn ensure_not_lost(&self) -> GpuResult<()> {
        if self.device_lost {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn latch_on_error(&mut self, err: &GpuError) {
        if err.is_device_lost() && !self.device_lost {
            warn!("device loss latched; subsequent operations will fail fast");
            self.device_lost = true;
        }
    }

    fn current_list(&mut self) -> &mut CommandList<B> {
        self.current.as_mut().expect("device has a current command list")
    }

    fn track(
        list: &mut CommandList<B>,
        arena: &mut ResourceArena<B>,
        id: impl Into<ResourceId>,
    ) {
        let id = id.into();
        if list.add_resource(id) {
            arena.add_gpu_ref(id);
        }
    }

    /// Queue a transition of `texture` to `to` on the current list, eliding
    /// it when the texture is already there.
    fn transition_texture(&mut self, texture: TextureId, to: ResourceState) -> GpuResult<()> {
        let list = self.current.as_mut().expect("current list");
        let resource = self.arena.texture_mut(texture)?;
        if let Some(transition) = resource.state.transition_to(texture, to) {
            list.resource_barrier(transition);
            Self::track(list, &mut self.arena, texture);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Resource creation and destruction
    // ---------------------------------------------------------------------

    pub fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<TextureId> {
        self.ensure_not_lost()?;
        self.validate_texture_desc(desc)?;

        let native = match self.backend.create_texture(desc) {
            Ok(native) => native,
            Err(e) => {
                self.latch_on_error(&e);
                return Err(e);
            }
        };

        let mipmap_status = if desc.mip_level_count > 1 {
            MipmapStatus::Dirty
        } else {
            MipmapStatus::NotAllocated
        };
        let id = self.arena.insert_texture(TextureResource {
            state: crate::state::StateTracker::new(desc.initial_state()),
            native,
            desc: desc.clone(),
            mipmap_status,
        });
        trace!(?id, "created texture");
        Ok(id)
    }

    fn validate_texture_desc(&self, desc: &TextureDesc) -> GpuResult<()> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::validation("zero-sized texture"));
        }
        if desc.width > self.caps.max_texture_size || desc.height > self.caps.max_texture_size {
            return Err(GpuError::validation(format!(
                "texture {}x{} exceeds limit {}",
                desc.width, desc.height, self.caps.max_texture_size
            )));
        }
        if !self.caps.is_format_texturable(desc.format) {
            return Err(GpuError::Unsupported("format is not texturable"));
        }
        if desc.usage.contains(TextureUsage::RENDER_TARGET)
            && !self.caps.is_format_renderable(desc.format, desc.sample_count)
        {
            return Err(GpuError::Unsupported("format is not renderable"));
        }
        if desc.sample_count > 1 && desc.mip_level_count > 1 {
            return Err(GpuError::validation("multisampled textures cannot have mips"));
        }
        let full_chain = full_mip_chain_len(desc.width, desc.height);
        if desc.mip_level_count == 0 || desc.mip_level_count > full_chain {
            return Err(GpuError::validation(format!(
                "mip level count {} outside 1..={full_chain}",
                desc.mip_level_count
            )));
        }
        if desc.protected == Protected::Yes && !self.caps.supports_protected {
            return Err(GpuError::Unsupported("protected memory"));
        }
        Ok(())
    }

    fn create_buffer_inner(&mut self, desc: BufferDesc) -> GpuResult<BufferId> {
        let native = match self.backend.create_buffer(&desc) {
            Ok(native) => native,
            Err(e) => {
                self.latch_on_error(&e);
                return Err(e);
            }
        };
        Ok(self.arena.insert_buffer(BufferResource { native, desc }))
    }

    /// Create a buffer, optionally populated with `initial_data`.
    pub fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> GpuResult<BufferId> {
        self.ensure_not_lost()?;
        if desc.size == 0 {
            return Err(GpuError::validation("zero-sized buffer"));
        }
        if let Some(data) = initial_data {
            if data.len() as u64 > desc.size {
                return Err(GpuError::validation("initial data larger than buffer"));
            }
            if !desc.usage.contains(BufferUsage::COPY_DST) {
                return Err(GpuError::validation(
                    "initial data requires COPY_DST usage",
                ));
            }
        }

        let id = self.create_buffer_inner(desc.clone())?;
        if let Some(data) = initial_data {
            if !data.is_empty() {
                let buffer = self.arena.buffer(id)?;
                if let Err(e) = self.backend.write_buffer(&buffer.native, 0, data) {
                    self.latch_on_error(&e);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Drop CPU ownership. The native object survives until the last
    /// in-flight command list referencing it retires.
    pub fn destroy_texture(&mut self, id: TextureId) -> GpuResult<()> {
        self.arena.destroy(id.into())
    }

    pub fn destroy_buffer(&mut self, id: BufferId) -> GpuResult<()> {
        self.arena.destroy(id.into())
    }

    /// Install a hook fired once per retirement event that referenced the
    /// resource.
    pub fn set_finished_hook(
        &mut self,
        id: impl Into<ResourceId>,
        hook: FinishedHook,
    ) -> GpuResult<()> {
        self.arena.set_finished_hook(id.into(), hook)
    }

    pub fn is_live(&self, id: impl Into<ResourceId>) -> bool {
        self.arena.is_live(id.into())
    }

    /// How many in-flight command lists reference the resource.
    pub fn gpu_ref_count(&self, id: impl Into<ResourceId>) -> u32 {
        self.arena.gpu_ref_count(id.into())
    }

    pub fn texture_mipmap_status(&self, id: TextureId) -> GpuResult<MipmapStatus> {
        Ok(self.arena.texture(id)?.mipmap_status)
    }

    // ---------------------------------------------------------------------
    // Uploads and readback
    // ---------------------------------------------------------------------

    /// Upload pixels into `rect` of a texture.
    ///
    /// Either one level is written, or the rect covers the whole texture and
    /// `levels` covers its full mip chain; gaps in the mip data are
    /// rejected. Updating fewer levels than the texture owns marks its
    /// mipmaps dirty for a later regeneration pass.
    pub fn write_pixels(
        &mut self,
        texture: TextureId,
        rect: Rect,
        color_type: ColorType,
        levels: &[MipData<'_>],
    ) -> GpuResult<()> {
        self.ensure_not_lost()?;
        let (format, tex_w, tex_h, mip_count) = {
            let tex = self.arena.texture(texture)?;
            (
                tex.desc.format,
                tex.desc.width,
                tex.desc.height,
                tex.desc.mip_level_count,
            )
        };

        if format.is_compressed() {
            return Err(GpuError::validation(
                "write_pixels does not accept compressed textures",
            ));
        }
        if format.color_type() != Some(color_type) {
            return Err(GpuError::validation(format!(
                "color type {color_type:?} does not match texture format {format:?}"
            )));
        }
        if rect.is_empty() || !rect.contained_by(tex_w, tex_h) {
            return Err(GpuError::validation(format!("invalid upload rect {rect:?}")));
        }
        match levels.len() as u32 {
            0 => return Err(GpuError::validation("no mip data supplied")),
            1 => {
                if levels[0].pixels.is_empty() {
                    // Nothing to upload.
                    return Ok(());
                }
            }
            n => {
                if n != mip_count || rect != Rect::from_size(tex_w, tex_h) {
                    return Err(GpuError::validation(
                        "multi-level uploads must cover the full texture and mip chain",
                    ));
                }
                if levels.iter().any(|l| l.pixels.is_empty()) {
                    return Err(GpuError::validation("gap in mip data"));
                }
            }
        }

        self.transition_texture(texture, ResourceState::CopyDst)?;

        let (footprints, total) =
            copyable_footprints(format, rect.width, rect.height, levels.len() as u32)?;

        let bpp = color_type.bytes_per_pixel();
        let mut scratch = vec![0u8; total as usize];
        for (level, (mip, fp)) in levels.iter().zip(&footprints).enumerate() {
            let w = mip_dimension(rect.width, level as u32) as usize;
            let h = mip_dimension(rect.height, level as u32) as usize;
            let trim = w * bpp;
            let src_pitch = if mip.row_bytes == 0 { trim } else { mip.row_bytes };
            if src_pitch < trim || mip.pixels.len() < src_pitch * (h - 1) + trim {
                return Err(GpuError::validation(format!(
                    "level {level} pixel data too small"
                )));
            }
            litho_gpu_utils::copy_rect(
                &mut scratch[fp.offset as usize..],
                fp.row_pitch as usize,
                mip.pixels,
                src_pitch,
                trim,
                h,
            );
        }

        self.stage_and_record_upload(texture, rect, footprints, scratch)?;

        let tex = self.arena.texture_mut(texture)?;
        tex.mipmap_status = if (levels.len() as u32) < mip_count {
            MipmapStatus::Dirty
        } else if mip_count > 1 {
            MipmapStatus::Valid
        } else {
            tex.mipmap_status
        };
        Ok(())
    }

    /// Create a compressed texture and upload pre-compressed block data,
    /// tightly packed, base level first.
    pub fn create_compressed_texture(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        mipmapped: bool,
        data: &[u8],
    ) -> GpuResult<TextureId> {
        self.ensure_not_lost()?;
        if !format.is_compressed() {
            return Err(GpuError::validation("format is not block-compressed"));
        }

        let mip_level_count = if mipmapped {
            full_mip_chain_len(width, height)
        } else {
            1
        };
        let expected = compressed_data_size(format, width, height, mip_level_count);
        if data.len() as u64 != expected {
            return Err(GpuError::validation(format!(
                "compressed data is {} bytes, expected {expected}",
                data.len()
            )));
        }

        let desc = TextureDesc {
            width,
            height,
            format,
            mip_level_count,
            sample_count: 1,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
            protected: Protected::No,
        };
        let id = self.create_texture(&desc)?;

        self.transition_texture(id, ResourceState::CopyDst)?;

        let (footprints, total) = copyable_footprints(format, width, height, mip_level_count)?;
        let mut scratch = vec![0u8; total as usize];
        let mut src_offset = 0usize;
        for fp in &footprints {
            let level_bytes = fp.row_bytes as usize * fp.rows as usize;
            litho_gpu_utils::copy_rect(
                &mut scratch[fp.offset as usize..],
                fp.row_pitch as usize,
                &data[src_offset..src_offset + level_bytes],
                fp.row_bytes as usize,
                fp.row_bytes as usize,
                fp.rows as usize,
            );
            src_offset += level_bytes;
        }

        self.stage_and_record_upload(id, Rect::from_size(width, height), footprints, scratch)?;

        let tex = self.arena.texture_mut(id)?;
        tex.mipmap_status = if mip_level_count > 1 {
            MipmapStatus::Valid
        } else {
            MipmapStatus::NotAllocated
        };
        Ok(id)
    }

    /// Allocate a staging slice for `scratch`, write it, and record the
    /// per-mip copies into `texture`.
    fn stage_and_record_upload(
        &mut self,
        texture: TextureId,
        rect: Rect,
        footprints: Vec<crate::format::SubresourceFootprint>,
        scratch: Vec<u8>,
    ) -> GpuResult<()> {
        let slice = match self.staging.allocate(
            &mut self.backend,
            &mut self.arena,
            scratch.len() as u64,
            PLACEMENT_ALIGNMENT,
        ) {
            Ok(slice) => slice,
            Err(e) => {
                self.latch_on_error(&e);
                return Err(e);
            }
        };
        self.stats.staging_bytes += slice.size;

        {
            let buffer = self.arena.buffer(slice.buffer)?;
            if let Err(e) = self
                .backend
                .write_buffer(&buffer.native, slice.offset, &scratch)
            {
                self.latch_on_error(&e);
                return Err(e);
            }
        }

        let footprints = footprints
            .into_iter()
            .map(|mut fp| {
                fp.offset += slice.offset;
                fp
            })
            .collect();

        let list = self.current.as_mut().expect("current list");
        Self::track(list, &mut self.arena, texture);
        Self::track(list, &mut self.arena, slice.buffer);
        list.record(Op::CopyBufferToTexture {
            src: slice.buffer,
            dst: texture,
            footprints,
            width: rect.width,
            height: rect.height,
            dst_x: rect.x,
            dst_y: rect.y,
        });
        Ok(())
    }

    /// Read back `rect` of a texture as tightly packed rows.
    ///
    /// Forces a synchronous submit: the caller needs the bytes immediately.
    pub fn read_pixels(
        &mut self,
        texture: TextureId,
        rect: Rect,
        color_type: ColorType,
    ) -> GpuResult<Vec<u8>> {
        self.ensure_not_lost()?;
        let format = self.arena.texture(texture)?.desc.format;
        // Color-type mismatch is rejected before any GPU work is issued.
        if format.color_type() != Some(color_type) {
            return Err(GpuError::validation(format!(
                "color type {color_type:?} does not match texture format {format:?}"
            )));
        }
        let (tex_w, tex_h) = {
            let d = &self.arena.texture(texture)?.desc;
            (d.width, d.height)
        };
        if rect.is_empty() || !rect.contained_by(tex_w, tex_h) {
            return Err(GpuError::validation(format!("invalid readback rect {rect:?}")));
        }

        let bytes = self.readback_subresource(texture, rect)?;
        Ok(bytes)
    }

    /// Read back the raw block data of a compressed texture's base level.
    pub fn read_block_data(&mut self, texture: TextureId) -> GpuResult<Vec<u8>> {
        self.ensure_not_lost()?;
        let desc = self.arena.texture(texture)?.desc.clone();
        if !desc.format.is_compressed() {
            return Err(GpuError::validation("texture is not block-compressed"));
        }
        self.readback_subresource(texture, Rect::from_size(desc.width, desc.height))
    }

    fn readback_subresource(&mut self, texture: TextureId, rect: Rect) -> GpuResult<Vec<u8>> {
        let format = self.arena.texture(texture)?.desc.format;

        self.transition_texture(texture, ResourceState::CopySrc)?;

        let (footprints, total) = copyable_footprints(format, rect.width, rect.height, 1)?;
        let footprint = footprints[0];

        // A fresh CPU-readable transfer buffer per readback; these are rare
        // forced-sync paths and never pooled.
        let transfer = self.create_buffer_inner(BufferDesc {
            size: total,
            usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
        })?;

        {
            let list = self.current.as_mut().expect("current list");
            Self::track(list, &mut self.arena, texture);
            Self::track(list, &mut self.arena, transfer);
            list.record(Op::CopyTextureToBuffer {
                src: texture,
                src_rect: rect,
                dst: transfer,
                footprint,
            });
        }

        self.submit(SyncQueue::Force)?;

        let raw = {
            let buffer = self.arena.buffer(transfer)?;
            match self.backend.read_buffer(&buffer.native, 0, total) {
                Ok(raw) => raw,
                Err(e) => {
                    self.latch_on_error(&e);
                    return Err(e);
                }
            }
        };

        let tight_pitch = footprint.row_bytes as usize;
        let mut out = vec![0u8; tight_pitch * footprint.rows as usize];
        litho_gpu_utils::copy_rect(
            &mut out,
            tight_pitch,
            &raw,
            footprint.row_pitch as usize,
            tight_pitch,
            footprint.rows as usize,
        );

        // The forced sync retired every reference, so this frees now.
        self.arena.destroy(transfer.into())?;
        Ok(out)
    }

    /// Read bytes out of a CPU-visible (`MAP_READ`) buffer.
    ///
    /// The caller is responsible for having synced any GPU writes to the
    /// range, e.g. with a forced flush.
    pub fn read_buffer(&mut self, id: BufferId, offset: u64, size: u64) -> GpuResult<Vec<u8>> {
        self.ensure_not_lost()?;
        let buffer = self.arena.buffer(id)?;
        if !buffer.desc.usage.contains(BufferUsage::MAP_READ) {
            return Err(GpuError::validation("buffer is not CPU-readable"));
        }
        match self.backend.read_buffer(&buffer.native, offset, size) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.latch_on_error(&e);
                Err(e)
            }
        }
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        self.ensure_not_lost()?;
        let src_size = self.arena.buffer(src)?.desc.size;
        let dst_size = self.arena.buffer(dst)?.desc.size;
        if src_offset + size > src_size || dst_offset + size > dst_size {
            return Err(GpuError::validation("buffer copy out of range"));
        }

        let list = self.current.as_mut().expect("current list");
        Self::track(list, &mut self.arena, src);
        Self::track(list, &mut self.arena, dst);
        list.record(Op::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Surface copies
    // ---------------------------------------------------------------------

    /// Copy `src_rect` of `src` to `dst_point` of `dst`, choosing between a
    /// direct resolve and a texture copy. There is deliberately no
    /// render-and-blit fallback here; incompatible pairs fail.
    pub fn copy_surface(
        &mut self,
        dst: TextureId,
        src: TextureId,
        src_rect: Rect,
        dst_point: (u32, u32),
    ) -> GpuResult<()> {
        self.ensure_not_lost()?;
        let (dst_desc, src_desc) = (
            self.arena.texture(dst)?.desc.clone(),
            self.arena.texture(src)?.desc.clone(),
        );

        if dst_desc.protected != src_desc.protected {
            return Err(GpuError::validation(
                "copies between protected and non-protected memory are forbidden",
            ));
        }
        if src_rect.is_empty() || !src_rect.contained_by(src_desc.width, src_desc.height) {
            return Err(GpuError::validation(format!("invalid copy rect {src_rect:?}")));
        }
        let dst_rect = Rect::new(dst_point.0, dst_point.1, src_rect.width, src_rect.height);
        if !dst_rect.contained_by(dst_desc.width, dst_desc.height) {
            return Err(GpuError::validation("copy destination out of range"));
        }

        if self.caps.can_copy_as_resolve(
            dst_desc.format,
            dst_desc.sample_count,
            src_desc.format,
            src_desc.sample_count,
        ) {
            return self.resolve_texture(src, src_rect, dst, dst_point);
        }

        if self.caps.can_copy_texture(
            dst_desc.format,
            dst_desc.sample_count,
            src_desc.format,
            src_desc.sample_count,
        ) {
            self.transition_texture(dst, ResourceState::CopyDst)?;
            self.transition_texture(src, ResourceState::CopySrc)?;

            let list = self.current.as_mut().expect("current list");
            Self::track(list, &mut self.arena, src);
            Self::track(list, &mut self.arena, dst);
            list.record(Op::CopyTextureToTexture {
                src,
                src_rect,
                dst,
                dst_x: dst_point.0,
                dst_y: dst_point.1,
            });
            return Ok(());
        }

        Err(GpuError::Unsupported(
            "no copy strategy for this surface pair",
        ))
    }

    /// Resolve a multisampled render target into a single-sample texture.
    pub fn resolve_render_target(
        &mut self,
        src: TextureId,
        dst: TextureId,
        rect: Rect,
    ) -> GpuResult<()> {
        self.ensure_not_lost()?;
        let src_samples = self.arena.texture(src)?.desc.sample_count;
        if src_samples <= 1 {
            return Err(GpuError::validation("resolve source is not multisampled"));
        }
        self.resolve_texture(src, rect, dst, (rect.x, rect.y))
    }

    fn resolve_texture(
        &mut self,
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_point: (u32, u32),
    ) -> GpuResult<()> {
        self.transition_texture(dst, ResourceState::ResolveDst)?;
        self.transition_texture(src, ResourceState::ResolveSrc)?;

        let list = self.current.as_mut().expect("current list");
        Self::track(list, &mut self.arena, src);
        Self::track(list, &mut self.arena, dst);
        list.record(Op::ResolveTexture {
            src,
            src_rect,
            dst,
            dst_x: dst_point.0,
            dst_y: dst_point.1,
        });
        Ok(())
    }

    /// Transition a surface into the terminal present state.
    pub fn prepare_for_present(&mut self, texture: TextureId) -> GpuResult<()> {
        self.ensure_not_lost()?;
        self.transition_texture(texture, ResourceState::Present)
    }

    // ---------------------------------------------------------------------
    // Render passes
    // ---------------------------------------------------------------------

    pub fn begin_render_pass(&mut self, target: TextureId, load: LoadOp) -> GpuResult<()> {
        self.ensure_not_lost()?;
        if self.active_pass.is_some() {
            return Err(GpuError::validation("render pass already open"));
        }
        {
            let desc = &self.arena.texture(target)?.desc;
            if !desc.usage.contains(TextureUsage::RENDER_TARGET) {
                return Err(GpuError::validation("target lacks render-target usage"));
            }
        }

        self.transition_texture(target, ResourceState::RenderTarget)?;

        let list = self.current.as_mut().expect("current list");
        // Native binding state does not survive pass boundaries.
        list.invalidate_bindings();
        Self::track(list, &mut self.arena, target);
        list.record(Op::BeginRenderPass { target, load });
        self.active_pass = Some(target);
        Ok(())
    }

    pub fn draw(&mut self, desc: &DrawDesc) -> GpuResult<()> {
        self.ensure_not_lost()?;
        let target = self
            .active_pass
            .ok_or_else(|| GpuError::validation("draw outside a render pass"))?;
        self.arena.buffer(desc.vertex_buffer)?;

        let key = {
            let t = &self.arena.texture(target)?.desc;
            PipelineKey {
                target_format: t.format,
                sample_count: t.sample_count,
            }
        };
        let pipeline = self
            .provider
            .find_or_create_pipeline(&mut self.backend, key)?;

        let binding = match self.provider.cached_uniform_binding(pipeline, desc.color) {
            Some(binding) => binding,
            None => {
                let slice = match self.uniform_ring.allocate(
                    &mut self.backend,
                    &mut self.arena,
                    UNIFORM_BLOCK_SIZE as u64,
                    self.caps.uniform_alignment,
                ) {
                    Ok(slice) => slice,
                    Err(e) => {
                        self.latch_on_error(&e);
                        return Err(e);
                    }
                };
                self.stats.uniform_bytes += slice.size;
                let buffer = self.arena.buffer(slice.buffer)?;
                if let Err(e) = self.backend.write_buffer(
                    &buffer.native,
                    slice.offset,
                    bytemuck::cast_slice(&desc.color),
                ) {
                    self.latch_on_error(&e);
                    return Err(e);
                }
                self.provider
                    .store_uniform_binding(pipeline, desc.color, slice.buffer, slice.offset);
                (slice.buffer, slice.offset)
            }
        };

        let list = self.current.as_mut().expect("current list");
        Self::track(list, &mut self.arena, desc.vertex_buffer);
        Self::track(list, &mut self.arena, binding.0);
        list.set_pipeline(pipeline);
        list.set_vertex_buffer(desc.vertex_buffer, desc.vertex_offset);
        list.set_uniforms(binding.0, binding.1);
        list.record(Op::Draw {
            vertex_count: desc.vertex_count,
            first_vertex: desc.first_vertex,
        });
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> GpuResult<()> {
        if self.active_pass.take().is_none() {
            return Err(GpuError::validation("no render pass open"));
        }
        self.current_list().record(Op::EndRenderPass);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Submission cycle
    // ---------------------------------------------------------------------

    /// Flush recorded work to the queue; `sync_cpu` blocks until it
    /// completes.
    pub fn flush(&mut self, sync_cpu: bool) -> GpuResult<()> {
        self.submit(if sync_cpu {
            SyncQueue::Force
        } else {
            SyncQueue::Skip
        })
    }

    /// Submit the current command list and start a fresh one.
    pub fn submit(&mut self, sync: SyncQueue) -> GpuResult<()> {
        self.ensure_not_lost()?;
        if self.active_pass.is_some() {
            return Err(GpuError::validation("submit inside an open render pass"));
        }

        // A new list carries no CPU-side state assumptions; invalidate
        // per-pipeline caches before anything reaches the queue.
        self.provider.prep_for_submit();

        if !self.current.as_ref().expect("current list").has_work() {
            debug!("submit with no recorded work; skipping queue call");
            self.stats.no_work_submissions += 1;
            self.current_list().fire_finished_callbacks();
            if sync == SyncQueue::Force {
                self.wait_for_queue_completion()?;
                self.check_for_finished_command_lists();
            }
            return Ok(());
        }

        let mut list = self.current.take().expect("current list");
        list.finish_recording();
        self.stats.barrier_batches += list.barrier_batches();
        self.stats.barrier_transitions += list.barrier_transitions();

        let sealed = {
            let Self {
                backend,
                arena,
                provider,
                ..
            } = self;
            backend.seal(list.ops(), arena, provider.pipelines())
        };
        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                // The native close failed; the list must not be submitted.
                self.latch_on_error(&e);
                self.provider.recycle_command_list(list, &mut self.arena);
                self.current = Some(self.provider.find_or_create_command_list());
                return Err(e);
            }
        };
        list.set_sealed(sealed);

        let sealed = list.take_sealed().expect("sealed list");
        if let Err(e) = self.backend.execute(sealed) {
            self.latch_on_error(&e);
            self.provider.recycle_command_list(list, &mut self.arena);
            self.current = Some(self.provider.find_or_create_command_list());
            return Err(e);
        }
        self.stats.submissions += 1;

        self.current_fence_value += 1;
        let fence_value = self.current_fence_value;
        if let Err(e) = self.backend.signal_fence(fence_value) {
            self.latch_on_error(&e);
        }
        list.mark_submitted(fence_value);
        debug!(fence_value, ops = list.ops().len(), "command list submitted");
        self.outstanding.push_back(OutstandingSubmission { list, fence_value });

        if sync == SyncQueue::Force {
            if let Err(e) = self.backend.wait_fence(fence_value) {
                self.latch_on_error(&e);
                self.current = Some(self.provider.find_or_create_command_list());
                return Err(e);
            }
        }

        self.current = Some(self.provider.find_or_create_command_list());

        // Retire after the new list is installed, so releases that enqueue
        // GPU work (deferred state fixups) target the fresh list rather
        // than the one just submitted.
        self.check_for_finished_command_lists();
        Ok(())
    }

    /// Walk the outstanding FIFO from the head and retire every list whose
    /// fence value the device has reached.
    ///
    /// The FIFO is fence-ordered, so stopping at the first unfinished entry
    /// is exact, and one fence read suffices for the whole sweep.
    pub fn check_for_finished_command_lists(&mut self) {
        let completed = self.backend.completed_fence();
        while let Some(front) = self.outstanding.front() {
            if front.fence_value > completed {
                break;
            }
            let mut submission = self.outstanding.pop_front().expect("non-empty FIFO");
            trace!(fence_value = submission.fence_value, "command list retired");
            submission.list.retire(&mut self.arena);
            self.stats.lists_retired += 1;
            self.provider
                .recycle_command_list(submission.list, &mut self.arena);
        }
        self.staging.reclaim(&self.arena);
        self.uniform_ring.reclaim(&self.arena);
    }

    /// Block until the queue reaches the last issued fence value.
    pub fn wait_for_queue_completion(&mut self) -> GpuResult<()> {
        if self.backend.completed_fence() < self.current_fence_value {
            if let Err(e) = self.backend.wait_fence(self.current_fence_value) {
                self.latch_on_error(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Register a callback to fire once all work submitted up to and
    /// including this moment has retired.
    ///
    /// The callback is attached to the current list *and* to the most
    /// recently submitted outstanding list: if the current list ends up
    /// empty it drops its handle immediately, and the newest outstanding
    /// list, which must finish after everything before it, so the timing
    /// contract holds either way.
    pub fn add_finished_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        let callback = FinishedCallback::new(callback);
        if let Some(back) = self.outstanding.back_mut() {
            back.list.add_finished_callback(Arc::clone(&callback));
        }
        self.current_list().add_finished_callback(callback);
    }

    /// Signal a new fence value on the queue and return it.
    pub fn insert_fence(&mut self) -> GpuResult<u64> {
        self.ensure_not_lost()?;
        self.current_fence_value += 1;
        let value = self.current_fence_value;
        if let Err(e) = self.backend.signal_fence(value) {
            self.latch_on_error(&e);
            return Err(e);
        }
        Ok(value)
    }

    /// Non-blocking check: has the device reached `value`?
    pub fn wait_fence(&mut self, value: u64) -> bool {
        self.backend.completed_fence() >= value
    }

    // ---------------------------------------------------------------------
    // Semaphores
    // ---------------------------------------------------------------------

    pub fn make_semaphore(&mut self) -> GpuResult<B::Semaphore> {
        self.ensure_not_lost()?;
        self.backend.create_semaphore()
    }

    /// Adopt a semaphore created by another context for use on this queue.
    pub fn wrap_semaphore(&mut self, semaphore: B::Semaphore) -> B::Semaphore {
        semaphore
    }

    /// Signal `semaphore` to `value` once the queue reaches this point.
    pub fn insert_semaphore(&mut self, semaphore: &B::Semaphore, value: u64) -> GpuResult<()> {
        self.ensure_not_lost()?;
        self.backend.signal_semaphore(semaphore, value)
    }

    /// Make the queue wait until `semaphore` reaches `value`.
    pub fn wait_semaphore(&mut self, semaphore: &B::Semaphore, value: u64) -> GpuResult<()> {
        self.ensure_not_lost()?;
        self.backend.wait_semaphore(semaphore, value)
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    fn destroy_resources(&mut self) {
        if let Some(mut list) = self.current.take() {
            if list.state() == ListState::Recording {
                list.finish_recording();
            }
            list.reset(&mut self.arena);
        }

        if !self.device_lost {
            let _ = self.wait_for_queue_completion();
        }

        // Everything on the queue has either finished or can never finish;
        // release in submission order either way.
        while let Some(mut submission) = self.outstanding.pop_front() {
            submission.list.retire(&mut self.arena);
        }

        self.staging.destroy(&mut self.arena);
        self.uniform_ring.destroy(&mut self.arena);
    }
}

impl<B: GpuBackend> Drop for GpuDevice<B> {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}
