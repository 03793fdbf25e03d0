//! Software device implementing the discrete command-list model.
//!
//! The queue is a dedicated thread that executes sealed lists in submission
//! order and advances the fence, so the engine's lifetime rules are
//! exercised against a genuinely asynchronous executor. Sealing validates
//! the explicit-barrier contract: every copy/resolve/render operation must
//! find its textures in the state the recorded transitions put them in, and
//! a violation fails the close call, exactly like a native close error.
//!
//! Tests drive timing through [`SoftController`]: pausing the queue holds
//! every submission in flight; resuming lets them retire in order.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::backend::GpuBackend;
use crate::caps::GpuCaps;
use crate::cmd::{LoadOp, Op};
use crate::error::{GpuError, GpuResult};
use crate::format::{mip_dimension, PixelFormat, Rect, SubresourceFootprint};
use crate::provider::{PipelineKey, PipelineTable};
use crate::resource::{BufferDesc, ResourceArena, TextureDesc};
use crate::state::ResourceState;

const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

type TexelMem = Arc<Mutex<Vec<Vec<u8>>>>;
type ByteMem = Arc<Mutex<Vec<u8>>>;

pub struct SoftTexture {
    /// Tightly packed block rows, one allocation per mip level.
    mem: TexelMem,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// State as the queue will observe it once all sealed lists execute.
    /// Sealing happens in submission order on one thread, so a plain `Cell`
    /// is enough.
    sim_state: Cell<ResourceState>,
}

pub struct SoftBuffer {
    mem: ByteMem,
}

pub struct SoftPipeline {
    pub key: PipelineKey,
}

/// Cross-queue timeline semaphore: a value guarded by a condvar.
#[derive(Clone)]
pub struct SoftSemaphore(Arc<SemaphoreState>);

struct SemaphoreState {
    value: Mutex<u64>,
    signaled: Condvar,
}

struct SharedState {
    fence_value: Mutex<u64>,
    fence_signaled: Condvar,
    paused: Mutex<bool>,
    unpaused: Condvar,
    lists_executed: AtomicU64,
    lost: AtomicBool,
}

/// Test/diagnostic handle onto a [`SoftBackend`]'s queue.
#[derive(Clone)]
pub struct SoftController {
    shared: Arc<SharedState>,
}

impl SoftController {
    /// Hold all queued work (submissions stay in flight, the fence stops
    /// advancing).
    pub fn pause_queue(&self) {
        *self.shared.paused.lock().unwrap() = true;
    }

    pub fn resume_queue(&self) {
        let mut paused = self.shared.paused.lock().unwrap();
        *paused = false;
        self.shared.unpaused.notify_all();
    }

    pub fn lists_executed(&self) -> u64 {
        self.shared.lists_executed.load(Ordering::SeqCst)
    }

    pub fn completed_fence(&self) -> u64 {
        *self.shared.fence_value.lock().unwrap()
    }

    /// Make every subsequent queue-touching call report a lost device.
    pub fn inject_device_loss(&self) {
        self.shared.lost.store(true, Ordering::SeqCst);
    }
}

enum QueueMsg {
    Execute(SoftCommandList),
    SignalFence(u64),
    SignalSemaphore(SoftSemaphore, u64),
    WaitSemaphore(SoftSemaphore, u64),
}

/// A sealed, queue-ready list: ops with every id resolved to the storage
/// it touches.
pub struct SoftCommandList(Vec<ExecOp>);

enum ExecOp {
    CopyBufferToTexture {
        src: ByteMem,
        dst: TexelMem,
        dst_width: u32,
        format: PixelFormat,
        footprints: Vec<SubresourceFootprint>,
        dst_x: u32,
        dst_y: u32,
    },
    CopyTextureToBuffer {
        src: TexelMem,
        src_width: u32,
        format: PixelFormat,
        src_rect: Rect,
        dst: ByteMem,
        footprint: SubresourceFootprint,
    },
    CopyTextureToTexture {
        src: TexelMem,
        src_width: u32,
        dst: TexelMem,
        dst_width: u32,
        format: PixelFormat,
        src_rect: Rect,
        dst_x: u32,
        dst_y: u32,
    },
    CopyBufferToBuffer {
        src: ByteMem,
        src_offset: u64,
        dst: ByteMem,
        dst_offset: u64,
        size: u64,
    },
    Clear {
        dst: TexelMem,
        dst_width: u32,
        dst_height: u32,
        format: PixelFormat,
        color: [f32; 4],
    },
}

/// Software implementation of [`GpuBackend`].
pub struct SoftBackend {
    caps: GpuCaps,
    shared: Arc<SharedState>,
    sender: Option<Sender<QueueMsg>>,
    worker: Option<JoinHandle<()>>,
    sealed_barrier_batches: u64,
    sealed_barrier_transitions: u64,
}

impl SoftBackend {
    pub fn new() -> Self {
        let shared = Arc::new(SharedState {
            fence_value: Mutex::new(0),
            fence_signaled: Condvar::new(),
            paused: Mutex::new(false),
            unpaused: Condvar::new(),
            lists_executed: AtomicU64::new(0),
            lost: AtomicBool::new(false),
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("litho-soft-queue".into())
            .spawn(move || queue_main(receiver, worker_shared))
            .expect("spawn soft queue thread");

        Self {
            caps: GpuCaps {
                max_texture_size: 16384,
                max_sample_count: 4,
                uniform_alignment: 256,
                supports_bc_formats: true,
                supports_protected: true,
                supports_semaphores: true,
            },
            shared,
            sender: Some(sender),
            worker: Some(worker),
            sealed_barrier_batches: 0,
            sealed_barrier_transitions: 0,
        }
    }

    pub fn controller(&self) -> SoftController {
        SoftController {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Native barrier submissions this backend has sealed.
    pub fn sealed_barrier_batches(&self) -> u64 {
        self.sealed_barrier_batches
    }

    /// Individual transitions across all sealed barrier submissions.
    pub fn sealed_barrier_transitions(&self) -> u64 {
        self.sealed_barrier_transitions
    }

    fn check_lost(&self) -> GpuResult<()> {
        if self.shared.lost.load(Ordering::SeqCst) {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn send(&self, msg: QueueMsg) -> GpuResult<()> {
        self.check_lost()?;
        self.sender
            .as_ref()
            .expect("queue sender alive")
            .send(msg)
            .map_err(|_| GpuError::Native("soft queue thread is gone".into()))
    }

    fn expect_state(
        texture: &SoftTexture,
        required: ResourceState,
        what: &str,
    ) -> GpuResult<()> {
        let current = texture.sim_state.get();
        if current != required {
            return Err(GpuError::Native(format!(
                "{what} requires {required:?} but texture is in {current:?}"
            )));
        }
        Ok(())
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftBackend {
    fn drop(&mut self) {
        drop(self.sender.take());
        // The worker may be parked on the pause condvar; release it so the
        // closed channel is observed and the thread exits.
        {
            let mut paused = self.shared.paused.lock().unwrap();
            *paused = false;
            self.shared.unpaused.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl GpuBackend for SoftBackend {
    type Texture = SoftTexture;
    type Buffer = SoftBuffer;
    type Pipeline = SoftPipeline;
    type SealedList = SoftCommandList;
    type Semaphore = SoftSemaphore;

    fn caps(&self) -> &GpuCaps {
        &self.caps
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<SoftTexture> {
        self.check_lost()?;
        let (block_w, block_h) = desc.format.block_dimensions();
        let bpb = desc.format.bytes_per_block() as usize;

        let mut mips = Vec::with_capacity(desc.mip_level_count as usize);
        for level in 0..desc.mip_level_count {
            let w = mip_dimension(desc.width, level);
            let h = mip_dimension(desc.height, level);
            let blocks = w.div_ceil(block_w) as usize * h.div_ceil(block_h) as usize;
            mips.push(vec![0u8; blocks * bpb]);
        }

        Ok(SoftTexture {
            mem: Arc::new(Mutex::new(mips)),
            width: desc.width,
            height: desc.height,
            format: desc.format,
            sim_state: Cell::new(desc.initial_state()),
        })
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> GpuResult<SoftBuffer> {
        self.check_lost()?;
        Ok(SoftBuffer {
            mem: Arc::new(Mutex::new(vec![0u8; desc.size as usize])),
        })
    }

    fn write_buffer(&mut self, buffer: &SoftBuffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.check_lost()?;
        let mut mem = buffer.mem.lock().unwrap();
        let start = offset as usize;
        let end = start + data.len();
        if end > mem.len() {
            return Err(GpuError::validation(format!(
                "buffer write of {} bytes at {offset} exceeds size {}",
                data.len(),
                mem.len()
            )));
        }
        mem[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &SoftBuffer, offset: u64, size: u64) -> GpuResult<Vec<u8>> {
        self.check_lost()?;
        let mem = buffer.mem.lock().unwrap();
        let start = offset as usize;
        let end = start + size as usize;
        if end > mem.len() {
            return Err(GpuError::validation(format!(
                "buffer read of {size} bytes at {offset} exceeds size {}",
                mem.len()
            )));
        }
        Ok(mem[start..end].to_vec())
    }

    fn create_pipeline(&mut self, key: &PipelineKey) -> GpuResult<SoftPipeline> {
        self.check_lost()?;
        Ok(SoftPipeline { key: *key })
    }

    fn seal(
        &mut self,
        ops: &[Op],
        arena: &ResourceArena<Self>,
        pipelines: &PipelineTable<Self>,
    ) -> GpuResult<SoftCommandList> {
        self.check_lost()?;

        let mut exec = Vec::new();
        let mut in_pass = false;
        let mut pipeline_bound = false;
        let mut vertex_bound = false;

        for op in ops {
            match op {
                Op::Barriers(batch) => {
                    self.sealed_barrier_batches += 1;
                    self.sealed_barrier_transitions += batch.len() as u64;
                    for t in batch {
                        let tex = arena.texture(t.texture)?;
                        Self::expect_state(&tex.native, t.from, "transition")?;
                        tex.native.sim_state.set(t.to);
                    }
                }
                Op::CopyBufferToTexture {
                    src,
                    dst,
                    footprints,
                    width: _,
                    height: _,
                    dst_x,
                    dst_y,
                } => {
                    let src = arena.buffer(*src)?;
                    let dst = arena.texture(*dst)?;
                    Self::expect_state(&dst.native, ResourceState::CopyDst, "buffer-to-texture copy")?;
                    exec.push(ExecOp::CopyBufferToTexture {
                        src: Arc::clone(&src.native.mem),
                        dst: Arc::clone(&dst.native.mem),
                        dst_width: dst.native.width,
                        format: dst.native.format,
                        footprints: footprints.clone(),
                        dst_x: *dst_x,
                        dst_y: *dst_y,
                    });
                }
                Op::CopyTextureToBuffer {
                    src,
                    src_rect,
                    dst,
                    footprint,
                } => {
                    let src = arena.texture(*src)?;
                    let dst = arena.buffer(*dst)?;
                    Self::expect_state(&src.native, ResourceState::CopySrc, "texture-to-buffer copy")?;
                    exec.push(ExecOp::CopyTextureToBuffer {
                        src: Arc::clone(&src.native.mem),
                        src_width: src.native.width,
                        format: src.native.format,
                        src_rect: *src_rect,
                        dst: Arc::clone(&dst.native.mem),
                        footprint: *footprint,
                    });
                }
                Op::CopyTextureToTexture {
                    src,
                    src_rect,
                    dst,
                    dst_x,
                    dst_y,
                } => {
                    let src = arena.texture(*src)?;
                    let dst = arena.texture(*dst)?;
                    Self::expect_state(&src.native, ResourceState::CopySrc, "texture copy")?;
                    Self::expect_state(&dst.native, ResourceState::CopyDst, "texture copy")?;
                    exec.push(ExecOp::CopyTextureToTexture {
                        src: Arc::clone(&src.native.mem),
                        src_width: src.native.width,
                        dst: Arc::clone(&dst.native.mem),
                        dst_width: dst.native.width,
                        format: dst.native.format,
                        src_rect: *src_rect,
                        dst_x: *dst_x,
                        dst_y: *dst_y,
                    });
                }
                Op::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src = arena.buffer(*src)?;
                    let dst = arena.buffer(*dst)?;
                    exec.push(ExecOp::CopyBufferToBuffer {
                        src: Arc::clone(&src.native.mem),
                        src_offset: *src_offset,
                        dst: Arc::clone(&dst.native.mem),
                        dst_offset: *dst_offset,
                        size: *size,
                    });
                }
                Op::ResolveTexture {
                    src,
                    src_rect,
                    dst,
                    dst_x,
                    dst_y,
                } => {
                    let src = arena.texture(*src)?;
                    let dst = arena.texture(*dst)?;
                    Self::expect_state(&src.native, ResourceState::ResolveSrc, "resolve")?;
                    Self::expect_state(&dst.native, ResourceState::ResolveDst, "resolve")?;
                    // The software queue keeps one sample per texel, so a
                    // resolve degenerates to a rect copy.
                    exec.push(ExecOp::CopyTextureToTexture {
                        src: Arc::clone(&src.native.mem),
                        src_width: src.native.width,
                        dst: Arc::clone(&dst.native.mem),
                        dst_width: dst.native.width,
                        format: dst.native.format,
                        src_rect: *src_rect,
                        dst_x: *dst_x,
                        dst_y: *dst_y,
                    });
                }
                Op::BeginRenderPass { target, load } => {
                    if in_pass {
                        return Err(GpuError::Native("render pass already open".into()));
                    }
                    let tex = arena.texture(*target)?;
                    Self::expect_state(&tex.native, ResourceState::RenderTarget, "render pass")?;
                    in_pass = true;
                    pipeline_bound = false;
                    vertex_bound = false;
                    if let LoadOp::Clear(color) = load {
                        exec.push(ExecOp::Clear {
                            dst: Arc::clone(&tex.native.mem),
                            dst_width: tex.native.width,
                            dst_height: tex.native.height,
                            format: tex.native.format,
                            color: *color,
                        });
                    }
                }
                Op::EndRenderPass => {
                    if !in_pass {
                        return Err(GpuError::Native("no render pass open".into()));
                    }
                    in_pass = false;
                }
                Op::SetPipeline(id) => {
                    if pipelines.native(*id).is_none() {
                        return Err(GpuError::Native(format!("unknown pipeline {id:?}")));
                    }
                    pipeline_bound = true;
                }
                Op::SetVertexBuffer { buffer, .. } => {
                    arena.buffer(*buffer)?;
                    vertex_bound = true;
                }
                Op::SetUniforms { buffer, .. } => {
                    arena.buffer(*buffer)?;
                }
                Op::Draw { .. } => {
                    if !in_pass {
                        return Err(GpuError::Native("draw outside render pass".into()));
                    }
                    if !pipeline_bound || !vertex_bound {
                        return Err(GpuError::Native(
                            "draw without pipeline or vertex buffer bound".into(),
                        ));
                    }
                    // Rasterization is out of scope for this engine; the
                    // draw has been validated and ordering-tracked, nothing
                    // executes.
                }
            }
        }

        if in_pass {
            return Err(GpuError::Native("unterminated render pass".into()));
        }

        Ok(SoftCommandList(exec))
    }

    fn execute(&mut self, list: SoftCommandList) -> GpuResult<()> {
        self.send(QueueMsg::Execute(list))
    }

    fn signal_fence(&mut self, value: u64) -> GpuResult<()> {
        self.send(QueueMsg::SignalFence(value))
    }

    fn completed_fence(&mut self) -> u64 {
        *self.shared.fence_value.lock().unwrap()
    }

    fn wait_fence(&mut self, value: u64) -> GpuResult<()> {
        self.check_lost()?;
        let guard = self.shared.fence_value.lock().unwrap();
        let (guard, timeout) = self
            .shared
            .fence_signaled
            .wait_timeout_while(guard, QUEUE_WAIT_TIMEOUT, |v| *v < value)
            .unwrap();
        if timeout.timed_out() && *guard < value {
            return Err(GpuError::Native(format!(
                "timed out waiting for fence value {value} (completed {})",
                *guard
            )));
        }
        Ok(())
    }

    fn create_semaphore(&mut self) -> GpuResult<SoftSemaphore> {
        self.check_lost()?;
        Ok(SoftSemaphore(Arc::new(SemaphoreState {
            value: Mutex::new(0),
            signaled: Condvar::new(),
        })))
    }

    fn signal_semaphore(&mut self, semaphore: &SoftSemaphore, value: u64) -> GpuResult<()> {
        self.send(QueueMsg::SignalSemaphore(semaphore.clone(), value))
    }

    fn wait_semaphore(&mut self, semaphore: &SoftSemaphore, value: u64) -> GpuResult<()> {
        self.send(QueueMsg::WaitSemaphore(semaphore.clone(), value))
    }
}

fn queue_main(receiver: Receiver<QueueMsg>, shared: Arc<SharedState>) {
    while let Ok(msg) = receiver.recv() {
        // Hold here while paused; pausing models a device that has accepted
        // work but not finished it.
        {
            let paused = shared.paused.lock().unwrap();
            let _unused = shared
                .unpaused
                .wait_while(paused, |p| *p)
                .unwrap();
        }

        match msg {
            QueueMsg::Execute(list) => {
                for op in &list.0 {
                    run_op(op);
                }
                shared.lists_executed.fetch_add(1, Ordering::SeqCst);
            }
            QueueMsg::SignalFence(value) => {
                let mut fence = shared.fence_value.lock().unwrap();
                if value > *fence {
                    *fence = value;
                }
                shared.fence_signaled.notify_all();
            }
            QueueMsg::SignalSemaphore(semaphore, value) => {
                let mut v = semaphore.0.value.lock().unwrap();
                if value > *v {
                    *v = value;
                }
                semaphore.0.signaled.notify_all();
            }
            QueueMsg::WaitSemaphore(semaphore, value) => {
                let guard = semaphore.0.value.lock().unwrap();
                let (_guard, timeout) = semaphore
                    .0
                    .signaled
                    .wait_timeout_while(guard, QUEUE_WAIT_TIMEOUT, |v| *v < value)
                    .unwrap();
                if timeout.timed_out() {
                    warn!(value, "soft queue semaphore wait timed out");
                }
            }
        }
    }
}

fn run_op(op: &ExecOp) {
    match op {
        ExecOp::CopyBufferToTexture {
            src,
            dst,
            dst_width,
            format,
            footprints,
            dst_x,
            dst_y,
        } => {
            let src = src.lock().unwrap();
            let mut dst_mips = dst.lock().unwrap();
            let (block_w, block_h) = format.block_dimensions();
            let bpb = format.bytes_per_block() as usize;
            let block_x = (*dst_x / block_w) as usize;
            let block_y = (*dst_y / block_h) as usize;

            for (level, fp) in footprints.iter().enumerate() {
                let dst_blocks_w = mip_dimension(*dst_width, level as u32).div_ceil(block_w) as usize;
                let dst_pitch = dst_blocks_w * bpb;
                let dst_base = block_y * dst_pitch + block_x * bpb;
                let dst_mip = &mut dst_mips[level];
                litho_gpu_utils::copy_rect(
                    &mut dst_mip[dst_base..],
                    dst_pitch,
                    &src[fp.offset as usize..],
                    fp.row_pitch as usize,
                    fp.row_bytes as usize,
                    fp.rows as usize,
                );
            }
        }
        ExecOp::CopyTextureToBuffer {
            src,
            src_width,
            format,
            src_rect,
            dst,
            footprint,
        } => {
            let src_mips = src.lock().unwrap();
            let mut dst = dst.lock().unwrap();
            let (block_w, block_h) = format.block_dimensions();
            let bpb = format.bytes_per_block() as usize;
            let src_blocks_w = src_width.div_ceil(block_w) as usize;
            let src_pitch = src_blocks_w * bpb;
            let src_base =
                (src_rect.y / block_h) as usize * src_pitch + (src_rect.x / block_w) as usize * bpb;
            litho_gpu_utils::copy_rect(
                &mut dst[footprint.offset as usize..],
                footprint.row_pitch as usize,
                &src_mips[0][src_base..],
                src_pitch,
                footprint.row_bytes as usize,
                footprint.rows as usize,
            );
        }
        ExecOp::CopyTextureToTexture {
            src,
            src_width,
            dst,
            dst_width,
            format,
            src_rect,
            dst_x,
            dst_y,
        } => {
            let (block_w, block_h) = format.block_dimensions();
            let bpb = format.bytes_per_block() as usize;
            let rows = src_rect.height.div_ceil(block_h) as usize;
            let row_bytes = src_rect.width.div_ceil(block_w) as usize * bpb;

            let src_pitch = src_width.div_ceil(block_w) as usize * bpb;
            let src_base =
                (src_rect.y / block_h) as usize * src_pitch + (src_rect.x / block_w) as usize * bpb;

            // Snapshot the source region first; src and dst may alias.
            let scratch = {
                let src_mips = src.lock().unwrap();
                let mut scratch = vec![0u8; row_bytes * rows];
                litho_gpu_utils::copy_rect(
                    &mut scratch,
                    row_bytes,
                    &src_mips[0][src_base..],
                    src_pitch,
                    row_bytes,
                    rows,
                );
                scratch
            };

            let mut dst_mips = dst.lock().unwrap();
            let dst_pitch = dst_width.div_ceil(block_w) as usize * bpb;
            let dst_base =
                (*dst_y / block_h) as usize * dst_pitch + (*dst_x / block_w) as usize * bpb;
            litho_gpu_utils::copy_rect(
                &mut dst_mips[0][dst_base..],
                dst_pitch,
                &scratch,
                row_bytes,
                row_bytes,
                rows,
            );
        }
        ExecOp::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            let scratch = {
                let src = src.lock().unwrap();
                src[*src_offset as usize..(*src_offset + *size) as usize].to_vec()
            };
            let mut dst = dst.lock().unwrap();
            dst[*dst_offset as usize..(*dst_offset + *size) as usize].copy_from_slice(&scratch);
        }
        ExecOp::Clear {
            dst,
            dst_width,
            dst_height,
            format,
            color,
        } => {
            let texel = clear_texel(*format, *color);
            let mut dst_mips = dst.lock().unwrap();
            let count = *dst_width as usize * *dst_height as usize;
            let mip0 = &mut dst_mips[0];
            for i in 0..count {
                mip0[i * texel.len()..(i + 1) * texel.len()].copy_from_slice(&texel);
            }
        }
    }
}

fn clear_texel(format: PixelFormat, color: [f32; 4]) -> Vec<u8> {
    let to_u8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    let [r, g, b, a] = color;
    match format {
        PixelFormat::R8Unorm => vec![to_u8(r)],
        PixelFormat::Rgba8Unorm => vec![to_u8(r), to_u8(g), to_u8(b), to_u8(a)],
        PixelFormat::Bgra8Unorm => vec![to_u8(b), to_u8(g), to_u8(r), to_u8(a)],
        // Compressed formats are not renderable; creation validation keeps
        // them out of render passes.
        PixelFormat::Bc1RgbaUnorm | PixelFormat::Bc3RgbaUnorm => unreachable!(),
    }
}
