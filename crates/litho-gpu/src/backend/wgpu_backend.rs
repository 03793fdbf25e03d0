//! `wgpu` implementation of the backend-agnostic native seam.
//!
//! This is the command-buffer model: hazards are tracked by the native API,
//! so recorded barrier batches seal to nothing, and resolves are expressed
//! as render-pass resolve attachments. Fence completion is observed through
//! `Queue::on_submitted_work_done`, which fires in submission order and
//! keeps the engine's monotonic-fence contract intact.

use std::collections::HashMap;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;

use crate::backend::GpuBackend;
use crate::caps::GpuCaps;
use crate::cmd::{LoadOp, Op};
use crate::error::{GpuError, GpuResult};
use crate::format::{mip_dimension, PixelFormat};
use crate::provider::{PipelineKey, PipelineTable};
use crate::resource::{BufferDesc, BufferId, BufferUsage, Protected, ResourceArena, TextureDesc, TextureUsage};

const BIND_GROUP_CACHE_CAPACITY: usize = 64;
const UNIFORM_BLOCK_SIZE: u64 = 16;

/// Solid-color pipeline used for the engine's draw path. The shader is part
/// of the device, created once at init; pipeline variants differ only in
/// target format and sample count.
const PASSTHROUGH_SHADER: &str = r#"
struct Params {
    color: vec4<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;

@vertex
fn vs_main(@location(0) pos: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(pos, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return params.color;
}
"#;

pub struct WgpuTexture {
    texture: wgpu::Texture,
}

pub struct WgpuPipeline {
    pipeline: wgpu::RenderPipeline,
}

/// WebGPU exposes no cross-API semaphore objects; creation always fails and
/// [`GpuCaps::supports_semaphores`] is false.
#[derive(Clone)]
pub struct WgpuSemaphore;

/// `wgpu` implementation of [`GpuBackend`].
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: GpuCaps,

    shader: wgpu::ShaderModule,
    uniform_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Bind groups over staging chunks, keyed by the engine's buffer id.
    /// Ids are never reused, so a stale entry can only waste a slot.
    bind_groups: LruCache<BufferId, Arc<wgpu::BindGroup>>,

    completed_fence: Arc<AtomicU64>,
}

impl WgpuBackend {
    /// Create a backend without a presentation surface.
    ///
    /// Returns [`GpuError::Unsupported`] when no adapter is available so
    /// callers (tests in particular) can skip rather than fail.
    pub async fn new_headless() -> GpuResult<Self> {
        // On Linux the GL backend can emit noisy warnings when
        // XDG_RUNTIME_DIR is unset or has loose permissions; point it at a
        // private per-process directory so headless callers don't have to
        // care about display-server environment details.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let needs_runtime_dir = match std::env::var("XDG_RUNTIME_DIR") {
                Ok(dir) if !dir.is_empty() => match std::fs::metadata(&dir) {
                    Ok(meta) => !meta.is_dir() || (meta.permissions().mode() & 0o077) != 0,
                    Err(_) => true,
                },
                _ => true,
            };
            if needs_runtime_dir {
                let dir = std::env::temp_dir()
                    .join(format!("litho-wgpu-xdg-runtime-{}", std::process::id()));
                let _ = std::fs::create_dir_all(&dir);
                let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
                std::env::set_var("XDG_RUNTIME_DIR", &dir);
            }
        }

        // Prefer GL on Linux: some Vulkan software adapters (lavapipe) have
        // been unreliable in headless CI environments.
        let adapter = if cfg!(target_os = "linux") {
            let gl_instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::GL,
                ..Default::default()
            });
            let gl_adapter = gl_instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await;
            match gl_adapter {
                Some(adapter) => Some(adapter),
                None => {
                    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                        backends: wgpu::Backends::PRIMARY,
                        ..Default::default()
                    });
                    instance
                        .request_adapter(&wgpu::RequestAdapterOptions {
                            power_preference: wgpu::PowerPreference::HighPerformance,
                            compatible_surface: None,
                            force_fallback_adapter: false,
                        })
                        .await
                }
            }
        } else {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
        };

        let Some(adapter) = adapter else {
            return Err(GpuError::Unsupported("no compatible wgpu adapter"));
        };

        let mut features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::TEXTURE_COMPRESSION_BC) {
            features |= wgpu::Features::TEXTURE_COMPRESSION_BC;
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("litho gpu device"),
                    required_features: features,
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|e| GpuError::Native(format!("request_device: {e}")))?;

        Ok(Self::from_device(device, queue, features))
    }

    fn from_device(device: wgpu::Device, queue: wgpu::Queue, features: wgpu::Features) -> Self {
        let limits = device.limits();
        let caps = GpuCaps {
            max_texture_size: limits.max_texture_dimension_2d,
            max_sample_count: 4,
            uniform_alignment: limits.min_uniform_buffer_offset_alignment as u64,
            supports_bc_formats: features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC),
            supports_protected: false,
            supports_semaphores: false,
        };

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("litho passthrough"),
            source: wgpu::ShaderSource::Wgsl(PASSTHROUGH_SHADER.into()),
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("litho uniforms"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(UNIFORM_BLOCK_SIZE),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("litho pipeline layout"),
            bind_group_layouts: &[&uniform_layout],
            push_constant_ranges: &[],
        });

        Self {
            device,
            queue,
            caps,
            shader,
            uniform_layout,
            pipeline_layout,
            bind_groups: LruCache::new(
                NonZeroUsize::new(BIND_GROUP_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
            completed_fence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn bind_group_for(
        &mut self,
        id: BufferId,
        buffer: &wgpu::Buffer,
    ) -> Arc<wgpu::BindGroup> {
        if let Some(bg) = self.bind_groups.get(&id) {
            return Arc::clone(bg);
        }
        let bg = Arc::new(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("litho uniform block"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: 0,
                    size: NonZeroU64::new(UNIFORM_BLOCK_SIZE),
                }),
            }],
        }));
        self.bind_groups.put(id, Arc::clone(&bg));
        bg
    }
}

fn map_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        PixelFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        PixelFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
    }
}

fn map_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    out
}

fn map_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::COPY_SRC) {
        out |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    if usage.contains(BufferUsage::MAP_READ) {
        out |= wgpu::BufferUsages::MAP_READ;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    out
}

fn clear_color(color: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: color[0] as f64,
        g: color[1] as f64,
        b: color[2] as f64,
        a: color[3] as f64,
    }
}

impl GpuBackend for WgpuBackend {
    type Texture = WgpuTexture;
    type Buffer = wgpu::Buffer;
    type Pipeline = WgpuPipeline;
    type SealedList = wgpu::CommandBuffer;
    type Semaphore = WgpuSemaphore;

    fn caps(&self) -> &GpuCaps {
        &self.caps
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GpuResult<WgpuTexture> {
        if desc.protected == Protected::Yes {
            return Err(GpuError::Unsupported("protected memory on wgpu"));
        }
        if desc.format.is_compressed() && !self.caps.supports_bc_formats {
            return Err(GpuError::Unsupported("BC formats on this adapter"));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("litho texture"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_level_count,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: map_format(desc.format),
            usage: map_texture_usage(desc.usage),
            view_formats: &[],
        });

        Ok(WgpuTexture { texture })
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> GpuResult<wgpu::Buffer> {
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("litho buffer"),
            size: desc.size,
            usage: map_buffer_usage(desc.usage),
            mapped_at_creation: false,
        }))
    }

    fn write_buffer(&mut self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        // Copies must be 4-byte sized; pad with zeros when needed.
        if data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            self.queue.write_buffer(buffer, offset, data);
        } else {
            let padded_len = data.len().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
            let mut padded = vec![0u8; padded_len];
            padded[..data.len()].copy_from_slice(data);
            self.queue.write_buffer(buffer, offset, &padded);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &wgpu::Buffer, offset: u64, size: u64) -> GpuResult<Vec<u8>> {
        let slice = buffer.slice(offset..offset + size);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);

        let mapped = pollster::block_on(receiver.receive())
            .ok_or_else(|| GpuError::Native("buffer map callback dropped".into()))?;
        mapped.map_err(|e| GpuError::Native(format!("map_async: {e}")))?;

        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }

    fn create_pipeline(&mut self, key: &PipelineKey) -> GpuResult<WgpuPipeline> {
        const ATTRS: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: 0,
        }];

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("litho solid color"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: 8,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &ATTRS,
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: map_format(key.target_format),
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState {
                    count: key.sample_count,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
            });

        Ok(WgpuPipeline { pipeline })
    }

    fn seal(
        &mut self,
        ops: &[Op],
        arena: &ResourceArena<Self>,
        pipelines: &PipelineTable<Self>,
    ) -> GpuResult<wgpu::CommandBuffer> {
        // Materialize the views and bind groups the encoder will borrow.
        // They must outlive the render passes below.
        let mut views: HashMap<usize, wgpu::TextureView> = HashMap::new();
        let mut resolve_views: HashMap<usize, wgpu::TextureView> = HashMap::new();
        let mut uniform_groups: HashMap<BufferId, Arc<wgpu::BindGroup>> = HashMap::new();

        for (i, op) in ops.iter().enumerate() {
            match op {
                Op::BeginRenderPass { target, .. } => {
                    let tex = arena.texture(*target)?;
                    views.insert(
                        i,
                        tex.native
                            .texture
                            .create_view(&wgpu::TextureViewDescriptor::default()),
                    );
                }
                Op::ResolveTexture { src, dst, .. } => {
                    let src = arena.texture(*src)?;
                    let dst = arena.texture(*dst)?;
                    views.insert(
                        i,
                        src.native
                            .texture
                            .create_view(&wgpu::TextureViewDescriptor::default()),
                    );
                    resolve_views.insert(
                        i,
                        dst.native
                            .texture
                            .create_view(&wgpu::TextureViewDescriptor::default()),
                    );
                }
                Op::SetUniforms { buffer, .. } => {
                    if !uniform_groups.contains_key(buffer) {
                        let native = &arena.buffer(*buffer)?.native;
                        let bg = self.bind_group_for(*buffer, native);
                        uniform_groups.insert(*buffer, bg);
                    }
                }
                _ => {}
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("litho command list"),
            });

        let mut i = 0;
        while i < ops.len() {
            match &ops[i] {
                // Hazards are tracked by wgpu; recorded transitions carry no
                // native work on this backend.
                Op::Barriers(_) => {}
                Op::CopyBufferToTexture {
                    src,
                    dst,
                    footprints,
                    width,
                    height,
                    dst_x,
                    dst_y,
                } => {
                    let src = &arena.buffer(*src)?.native;
                    let dst = &arena.texture(*dst)?.native.texture;
                    for (level, fp) in footprints.iter().enumerate() {
                        encoder.copy_buffer_to_texture(
                            wgpu::ImageCopyBuffer {
                                buffer: src,
                                layout: wgpu::ImageDataLayout {
                                    offset: fp.offset,
                                    bytes_per_row: Some(fp.row_pitch as u32),
                                    rows_per_image: None,
                                },
                            },
                            wgpu::ImageCopyTexture {
                                texture: dst,
                                mip_level: level as u32,
                                origin: wgpu::Origin3d {
                                    x: *dst_x,
                                    y: *dst_y,
                                    z: 0,
                                },
                                aspect: wgpu::TextureAspect::All,
                            },
                            wgpu::Extent3d {
                                width: mip_dimension(*width, level as u32),
                                height: mip_dimension(*height, level as u32),
                                depth_or_array_layers: 1,
                            },
                        );
                    }
                }
                Op::CopyTextureToBuffer {
                    src,
                    src_rect,
                    dst,
                    footprint,
                } => {
                    let src = &arena.texture(*src)?.native.texture;
                    let dst = &arena.buffer(*dst)?.native;
                    encoder.copy_texture_to_buffer(
                        wgpu::ImageCopyTexture {
                            texture: src,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: src_rect.x,
                                y: src_rect.y,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::ImageCopyBuffer {
                            buffer: dst,
                            layout: wgpu::ImageDataLayout {
                                offset: footprint.offset,
                                bytes_per_row: Some(footprint.row_pitch as u32),
                                rows_per_image: None,
                            },
                        },
                        wgpu::Extent3d {
                            width: src_rect.width,
                            height: src_rect.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Op::CopyTextureToTexture {
                    src,
                    src_rect,
                    dst,
                    dst_x,
                    dst_y,
                } => {
                    let src = &arena.texture(*src)?.native.texture;
                    let dst = &arena.texture(*dst)?.native.texture;
                    encoder.copy_texture_to_texture(
                        wgpu::ImageCopyTexture {
                            texture: src,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: src_rect.x,
                                y: src_rect.y,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::ImageCopyTexture {
                            texture: dst,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: *dst_x,
                                y: *dst_y,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: src_rect.width,
                            height: src_rect.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Op::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src = &arena.buffer(*src)?.native;
                    let dst = &arena.buffer(*dst)?.native;
                    encoder.copy_buffer_to_buffer(src, *src_offset, dst, *dst_offset, *size);
                }
                Op::ResolveTexture { .. } => {
                    // A resolve is a render pass whose color attachment
                    // resolves into the destination view.
                    let view = &views[&i];
                    let resolve = &resolve_views[&i];
                    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("litho resolve"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view,
                            resolve_target: Some(resolve),
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        occlusion_query_set: None,
                        timestamp_writes: None,
                    });
                }
                Op::BeginRenderPass { load, .. } => {
                    let view = &views[&i];
                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("litho render pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: match load {
                                    LoadOp::Load => wgpu::LoadOp::Load,
                                    LoadOp::Clear(color) => {
                                        wgpu::LoadOp::Clear(clear_color(*color))
                                    }
                                },
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        occlusion_query_set: None,
                        timestamp_writes: None,
                    });

                    // Encode until the matching EndRenderPass.
                    i += 1;
                    loop {
                        let Some(op) = ops.get(i) else {
                            return Err(GpuError::Native("unterminated render pass".into()));
                        };
                        match op {
                            Op::EndRenderPass => break,
                            Op::SetPipeline(id) => {
                                let pipeline = pipelines.native(*id).ok_or_else(|| {
                                    GpuError::Native(format!("unknown pipeline {id:?}"))
                                })?;
                                pass.set_pipeline(&pipeline.pipeline);
                            }
                            Op::SetVertexBuffer { buffer, offset } => {
                                let buf = &arena.buffer(*buffer)?.native;
                                pass.set_vertex_buffer(0, buf.slice(*offset..));
                            }
                            Op::SetUniforms { buffer, offset } => {
                                let bg = uniform_groups.get(buffer).ok_or_else(|| {
                                    GpuError::Native("uniform bind group missing".into())
                                })?;
                                pass.set_bind_group(0, bg, &[*offset as u32]);
                            }
                            Op::Draw {
                                vertex_count,
                                first_vertex,
                            } => {
                                pass.draw(*first_vertex..*first_vertex + *vertex_count, 0..1);
                            }
                            Op::Barriers(_) => {}
                            other => {
                                return Err(GpuError::Native(format!(
                                    "op not encodable inside a render pass: {other:?}"
                                )));
                            }
                        }
                        i += 1;
                    }
                }
                Op::EndRenderPass => {
                    return Err(GpuError::Native("unexpected EndRenderPass".into()));
                }
                Op::SetPipeline(_) | Op::SetVertexBuffer { .. } | Op::SetUniforms { .. } | Op::Draw { .. } => {
                    return Err(GpuError::Native(
                        "draw-state op outside a render pass".into(),
                    ));
                }
            }
            i += 1;
        }

        Ok(encoder.finish())
    }

    fn execute(&mut self, list: wgpu::CommandBuffer) -> GpuResult<()> {
        self.queue.submit(std::iter::once(list));
        Ok(())
    }

    fn signal_fence(&mut self, value: u64) -> GpuResult<()> {
        let completed = Arc::clone(&self.completed_fence);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::SeqCst);
        });
        Ok(())
    }

    fn completed_fence(&mut self) -> u64 {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.completed_fence.load(Ordering::SeqCst)
    }

    fn wait_fence(&mut self, value: u64) -> GpuResult<()> {
        // poll(Wait) drains the queue and fires completion callbacks; a
        // couple of rounds is enough unless a signal was never enqueued.
        for _ in 0..100 {
            if self.completed_fence.load(Ordering::SeqCst) >= value {
                return Ok(());
            }
            let _ = self.device.poll(wgpu::Maintain::Wait);
            std::thread::yield_now();
        }
        Err(GpuError::Native(format!(
            "fence value {value} never observed on wgpu queue"
        )))
    }

    fn create_semaphore(&mut self) -> GpuResult<WgpuSemaphore> {
        Err(GpuError::Unsupported("semaphores on the wgpu backend"))
    }

    fn signal_semaphore(&mut self, _semaphore: &WgpuSemaphore, _value: u64) -> GpuResult<()> {
        Err(GpuError::Unsupported("semaphores on the wgpu backend"))
    }

    fn wait_semaphore(&mut self, _semaphore: &WgpuSemaphore, _value: u64) -> GpuResult<()> {
        Err(GpuError::Unsupported("semaphores on the wgpu backend"))
    }
}
