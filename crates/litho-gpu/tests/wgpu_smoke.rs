//! Engine behavior on the wgpu backend.
//!
//! These tests need a working adapter; without one they skip (or fail when
//! `LITHO_REQUIRE_WEBGPU=1`). A single shared device is reused across tests:
//! some drivers misbehave when devices are created and dropped repeatedly in
//! one process.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use litho_gpu::backend::wgpu_backend::WgpuBackend;
use litho_gpu::{
    ColorType, GpuDevice, GpuError, LoadOp, MipData, PixelFormat, Protected, Rect, SyncQueue,
    TextureDesc, TextureUsage,
};

fn wgpu_device(test_name: &str) -> Option<MutexGuard<'static, GpuDevice<WgpuBackend>>> {
    static DEVICE: OnceLock<Option<&'static Mutex<GpuDevice<WgpuBackend>>>> = OnceLock::new();

    let device = DEVICE.get_or_init(|| {
        let backend = match pollster::block_on(WgpuBackend::new_headless()) {
            Ok(backend) => backend,
            Err(GpuError::Unsupported(_)) => return None,
            Err(err) => panic!("failed to create wgpu backend: {err}"),
        };
        Some(Box::leak(Box::new(Mutex::new(GpuDevice::new(backend)))))
    });

    let Some(device) = device.as_ref() else {
        common::skip_or_panic(test_name, "no wgpu adapter available");
        return None;
    };
    Some(device.lock().unwrap())
}

fn rgba_texture(device: &mut GpuDevice<WgpuBackend>, size: u32) -> litho_gpu::TextureId {
    device
        .create_texture(&TextureDesc {
            width: size,
            height: size,
            format: PixelFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
            protected: Protected::No,
        })
        .expect("create texture")
}

#[test]
fn upload_readback_round_trips_on_wgpu() {
    let Some(mut device) = wgpu_device("upload_readback_round_trips_on_wgpu") else {
        return;
    };

    let tex = rgba_texture(&mut device, 64);
    let pixels = litho_gpu_utils::solid_rgba8(64, 64, [255, 0, 0, 255]);
    device
        .write_pixels(
            tex,
            Rect::from_size(64, 64),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .expect("upload");
    device.flush(true).expect("flush");

    let back = device
        .read_pixels(tex, Rect::from_size(64, 64), ColorType::Rgba8888)
        .expect("readback");
    assert_eq!(back, pixels);

    device.destroy_texture(tex).expect("destroy");
}

#[test]
fn gradient_subrect_round_trips_on_wgpu() {
    let Some(mut device) = wgpu_device("gradient_subrect_round_trips_on_wgpu") else {
        return;
    };

    let tex = rgba_texture(&mut device, 32);
    let pixels = litho_gpu_utils::gradient_rgba8(32, 32);
    device
        .write_pixels(
            tex,
            Rect::from_size(32, 32),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .expect("upload");

    let rect = Rect::new(8, 8, 16, 16);
    let back = device
        .read_pixels(tex, rect, ColorType::Rgba8888)
        .expect("readback");

    let mut expected = Vec::new();
    for y in 8..24usize {
        expected.extend_from_slice(&pixels[(y * 32 + 8) * 4..(y * 32 + 24) * 4]);
    }
    assert_eq!(back, expected);

    device.destroy_texture(tex).expect("destroy");
}

#[test]
fn empty_submit_fires_callbacks_on_wgpu() {
    let Some(mut device) = wgpu_device("empty_submit_fires_callbacks_on_wgpu") else {
        return;
    };

    let before = device.stats().submissions;
    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fired);
    device.add_finished_callback(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });
    device.submit(SyncQueue::Force).expect("empty submit");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(device.stats().submissions, before);
}

#[test]
fn clear_pass_renders_on_wgpu() {
    let Some(mut device) = wgpu_device("clear_pass_renders_on_wgpu") else {
        return;
    };

    let target = device
        .create_texture(&TextureDesc {
            width: 16,
            height: 16,
            format: PixelFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
            protected: Protected::No,
        })
        .expect("create target");

    device
        .begin_render_pass(target, LoadOp::Clear([0.0, 1.0, 0.0, 1.0]))
        .expect("begin pass");
    device.end_render_pass().expect("end pass");
    device.flush(true).expect("flush");

    let back = device
        .read_pixels(target, Rect::from_size(16, 16), ColorType::Rgba8888)
        .expect("readback");
    for px in back.chunks_exact(4) {
        assert_eq!(px, [0, 255, 0, 255]);
    }

    device.destroy_texture(target).expect("destroy");
}

#[test]
fn draws_encode_without_validation_errors_on_wgpu() {
    let Some(mut device) = wgpu_device("draws_encode_without_validation_errors_on_wgpu") else {
        return;
    };

    let target = device
        .create_texture(&TextureDesc {
            width: 16,
            height: 16,
            format: PixelFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
            protected: Protected::No,
        })
        .expect("create target");

    let vertices: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];
    let vb = device
        .create_buffer(
            &litho_gpu::BufferDesc {
                size: 24,
                usage: litho_gpu::BufferUsage::VERTEX | litho_gpu::BufferUsage::COPY_DST,
            },
            Some(bytemuck::cast_slice(&vertices)),
        )
        .expect("vertex buffer");

    device
        .begin_render_pass(target, LoadOp::Clear([0.0, 0.0, 0.0, 1.0]))
        .expect("begin pass");
    device
        .draw(&litho_gpu::DrawDesc {
            vertex_buffer: vb,
            vertex_offset: 0,
            vertex_count: 3,
            first_vertex: 0,
            color: [1.0, 0.0, 0.0, 1.0],
        })
        .expect("draw");
    device.end_render_pass().expect("end pass");
    device.flush(true).expect("flush");

    // A full-screen triangle through the solid-color pipeline paints the
    // whole target.
    let back = device
        .read_pixels(target, Rect::from_size(16, 16), ColorType::Rgba8888)
        .expect("readback");
    for px in back.chunks_exact(4) {
        assert_eq!(px, [255, 0, 0, 255]);
    }

    device.destroy_texture(target).expect("destroy");
    device.destroy_buffer(vb).expect("destroy vb");
}

#[test]
fn semaphores_are_reported_unsupported_on_wgpu() {
    let Some(mut device) = wgpu_device("semaphores_are_reported_unsupported_on_wgpu") else {
        return;
    };

    assert!(!device.caps().supports_semaphores);
    assert!(matches!(
        device.make_semaphore(),
        Err(GpuError::Unsupported(_))
    ));
}

#[test]
fn bc1_round_trips_on_wgpu_when_supported() {
    let Some(mut device) = wgpu_device("bc1_round_trips_on_wgpu_when_supported") else {
        return;
    };
    if !device.caps().supports_bc_formats {
        common::skip_or_panic(
            "bc1_round_trips_on_wgpu_when_supported",
            "adapter lacks BC texture compression",
        );
        return;
    }

    let data: Vec<u8> = (0..4 * 4 * 8).map(|i| (i % 251) as u8).collect();
    let tex = device
        .create_compressed_texture(16, 16, PixelFormat::Bc1RgbaUnorm, false, &data)
        .expect("create compressed");
    device.flush(true).expect("flush");

    let back = device.read_block_data(tex).expect("read blocks");
    assert_eq!(back, data);

    device.destroy_texture(tex).expect("destroy");
}
