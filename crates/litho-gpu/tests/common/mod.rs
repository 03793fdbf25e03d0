//! Shared helpers for `litho-gpu` integration tests.

use litho_gpu::backend::soft::{SoftBackend, SoftController};
use litho_gpu::{GpuDevice, PixelFormat, Protected, TextureDesc, TextureId, TextureUsage};

/// A device over the software queue plus the controller that drives its
/// timing from tests.
#[allow(dead_code)]
pub fn soft_device() -> (GpuDevice<SoftBackend>, SoftController) {
    let backend = SoftBackend::new();
    let controller = backend.controller();
    (GpuDevice::new(backend), controller)
}

/// An RGBA8 texture usable as copy source/destination and sampling.
#[allow(dead_code)]
pub fn rgba_texture(device: &mut GpuDevice<SoftBackend>, width: u32, height: u32) -> TextureId {
    device
        .create_texture(&TextureDesc {
            width,
            height,
            format: PixelFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
            protected: Protected::No,
        })
        .expect("create texture")
}

/// Whether skipped wgpu tests should fail instead (CI escape hatch).
#[allow(dead_code)]
pub fn require_webgpu() -> bool {
    let Ok(raw) = std::env::var("LITHO_REQUIRE_WEBGPU") else {
        return false;
    };
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[allow(dead_code)]
pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_webgpu() {
        panic!("LITHO_REQUIRE_WEBGPU is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}
