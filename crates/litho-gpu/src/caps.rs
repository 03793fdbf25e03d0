//! Device capabilities and the predicates consulted before recording work.

use crate::format::PixelFormat;

/// Capability summary reported by a backend at device creation.
#[derive(Debug, Clone, Copy)]
pub struct GpuCaps {
    pub max_texture_size: u32,
    pub max_sample_count: u32,
    /// Minimum alignment for uniform sub-allocations.
    pub uniform_alignment: u64,
    /// Whether BC block-compressed formats can be created and copied.
    pub supports_bc_formats: bool,
    /// Whether textures can be placed in protected memory.
    pub supports_protected: bool,
    /// Whether cross-context semaphores exist on this backend.
    pub supports_semaphores: bool,
}

impl GpuCaps {
    pub fn is_format_texturable(&self, format: PixelFormat) -> bool {
        !format.is_compressed() || self.supports_bc_formats
    }

    pub fn is_format_renderable(&self, format: PixelFormat, sample_count: u32) -> bool {
        !format.is_compressed()
            && sample_count >= 1
            && sample_count <= self.max_sample_count
            && (sample_count == 1 || sample_count.is_power_of_two())
    }

    /// Whether a multisampled source can resolve directly into `dst`.
    ///
    /// Requires matching formats, a multisampled source and a single-sample
    /// destination.
    pub fn can_copy_as_resolve(
        &self,
        dst_format: PixelFormat,
        dst_sample_count: u32,
        src_format: PixelFormat,
        src_sample_count: u32,
    ) -> bool {
        dst_format == src_format
            && src_sample_count > 1
            && dst_sample_count <= 1
            && self.is_format_renderable(dst_format, 1)
    }

    /// Whether a plain texture-to-texture copy is bit-compatible.
    pub fn can_copy_texture(
        &self,
        dst_format: PixelFormat,
        dst_sample_count: u32,
        src_format: PixelFormat,
        src_sample_count: u32,
    ) -> bool {
        dst_format == src_format && dst_sample_count <= 1 && src_sample_count <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> GpuCaps {
        GpuCaps {
            max_texture_size: 8192,
            max_sample_count: 4,
            uniform_alignment: 256,
            supports_bc_formats: true,
            supports_protected: false,
            supports_semaphores: true,
        }
    }

    #[test]
    fn resolve_requires_msaa_source_and_single_sample_dest() {
        let c = caps();
        let f = PixelFormat::Rgba8Unorm;
        assert!(c.can_copy_as_resolve(f, 1, f, 4));
        assert!(!c.can_copy_as_resolve(f, 4, f, 4));
        assert!(!c.can_copy_as_resolve(f, 1, f, 1));
        assert!(!c.can_copy_as_resolve(PixelFormat::Bgra8Unorm, 1, f, 4));
    }

    #[test]
    fn texture_copy_requires_matching_single_sample_formats() {
        let c = caps();
        let f = PixelFormat::Rgba8Unorm;
        assert!(c.can_copy_texture(f, 1, f, 1));
        assert!(!c.can_copy_texture(f, 1, f, 4));
        assert!(!c.can_copy_texture(PixelFormat::R8Unorm, 1, f, 1));
    }

    #[test]
    fn compressed_formats_are_not_renderable() {
        let c = caps();
        assert!(c.is_format_texturable(PixelFormat::Bc1RgbaUnorm));
        assert!(!c.is_format_renderable(PixelFormat::Bc1RgbaUnorm, 1));
    }
}
