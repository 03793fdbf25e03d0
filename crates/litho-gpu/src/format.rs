//! Pixel formats and the per-mip copy footprints used to size staging memory.
//!
//! Copy footprints follow the discrete-GPU convention: rows within a buffer
//! are padded to [`ROW_PITCH_ALIGNMENT`] and each subresource starts at a
//! [`PLACEMENT_ALIGNMENT`] boundary. Backends with looser requirements simply
//! over-align.

use crate::error::{GpuError, GpuResult};

/// Required alignment of a buffer row participating in a texture copy.
pub const ROW_PITCH_ALIGNMENT: u64 = 256;

/// Required alignment of a subresource's start offset within a buffer.
pub const PLACEMENT_ALIGNMENT: u64 = 512;

/// Round `value` up to the nearest multiple of `alignment` (> 0).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Texel formats supported by the engine.
///
/// The BC formats store 4×4 texel blocks; everything else is one texel per
/// block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
}

impl PixelFormat {
    /// Block dimensions in texels, `(width, height)`.
    pub fn block_dimensions(self) -> (u32, u32) {
        match self {
            PixelFormat::R8Unorm | PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => (1, 1),
            PixelFormat::Bc1RgbaUnorm | PixelFormat::Bc3RgbaUnorm => (4, 4),
        }
    }

    pub fn bytes_per_block(self) -> u32 {
        match self {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => 4,
            PixelFormat::Bc1RgbaUnorm => 8,
            PixelFormat::Bc3RgbaUnorm => 16,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.block_dimensions() != (1, 1)
    }

    /// The color type an uncompressed format round-trips through
    /// `write_pixels`/`read_pixels` with, if any.
    pub fn color_type(self) -> Option<ColorType> {
        match self {
            PixelFormat::R8Unorm => Some(ColorType::Alpha8),
            PixelFormat::Rgba8Unorm => Some(ColorType::Rgba8888),
            PixelFormat::Bgra8Unorm => Some(ColorType::Bgra8888),
            PixelFormat::Bc1RgbaUnorm | PixelFormat::Bc3RgbaUnorm => None,
        }
    }
}

/// CPU-side pixel layouts accepted by the upload/readback paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorType {
    Alpha8,
    Rgba8888,
    Bgra8888,
}

impl ColorType {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorType::Alpha8 => 1,
            ColorType::Rgba8888 | ColorType::Bgra8888 => 4,
        }
    }
}

/// An axis-aligned texel rectangle within a subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether this rect lies fully within a `width × height` surface.
    pub fn contained_by(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }
}

/// Layout of one subresource (mip level) inside a linear transfer buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceFootprint {
    /// Byte offset of the subresource from the start of the buffer.
    pub offset: u64,
    /// Padded bytes per block row in the buffer.
    pub row_pitch: u64,
    /// Meaningful (unpadded) bytes per block row.
    pub row_bytes: u64,
    /// Number of block rows.
    pub rows: u32,
}

impl SubresourceFootprint {
    pub fn total_bytes(&self) -> u64 {
        self.row_pitch * self.rows as u64
    }
}

/// Number of levels in a full mip chain for a `width × height` base level.
pub fn full_mip_chain_len(width: u32, height: u32) -> u32 {
    debug_assert!(width > 0 && height > 0);
    32 - width.max(height).leading_zeros()
}

/// Size of `base` at `level` (never below 1).
pub fn mip_dimension(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Compute the footprints of `mip_count` levels of a `width × height` region
/// packed into one transfer buffer, plus the combined buffer size.
///
/// Mirrors the native "copyable footprints" query: rows are padded to
/// [`ROW_PITCH_ALIGNMENT`], levels start at [`PLACEMENT_ALIGNMENT`]
/// boundaries, all offsets are relative to the start of the buffer.
pub fn copyable_footprints(
    format: PixelFormat,
    width: u32,
    height: u32,
    mip_count: u32,
) -> GpuResult<(Vec<SubresourceFootprint>, u64)> {
    if width == 0 || height == 0 || mip_count == 0 {
        return Err(GpuError::validation(format!(
            "invalid footprint request {width}x{height} mips={mip_count}"
        )));
    }

    let (block_w, block_h) = format.block_dimensions();
    let block_bytes = format.bytes_per_block() as u64;

    let mut footprints = Vec::with_capacity(mip_count as usize);
    let mut cursor = 0u64;
    for level in 0..mip_count {
        let w = mip_dimension(width, level);
        let h = mip_dimension(height, level);
        let blocks_w = w.div_ceil(block_w) as u64;
        let blocks_h = h.div_ceil(block_h);

        let row_bytes = blocks_w
            .checked_mul(block_bytes)
            .ok_or_else(|| GpuError::validation("texture row size overflow"))?;
        let row_pitch = align_up(row_bytes, ROW_PITCH_ALIGNMENT);

        let offset = align_up(cursor, PLACEMENT_ALIGNMENT);
        cursor = offset
            .checked_add(row_pitch * blocks_h as u64)
            .ok_or_else(|| GpuError::validation("texture footprint overflow"))?;

        footprints.push(SubresourceFootprint {
            offset,
            row_pitch,
            row_bytes,
            rows: blocks_h,
        });
    }

    Ok((footprints, cursor))
}

/// Total size of tightly-packed block data for a (possibly mipmapped)
/// compressed texture, as supplied by callers of the compressed upload path.
pub fn compressed_data_size(format: PixelFormat, width: u32, height: u32, mip_count: u32) -> u64 {
    debug_assert!(format.is_compressed());
    let (block_w, block_h) = format.block_dimensions();
    let block_bytes = format.bytes_per_block() as u64;

    let mut total = 0u64;
    for level in 0..mip_count {
        let w = mip_dimension(width, level);
        let h = mip_dimension(height, level);
        total += w.div_ceil(block_w) as u64 * h.div_ceil(block_h) as u64 * block_bytes;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn full_mip_chain_counts_down_to_one_texel() {
        assert_eq!(full_mip_chain_len(1, 1), 1);
        assert_eq!(full_mip_chain_len(2, 2), 2);
        assert_eq!(full_mip_chain_len(64, 64), 7);
        assert_eq!(full_mip_chain_len(64, 1), 7);
        assert_eq!(full_mip_chain_len(100, 7), 7);
    }

    #[test]
    fn footprints_pad_rows_and_place_levels() {
        let (fps, total) = copyable_footprints(PixelFormat::Rgba8Unorm, 64, 64, 2).unwrap();
        assert_eq!(fps.len(), 2);

        // 64 * 4 = 256 bytes per row, already aligned.
        assert_eq!(fps[0].offset, 0);
        assert_eq!(fps[0].row_bytes, 256);
        assert_eq!(fps[0].row_pitch, 256);
        assert_eq!(fps[0].rows, 64);

        // Level 1 is 32x32: 128 meaningful bytes padded to 256.
        assert_eq!(fps[1].offset % PLACEMENT_ALIGNMENT, 0);
        assert_eq!(fps[1].row_bytes, 128);
        assert_eq!(fps[1].row_pitch, 256);
        assert_eq!(fps[1].rows, 32);

        assert_eq!(total, fps[1].offset + 32 * 256);
    }

    #[test]
    fn footprints_use_block_rows_for_compressed() {
        let (fps, _) = copyable_footprints(PixelFormat::Bc1RgbaUnorm, 16, 16, 1).unwrap();
        // 16x16 texels = 4x4 blocks of 8 bytes.
        assert_eq!(fps[0].row_bytes, 32);
        assert_eq!(fps[0].rows, 4);
        assert_eq!(fps[0].row_pitch, 256);
    }

    #[test]
    fn compressed_size_covers_partial_blocks() {
        // 10x10 BC1 rounds up to 3x3 blocks.
        assert_eq!(compressed_data_size(PixelFormat::Bc1RgbaUnorm, 10, 10, 1), 72);
        // Mip chain of an 8x8: 2x2 blocks + 1 block + 1 block + 1 block.
        assert_eq!(compressed_data_size(PixelFormat::Bc1RgbaUnorm, 8, 8, 4), 56);
    }

    #[test]
    fn zero_sized_footprint_is_rejected() {
        assert!(copyable_footprints(PixelFormat::Rgba8Unorm, 0, 4, 1).is_err());
        assert!(copyable_footprints(PixelFormat::Rgba8Unorm, 4, 4, 0).is_err());
    }
}
