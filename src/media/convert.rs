//! Channel-count conversion between a [`Frame`] and a tightly packed destination

use crate::error::{Result, TransportError};
use crate::media::Frame;

/// Alpha written when a 3-channel frame is widened to 4 channels
pub const OPAQUE: u8 = 0xFF;

/// Whether `from` channels can be packed into a `to`-channel buffer.
pub fn is_supported(from: u32, to: u32) -> bool {
    from == to || matches!((from, to), (3, 4) | (4, 3))
}

/// Copy `frame` into `dst` as tightly packed rows of `dst_channels` channels.
///
/// Equal channel counts copy verbatim (row by row when the frame is strided).
/// 3 -> 4 appends an opaque alpha byte, 4 -> 3 drops the fourth byte.
pub fn pack_into(frame: &Frame, dst: &mut [u8], dst_channels: u32) -> Result<()> {
    let src_channels = frame.channels();
    if !is_supported(src_channels, dst_channels) {
        return Err(TransportError::UnsupportedConversion {
            from: src_channels,
            to: dst_channels,
        });
    }

    let width = frame.width() as usize;
    let src_row = width * src_channels as usize;
    let src_required = frame.meta.stride * (frame.height() as usize).saturating_sub(1) + src_row;
    if frame.meta.stride < src_row || frame.data.len() < src_required {
        return Err(TransportError::BufferSize {
            expected: src_required,
            actual: frame.data.len(),
        });
    }

    let dst_row = width * dst_channels as usize;
    let expected = dst_row * frame.height() as usize;
    if dst.len() != expected {
        return Err(TransportError::BufferSize {
            expected,
            actual: dst.len(),
        });
    }

    if src_channels == dst_channels && frame.is_packed() {
        dst.copy_from_slice(&frame.data[..expected]);
        return Ok(());
    }

    for (y, out) in dst.chunks_exact_mut(dst_row).enumerate() {
        let row = frame.row(y as u32);
        match (src_channels, dst_channels) {
            (3, 4) => {
                for (px, o) in row.chunks_exact(3).zip(out.chunks_exact_mut(4)) {
                    o[..3].copy_from_slice(px);
                    o[3] = OPAQUE;
                }
            }
            (4, 3) => {
                for (px, o) in row.chunks_exact(4).zip(out.chunks_exact_mut(3)) {
                    o.copy_from_slice(&px[..3]);
                }
            }
            _ => out.copy_from_slice(row),
        }
    }

    Ok(())
}

/// Convenience wrapper that allocates the destination.
pub fn to_packed(frame: &Frame, dst_channels: u32) -> Result<Vec<u8>> {
    let len = frame.width() as usize * frame.height() as usize * dst_channels as usize;
    let mut out = vec![0u8; len];
    pack_into(frame, &mut out, dst_channels)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;

    #[test]
    fn rgb_gains_opaque_alpha() {
        let frame = Frame::packed(2, 1, PixelFormat::Rgb24, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(to_packed(&frame, 4).unwrap(), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn rgba_drops_alpha() {
        let frame =
            Frame::packed(2, 1, PixelFormat::Rgba32, vec![1, 2, 3, 9, 4, 5, 6, 9]).unwrap();
        assert_eq!(to_packed(&frame, 3).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn strided_source_is_packed_row_by_row() {
        let data = vec![1, 2, 3, 0xAA, 4, 5, 6, 0xAA];
        let frame = Frame::strided(1, 2, 4, PixelFormat::Rgb24, data).unwrap();
        assert_eq!(to_packed(&frame, 3).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn gray_to_rgba_is_refused() {
        let frame = Frame::packed(1, 1, PixelFormat::Gray8, vec![7]).unwrap();
        assert!(matches!(
            to_packed(&frame, 4),
            Err(TransportError::UnsupportedConversion { from: 1, to: 4 })
        ));
    }
}
