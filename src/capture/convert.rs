//! Packed 4:2:2 YUV to interleaved RGB24
//!
//! Fixed BT.601-style approximation, per macropixel `Y0 U Y1 V`:
//!
//! ```text
//! R = Y + 1.402 (V - 128)
//! G = Y - 0.344 (U - 128) - 0.714 (V - 128)
//! B = Y + 1.772 (U - 128)
//! ```
//!
//! evaluated once with `Y0` and once with `Y1`, saturating to `0..=255`.
//! There is no matrix or range selection.

use crate::error::{CaptureError, Result};

/// Output size of a converted frame
pub fn rgb24_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Convert a tightly packed YUYV frame.
pub fn yuyv_to_rgb24(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    yuyv_to_rgb24_with_stride(src, width * 2, width, height)
}

/// Convert a YUYV frame whose rows are `stride` bytes apart.
pub fn yuyv_to_rgb24_with_stride(
    src: &[u8],
    stride: u32,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let mut dst = vec![0u8; rgb24_len(width, height)];
    yuyv_to_rgb24_into(src, stride, width, height, &mut dst)?;
    Ok(dst)
}

/// Convert into a caller-owned buffer of at least [`rgb24_len`] bytes.
pub fn yuyv_to_rgb24_into(
    src: &[u8],
    stride: u32,
    width: u32,
    height: u32,
    dst: &mut [u8],
) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(CaptureError::Conversion(format!(
            "empty frame {}x{}",
            width, height
        )));
    }
    if width % 2 != 0 {
        return Err(CaptureError::Conversion(format!(
            "packed 4:2:2 needs an even width, got {}",
            width
        )));
    }

    let row_bytes = width as usize * 2;
    let stride = stride as usize;
    if stride < row_bytes {
        return Err(CaptureError::Conversion(format!(
            "stride {} shorter than a {} pixel row",
            stride, width
        )));
    }

    // The last row may come without padding
    let needed = stride * (height as usize - 1) + row_bytes;
    if src.len() < needed {
        return Err(CaptureError::Conversion(format!(
            "input holds {} bytes, {}x{} needs {}",
            src.len(),
            width,
            height,
            needed
        )));
    }
    let out_len = rgb24_len(width, height);
    if dst.len() < out_len {
        return Err(CaptureError::Conversion(format!(
            "output holds {} bytes, needs {}",
            dst.len(),
            out_len
        )));
    }

    let out_row = width as usize * 3;
    for (src_row, dst_row) in src
        .chunks(stride)
        .zip(dst[..out_len].chunks_exact_mut(out_row))
    {
        let pixels = src_row[..row_bytes].chunks_exact(4);
        for (macropixel, out) in pixels.zip(dst_row.chunks_exact_mut(6)) {
            convert_macropixel(macropixel, out);
        }
    }

    Ok(())
}

#[inline(always)]
fn convert_macropixel(yuyv: &[u8], rgb: &mut [u8]) {
    let y0 = f32::from(yuyv[0]);
    let u = f32::from(yuyv[1]) - 128.0;
    let y1 = f32::from(yuyv[2]);
    let v = f32::from(yuyv[3]) - 128.0;

    let r = 1.402 * v;
    let g = -0.344 * u - 0.714 * v;
    let b = 1.772 * u;

    rgb[0] = saturate(y0 + r);
    rgb[1] = saturate(y0 + g);
    rgb[2] = saturate(y0 + b);
    rgb[3] = saturate(y1 + r);
    rgb[4] = saturate(y1 + g);
    rgb[5] = saturate(y1 + b);
}

#[inline(always)]
fn saturate(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, macropixel: [u8; 4]) -> Vec<u8> {
        macropixel
            .iter()
            .copied()
            .cycle()
            .take((width * height * 2) as usize)
            .collect()
    }

    #[test]
    fn test_neutral_gray() {
        let src = frame(8, 4, [128, 128, 128, 128]);
        let rgb = yuyv_to_rgb24(&src, 8, 4).unwrap();
        assert_eq!(rgb.len(), 8 * 4 * 3);
        assert!(rgb.iter().all(|&c| c == 128));
    }

    #[test]
    fn test_clamps_high() {
        // V = 255 pushes red well past 255
        let rgb = yuyv_to_rgb24(&[255, 128, 255, 255], 2, 1).unwrap();
        assert_eq!(rgb[0], 255);
        assert_eq!(rgb[3], 255);
    }

    #[test]
    fn test_clamps_low() {
        // U = 0 pushes blue well below 0
        let rgb = yuyv_to_rgb24(&[0, 0, 0, 128], 2, 1).unwrap();
        assert_eq!(rgb[2], 0);
        assert_eq!(rgb[5], 0);
    }

    #[test]
    fn test_each_pixel_uses_its_own_luma() {
        let rgb = yuyv_to_rgb24(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(&rgb[..3], &[16, 16, 16]);
        assert_eq!(&rgb[3..], &[235, 235, 235]);
    }

    #[test]
    fn test_chroma_shared_by_pair() {
        let rgb = yuyv_to_rgb24(&[100, 90, 140, 200], 2, 1).unwrap();
        // R offset 1.402 * 72 = 100.94, G offset 13.072 - 51.408 = -38.336,
        // B offset 1.772 * -38 = -67.336
        assert_eq!(&rgb[..3], &[200, 61, 32]);
        assert_eq!(&rgb[3..], &[240, 101, 72]);
    }

    #[test]
    fn test_padded_rows() {
        // 2x2, 4 bytes of pixels + 4 bytes of padding per row
        let src = [
            50, 128, 60, 128, 9, 9, 9, 9, //
            70, 128, 80, 128,
        ];
        let rgb = yuyv_to_rgb24_with_stride(&src, 8, 2, 2).unwrap();
        let luma: Vec<u8> = rgb.chunks(3).map(|p| p[0]).collect();
        assert_eq!(luma, vec![50, 60, 70, 80]);
    }

    #[test]
    fn test_preconditions() {
        assert!(matches!(
            yuyv_to_rgb24(&[0; 12], 3, 1),
            Err(CaptureError::Conversion(_))
        ));
        assert!(matches!(
            yuyv_to_rgb24(&[0; 4], 4, 1),
            Err(CaptureError::Conversion(_))
        ));
        assert!(matches!(
            yuyv_to_rgb24(&[], 0, 0),
            Err(CaptureError::Conversion(_))
        ));
        assert!(matches!(
            yuyv_to_rgb24_with_stride(&[0; 16], 2, 2, 2),
            Err(CaptureError::Conversion(_))
        ));

        let mut small = [0u8; 5];
        assert!(yuyv_to_rgb24_into(&[128; 4], 4, 2, 1, &mut small).is_err());
    }
}
