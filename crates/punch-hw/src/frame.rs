//! Grayscale frames and raw-buffer conversion.

use std::time::Instant;

/// Fraction of near-black pixels above which a frame is treated as dark.
pub const DARK_FRAME_FRACTION: f32 = 0.95;
/// Pixel values below this count as near-black.
const DARK_PIXEL_MAX: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format} buffer too short: expected {expected} bytes, got {actual}")]
    TooShort {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// One captured frame, 8-bit grayscale, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    /// Driver sequence number.
    pub sequence: u32,
}

impl Frame {
    /// Mean pixel value on the 0–255 scale.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let total: u64 = self.data.iter().map(|&p| u64::from(p)).sum();
        total as f32 / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_FRACTION)
    }
}

fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// Keep the luma byte of packed YUYV 4:2:2 (`Y0 U Y1 V`).
pub fn yuyv_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = pixel_count(width, height) * 2;
    if buf.len() < expected {
        return Err(FrameError::TooShort {
            format: "YUYV",
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].iter().step_by(2).copied().collect())
}

/// Reduce 16-bit little-endian grayscale to its high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = pixel_count(width, height) * 2;
    if buf.len() < expected {
        return Err(FrameError::TooShort {
            format: "Y16",
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Copy the first `width * height` bytes of an 8-bit grayscale buffer.
pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = pixel_count(width, height);
    if buf.len() < expected {
        return Err(FrameError::TooShort {
            format: "GREY",
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].to_vec())
}

/// True when more than `fraction` of the pixels are near-black.
///
/// An empty buffer is dark.
pub fn is_dark_frame(gray: &[u8], fraction: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_MAX).count();
    dark as f32 / gray.len() as f32 > fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_keeps_luma() {
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128, 7, 1, 9, 2], 4, 1).unwrap();
        assert_eq!(gray, vec![100, 200, 7, 9]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_to_grayscale(&[1, 2], 2, 1).unwrap_err();
        assert!(err.to_string().contains("expected 4"));
    }

    #[test]
    fn test_y16_takes_high_byte() {
        // 0x12ff → 0x12, 0xab00 → 0xab
        let gray = y16_to_grayscale(&[0xff, 0x12, 0x00, 0xab], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xab]);
        assert!(y16_to_grayscale(&[0, 0, 0], 2, 1).is_err());
    }

    #[test]
    fn test_grey_truncates_padding() {
        let gray = grey_to_grayscale(&[1, 2, 3, 4, 99, 99], 2, 2).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[0u8; 100], DARK_FRAME_FRACTION));
        assert!(!is_dark_frame(&[128u8; 100], DARK_FRAME_FRACTION));
        assert!(is_dark_frame(&[], DARK_FRAME_FRACTION));

        let mut mostly = vec![10u8; 96];
        mostly.extend([200u8; 4]);
        assert!(is_dark_frame(&mostly, DARK_FRAME_FRACTION));

        let mut half = vec![10u8; 50];
        half.extend([200u8; 50]);
        assert!(!is_dark_frame(&half, DARK_FRAME_FRACTION));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            data: vec![0, 100, 200, 100],
            width: 2,
            height: 2,
            captured_at: Instant::now(),
            sequence: 0,
        };
        assert_eq!(frame.avg_brightness(), 100.0);
        assert!(!frame.is_dark());
    }
}
