//! # Print Bitmaps
//!
//! A [`Bitmap`] is the finished 1-bit raster handed to the print queue by
//! rendering collaborators. Rows are packed MSB first, `width.div_ceil(8)`
//! bytes per row, and a set bit is a black dot.
//!
//! ```
//! use faro::Bitmap;
//!
//! let bitmap = Bitmap::from_fn(16, 2, |x, _| x < 8);
//! assert_eq!(bitmap.row(0), &[0xFF, 0x00]);
//! ```

use image::{GrayImage, Luma};

use crate::error::FaroError;

/// Gray level below which a pixel prints black when thresholding.
pub const DEFAULT_THRESHOLD: u8 = 128;

/// Immutable 1-bit raster image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Bitmap {
    /// Wrap packed raster data.
    ///
    /// ## Errors
    ///
    /// Returns [`FaroError::InvalidBitmap`] if the dimensions are zero or
    /// `data` is not exactly `width.div_ceil(8) * height` bytes.
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, FaroError> {
        if width == 0 || height == 0 {
            return Err(FaroError::InvalidBitmap(format!(
                "empty bitmap ({}x{})",
                width, height
            )));
        }
        let expected = width
            .div_ceil(8)
            .checked_mul(height)
            .ok_or_else(|| FaroError::InvalidBitmap(format!("{}x{} is too large", width, height)))?;
        if data.len() != expected {
            return Err(FaroError::InvalidBitmap(format!(
                "{}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a bitmap from a per-pixel predicate (`true` = black).
    ///
    /// ## Panics
    ///
    /// Panics if the packed size overflows `usize`, like `Vec` does on
    /// capacity overflow.
    pub fn from_fn(width: usize, height: usize, mut black: impl FnMut(usize, usize) -> bool) -> Self {
        let width_bytes = width.div_ceil(8);
        let Some(len) = width_bytes.checked_mul(height) else {
            panic!("bitmap size overflow ({}x{})", width, height);
        };
        let mut data = vec![0u8; len];
        for y in 0..height {
            for x in 0..width {
                if black(x, y) {
                    data[y * width_bytes + x / 8] |= 1 << (7 - (x % 8));
                }
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Threshold a grayscale image: pixels darker than `threshold` print.
    pub fn from_luma(image: &GrayImage, threshold: u8) -> Result<Self, FaroError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(FaroError::InvalidBitmap("empty image".to_string()));
        }
        Ok(Self::from_fn(w as usize, h as usize, |x, y| {
            let Luma([level]) = *image.get_pixel(x as u32, y as u32);
            level < threshold
        }))
    }

    /// Decode an encoded image (PNG, JPEG, ...) and threshold it.
    pub fn decode(bytes: &[u8]) -> Result<Self, FaroError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| FaroError::Image(format!("Failed to decode image: {}", e)))?;
        Self::from_luma(&image.to_luma8(), DEFAULT_THRESHOLD)
    }

    /// Diagonal stripe pattern used by the manual test print.
    pub fn test_pattern(width: usize, height: usize) -> Self {
        Self::from_fn(width, height, |x, y| {
            y < 4 || y + 4 >= height || ((x + y) / 12) % 2 == 0
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes per packed row.
    pub fn width_bytes(&self) -> usize {
        self.width.div_ceil(8)
    }

    /// Packed raster data, row by row.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One packed row.
    pub fn row(&self, y: usize) -> &[u8] {
        let wb = self.width_bytes();
        &self.data[y * wb..(y + 1) * wb]
    }

    /// Whether the dot at (x, y) is black.
    pub fn is_black(&self, x: usize, y: usize) -> bool {
        (self.data[y * self.width_bytes() + x / 8] >> (7 - (x % 8))) & 1 == 1
    }

    /// Rotate 90 degrees clockwise.
    pub fn rotated(&self) -> Self {
        Self::from_fn(self.height, self.width, |x, y| {
            self.is_black(y, self.height - 1 - x)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_length() {
        assert!(Bitmap::new(8, 2, vec![0, 0]).is_ok());
        assert!(Bitmap::new(9, 2, vec![0, 0]).is_err()); // needs 4 bytes
        assert!(Bitmap::new(0, 2, vec![]).is_err());
        assert!(matches!(
            Bitmap::new(usize::MAX, usize::MAX, vec![]),
            Err(FaroError::InvalidBitmap(_))
        ));
    }

    #[test]
    fn test_from_fn_packs_msb_first() {
        let bitmap = Bitmap::from_fn(10, 1, |x, _| x == 0 || x == 9);
        assert_eq!(bitmap.data(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitmap.is_black(9, 0));
        assert!(!bitmap.is_black(8, 0));
    }

    #[test]
    fn test_from_luma_threshold() {
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, Luma([10]));
        img.put_pixel(1, 0, Luma([200]));

        let bitmap = Bitmap::from_luma(&img, DEFAULT_THRESHOLD).unwrap();
        assert!(bitmap.is_black(0, 0));
        assert!(!bitmap.is_black(1, 0));
    }

    #[test]
    fn test_rotated_swaps_dimensions() {
        // Single black dot in the top-left corner
        let bitmap = Bitmap::from_fn(3, 2, |x, y| x == 0 && y == 0);
        let rotated = bitmap.rotated();

        assert_eq!((rotated.width(), rotated.height()), (2, 3));
        // Clockwise: top-left moves to top-right
        assert!(rotated.is_black(1, 0));
        assert!(!rotated.is_black(0, 0));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Bitmap::decode(b"not an image"),
            Err(FaroError::Image(_))
        ));
    }
}
