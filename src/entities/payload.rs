//! Decoded image payloads and in-memory pixel edits.
//!
//! Metadata is cheap to read (dimensions + format from the file header),
//! pixels are the full decode. A resource owns whichever of the two it has
//! loaded; pixels are shared out as `Arc` so views can read them without
//! holding the resource lock.

use std::sync::Arc;

use image::DynamicImage;

/// Shared, immutable pixel payload. Edits replace the `Arc`, never mutate it.
pub type Pixels = Arc<DynamicImage>;

/// Descriptive data available after a metadata-only load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    /// Container format as reported by the decoder ("Png", "Jpeg", ...)
    pub format: String,
}

impl ImageMetadata {
    pub fn new(width: u32, height: u32, format: impl Into<String>) -> Self {
        Self {
            width,
            height,
            format: format.into(),
        }
    }

    /// Metadata describing an already decoded image
    pub fn from_image(image: &DynamicImage, format: impl Into<String>) -> Self {
        Self::new(image.width(), image.height(), format)
    }

    /// Approximate RGBA8 size in bytes, used for logging only
    pub fn mem_estimate(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// What a decoder hands back on success
#[derive(Debug, Clone)]
pub enum Decoded {
    /// Header only: dimensions and format, no pixels
    Metadata(ImageMetadata),
    /// Header plus full pixel payload
    Full {
        metadata: ImageMetadata,
        pixels: Pixels,
    },
}

impl Decoded {
    pub fn metadata(&self) -> &ImageMetadata {
        match self {
            Decoded::Metadata(meta) => meta,
            Decoded::Full { metadata, .. } => metadata,
        }
    }
}

/// Lossless pixel manipulations that mark a resource as modified
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Edit {
    /// 90° counter-clockwise
    RotateLeft,
    /// 90° clockwise
    RotateRight,
    /// Horizontal mirror
    Mirror,
    /// Vertical flip
    Flip,
}

impl Edit {
    pub fn apply(self, image: &DynamicImage) -> DynamicImage {
        match self {
            Edit::RotateLeft => image.rotate270(),
            Edit::RotateRight => image.rotate90(),
            Edit::Mirror => image.fliph(),
            Edit::Flip => image.flipv(),
        }
    }

    /// Label recorded in the resource's undo scope
    pub fn label(self) -> &'static str {
        match self {
            Edit::RotateLeft => "Rotate Left",
            Edit::RotateRight => "Rotate Right",
            Edit::Mirror => "Mirror",
            Edit::Flip => "Flip",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn marked_image() -> DynamicImage {
        // 3x2, top-left pixel red, rest black
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_rotations_swap_dimensions() {
        let img = marked_image();
        let left = Edit::RotateLeft.apply(&img);
        let right = Edit::RotateRight.apply(&img);
        assert_eq!((left.width(), left.height()), (2, 3));
        assert_eq!((right.width(), right.height()), (2, 3));
    }

    #[test]
    fn test_rotate_right_moves_top_left_to_top_right() {
        let rotated = Edit::RotateRight.apply(&marked_image());
        assert_eq!(rotated.get_pixel(1, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_mirror_and_flip() {
        let img = marked_image();
        assert_eq!(Edit::Mirror.apply(&img).get_pixel(2, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(Edit::Flip.apply(&img).get_pixel(0, 1), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_decoded_metadata_accessor() {
        let img = marked_image();
        let meta = ImageMetadata::from_image(&img, "Png");
        let full = Decoded::Full {
            metadata: meta.clone(),
            pixels: Arc::new(img),
        };
        assert_eq!(full.metadata(), &meta);
        assert_eq!(meta.mem_estimate(), 3 * 2 * 4);
    }
}
