use image::{imageops::FilterType, ImageFormat, RgbaImage};
use thiserror::Error;

/// Width every upload is resized to before hashing.
pub const CANONICAL_WIDTH: u32 = 256;

/// Tallest canonical raster allowed, as a multiple of the canonical width.
/// Beyond this a narrow strip of an image would need gigabytes to resize.
pub const MAX_ASPECT_RATIO: u32 = 32;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("empty upload")]
    Empty,
    #[error("unsupported image type: {0}")]
    UnsupportedFormat(String),
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image {width}x{height} is too tall to normalize (canonical height {canonical_height} exceeds {max})")]
    Dimensions {
        width: u32,
        height: u32,
        canonical_height: u64,
        max: u64,
    },
}

/// Formats accepted at the door. Anything else is rejected before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Jpeg,
}

impl SourceFormat {
    pub fn mime(self) -> &'static str {
        match self {
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            SourceFormat::Png => ImageFormat::Png,
            SourceFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// A decoded upload resized to the canonical width.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub format: SourceFormat,
    pub source_width: u32,
    pub source_height: u32,
    pub raster: RgbaImage,
}

/// Sniffs the leading bytes. File names and client-declared content types are ignored.
pub fn sniff(bytes: &[u8]) -> Result<SourceFormat, NormalizeError> {
    if bytes.is_empty() {
        return Err(NormalizeError::Empty);
    }
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => Ok(SourceFormat::Png),
        Ok(ImageFormat::Jpeg) => Ok(SourceFormat::Jpeg),
        Ok(other) => Err(NormalizeError::UnsupportedFormat(
            other.to_mime_type().to_string(),
        )),
        Err(_) => Err(NormalizeError::UnsupportedFormat("application/octet-stream".into())),
    }
}

/// Decode with the sniffed format's decoder and resize to `width`, keeping aspect ratio.
///
/// Lanczos3 is used for every resize so the same bytes always give the same raster.
pub fn normalize(bytes: &[u8], width: u32) -> Result<Normalized, NormalizeError> {
    let format = sniff(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format.image_format())?;
    let (w, h) = (img.width(), img.height());

    let nh = target_height(w, h, width);
    let max = u64::from(width) * u64::from(MAX_ASPECT_RATIO);
    if nh > max {
        return Err(NormalizeError::Dimensions {
            width: w,
            height: h,
            canonical_height: nh,
            max,
        });
    }
    // `max` itself can exceed u32 for very large configured widths.
    let nh = u32::try_from(nh).map_err(|_| NormalizeError::Dimensions {
        width: w,
        height: h,
        canonical_height: nh,
        max,
    })?;
    let raster = if nh == 0 {
        // Extreme aspect ratios round to zero rows; hashing reports that, not us.
        RgbaImage::new(width, 0)
    } else {
        image::imageops::resize(&img.to_rgba8(), width, nh, FilterType::Lanczos3)
    };

    Ok(Normalized {
        format,
        source_width: w,
        source_height: h,
        raster,
    })
}

fn target_height(w: u32, h: u32, nw: u32) -> u64 {
    if w == 0 {
        return 0;
    }
    ((h as f64) * (nw as f64 / w as f64)).round() as u64
}
