//! Image normalization for vision models.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::{debug, info};

use super::extension;
use crate::analysis::types::ImageType;
use crate::error::ExtractError;

/// An image ready to send to a vision model.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub media_type: String,
    /// Base64 of the (possibly re-encoded) image bytes.
    pub data: String,
    pub size_bytes: usize,
}

/// Turns raw image bytes into a model-ready encoding.
///
/// `image_type` is `None` before classification; afterwards callers may
/// normalize again with the classified type to pick a sharper profile.
pub trait ImageNormalizer: Send + Sync {
    fn normalize(
        &self,
        bytes: &[u8],
        declared_media_type: &str,
        filename: &str,
        image_type: Option<ImageType>,
    ) -> Result<NormalizedImage, ExtractError>;
}

/// Re-encoding settings per image type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageProfile {
    /// Longest side after resizing.
    pub max_dimension: u32,
    pub quality: u8,
    /// Contrast multiplier, 1.0 is unchanged.
    pub contrast: Option<f32>,
}

impl ImageProfile {
    pub const DEFAULT: Self = Self {
        max_dimension: 2000,
        quality: 85,
        contrast: None,
    };

    pub fn for_image_type(image_type: Option<ImageType>) -> Self {
        match image_type {
            Some(ImageType::AnnotatedPlan) => Self {
                max_dimension: 3000,
                quality: 92,
                contrast: Some(1.2),
            },
            Some(ImageType::ReferenceImage) => Self {
                max_dimension: 2000,
                quality: 88,
                contrast: None,
            },
            Some(ImageType::Document) => Self {
                max_dimension: 2500,
                quality: 90,
                contrast: Some(1.1),
            },
            Some(ImageType::FieldPhoto) | Some(ImageType::Other) | None => Self::DEFAULT,
        }
    }
}

/// Decodes, flattens transparency onto white, fits the longest side to the
/// profile, and re-encodes as JPEG. Metadata such as EXIF is dropped.
#[derive(Debug, Default, Clone)]
pub struct JpegNormalizer;

impl ImageNormalizer for JpegNormalizer {
    fn normalize(
        &self,
        bytes: &[u8],
        declared_media_type: &str,
        filename: &str,
        image_type: Option<ImageType>,
    ) -> Result<NormalizedImage, ExtractError> {
        let source_type = sniff(bytes, declared_media_type, filename)?;
        let corrupt = |reason: String| ExtractError::Corrupt {
            media_type: source_type.to_string(),
            reason: format!("{filename}: {reason}"),
        };

        let decoded = image::load_from_memory(bytes).map_err(|e| corrupt(e.to_string()))?;
        let profile = ImageProfile::for_image_type(image_type);
        let (width, height) = (decoded.width(), decoded.height());

        let mut image = DynamicImage::ImageRgb8(flatten_onto_white(&decoded));
        if width.max(height) > profile.max_dimension {
            image = image.resize(
                profile.max_dimension,
                profile.max_dimension,
                FilterType::Lanczos3,
            );
            debug!(
                image = %filename,
                from = %format!("{width}x{height}"),
                to = %format!("{}x{}", image.width(), image.height()),
                "Image resized"
            );
        }
        if let Some(factor) = profile.contrast {
            image = image.adjust_contrast(contrast_percent(factor));
        }

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, profile.quality)
            .encode_image(&image)
            .map_err(|e| corrupt(e.to_string()))?;

        info!(
            image = %filename,
            source = source_type,
            original_kb = bytes.len() / 1024,
            output_kb = out.len() / 1024,
            width = image.width(),
            height = image.height(),
            profile = ?image_type,
            "Image normalized"
        );
        Ok(NormalizedImage {
            media_type: "image/jpeg".to_string(),
            data: BASE64.encode(&out),
            size_bytes: out.len(),
        })
    }
}

/// `image` scales contrast by `((100 + c) / 100)^2`; invert that for a
/// plain multiplier.
fn contrast_percent(factor: f32) -> f32 {
    (factor.sqrt() - 1.0) * 100.0
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut flat = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flat.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flat
}

/// Format check shared by the normalizers. HEIC has no decoder here.
fn sniff(
    bytes: &[u8],
    declared_media_type: &str,
    filename: &str,
) -> Result<&'static str, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Empty(filename.to_string()));
    }

    let media_type = detect_image_format(bytes)
        .or_else(|| format_from_extension(filename))
        .ok_or_else(|| ExtractError::Corrupt {
            media_type: declared_media_type.to_string(),
            reason: format!("{filename}: unrecognised image signature"),
        })?;

    if media_type == "image/heic" {
        return Err(ExtractError::Unsupported(format!(
            "{filename}: HEIC requires conversion"
        )));
    }
    Ok(media_type)
}

/// Sends JPEG, PNG, WEBP, and GIF as-is, ignoring profiles.
#[derive(Debug, Default, Clone)]
pub struct PassthroughNormalizer;

impl ImageNormalizer for PassthroughNormalizer {
    fn normalize(
        &self,
        bytes: &[u8],
        declared_media_type: &str,
        filename: &str,
        _image_type: Option<ImageType>,
    ) -> Result<NormalizedImage, ExtractError> {
        let media_type = sniff(bytes, declared_media_type, filename)?;
        Ok(NormalizedImage {
            media_type: media_type.to_string(),
            data: BASE64.encode(bytes),
            size_bytes: bytes.len(),
        })
    }
}

/// Identify an image format from its leading bytes.
pub fn detect_image_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG") {
        Some("image/png")
    } else if bytes.starts_with(&[0xff, 0xd8]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12
        && &bytes[4..8] == b"ftyp"
        && matches!(&bytes[8..12], b"heic" | b"heix" | b"mif1" | b"msf1" | b"heif")
    {
        Some("image/heic")
    } else {
        None
    }
}

fn format_from_extension(filename: &str) -> Option<&'static str> {
    match extension(filename)?.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" | "heif" => Some("image/heic"),
        _ => None,
    }
}
