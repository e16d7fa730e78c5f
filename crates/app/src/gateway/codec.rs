//! Frame payload encoding and decoding.
//!
//! Inbound frames arrive as base64 JPEG text, optionally with a `data:` URI
//! prefix pasted in by canvas APIs; replies go back the same way. All pixel
//! work happens on tightly packed RGB8 buffers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, PngEncoder};
use image::{imageops, ExtendedColorType, ImageEncoder, ImageFormat, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Jpeg,
    Png,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame data received")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Decode(image::ImageError),
    #[error("image encode failed: {0}")]
    Encode(image::ImageError),
    #[error("decoded image has zero area")]
    ZeroArea,
}

/// Decode a base64 JPEG payload into an RGB8 image.
pub fn decode_frame(payload: &str) -> Result<RgbImage, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }
    // Canvas `toDataURL` output carries a "data:image/jpeg;base64," prefix.
    let payload = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }

    let bytes = BASE64.decode(payload)?;
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg)
        .map_err(CodecError::Decode)?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(CodecError::ZeroArea);
    }
    Ok(image)
}

/// Encode an RGB8 image to a base64 string in the requested reply format.
///
/// `quality` applies to JPEG (clamped to 1-100); `png_compression` maps the
/// 0-9 scale onto the encoder's compression presets.
pub fn encode_frame(
    image: &RgbImage,
    format: ReplyFormat,
    quality: u8,
    png_compression: u8,
) -> Result<String, CodecError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(CodecError::ZeroArea);
    }

    let mut buffer = Vec::new();
    match format {
        ReplyFormat::Jpeg => {
            JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
                .encode_image(image)
                .map_err(CodecError::Encode)?;
        }
        ReplyFormat::Png => {
            let compression = match png_compression {
                0..=3 => CompressionType::Fast,
                4..=6 => CompressionType::Default,
                _ => CompressionType::Best,
            };
            PngEncoder::new_with_quality(
                &mut buffer,
                compression,
                image::codecs::png::FilterType::Adaptive,
            )
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(CodecError::Encode)?;
        }
    }

    Ok(BASE64.encode(&buffer))
}

/// Downscale a reply proportionally when it exceeds the configured bounds.
pub fn resize_if_needed(image: RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= max_width && height <= max_height {
        return image;
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * scale) as u32).max(1);
    let new_height = ((height as f64 * scale) as u32).max(1);
    imageops::resize(
        &image,
        new_width,
        new_height,
        imageops::FilterType::Triangle,
    )
}
