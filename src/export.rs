use anyhow::{Context as _, bail};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::preparser::DecodedFrame;

/// Encode `frame` as a JPEG fitting inside `width` x `height`.
///
/// With `preserve_aspect` the output keeps the source aspect ratio inside
/// the requested bounding box; otherwise it is stretched to exactly the
/// requested dimensions.
pub fn export_jpeg(
    frame: DecodedFrame,
    width: u32,
    height: u32,
    preserve_aspect: bool,
    quality: u8,
) -> anyhow::Result<Vec<u8>> {
    if width == 0 || height == 0 {
        bail!("requested thumbnail dimensions {width}x{height} are empty");
    }

    let DecodedFrame {
        width: src_width,
        height: src_height,
        data,
    } = frame;

    let rgb = RgbImage::from_raw(src_width, src_height, data)
        .context("frame buffer does not match its declared dimensions")?;

    let image = DynamicImage::ImageRgb8(rgb);
    let scaled = if preserve_aspect {
        image.resize(width, height, FilterType::Triangle)
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    };

    let mut encoded = Vec::new();
    scaled
        .write_with_encoder(JpegEncoder::new_with_quality(&mut encoded, quality))
        .context("jpeg encode failed")?;
    Ok(encoded)
}
