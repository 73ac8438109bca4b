use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{json, Value};
use veracity_contracts::records::ImageFile;

/// Bytes and MIME type actually sent for analysis. Decodable images are
/// flattened onto white, bounded to `max_dim` and re-encoded as JPEG;
/// anything else goes out untouched.
pub(crate) fn prepare_upload(image: &ImageFile, max_dim: u32) -> (Vec<u8>, String) {
    let dim = max_dim.max(128);
    if let Ok(decoded) = image::load_from_memory(image.bytes()) {
        let rgba = decoded.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let mut flattened = DynamicImage::ImageRgba8(flattened);
        if flattened.width() > dim || flattened.height() > dim {
            flattened = flattened.resize(dim, dim, FilterType::Triangle);
        }
        let rgb = flattened.to_rgb8();
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder.encode_image(&DynamicImage::ImageRgb8(rgb)).is_ok() {
            return (bytes, "image/jpeg".to_string());
        }
    }
    (image.bytes().to_vec(), image.mime_type.clone())
}

pub(crate) fn inline_part(bytes: &[u8], mime_type: &str) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": BASE64.encode(bytes),
        }
    })
}
