use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use skyrelay_rpc::Value;

use crate::overlay;
use crate::FrameError;

const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const PLACEHOLDER_COLOR: Rgb<u8> = Rgb([100, 100, 100]);
const PLACEHOLDER_TEXT: &str = "WAITING FOR SIMULATOR...";

/// Normalises a `simGetImage` result to raw compressed image bytes.
///
/// Depending on the simulator build the image arrives as msgpack binary, as a
/// base64 string, as a string carrying the bytes as Latin-1, or as an array of
/// byte values. Anything else, or an empty payload, yields `None`.
pub fn payload_bytes(payload: Value) -> Option<Vec<u8>> {
    let bytes = match payload {
        Value::Binary(b) => b,
        Value::String(s) if s.is_str() => {
            let text = s.into_str()?;
            match BASE64.decode(text.trim()) {
                Ok(b) => b,
                Err(_) => latin1(&text)?,
            }
        }
        Value::String(s) => s.into_bytes(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect::<Option<Vec<u8>>>()?,
        _ => return None,
    };
    if bytes.is_empty() { None } else { Some(bytes) }
}

fn latin1(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(c).ok()).collect()
}

/// Decodes a compressed frame, stamps `label` in the top-left corner and
/// re-encodes it as JPEG.
pub fn relabel(raw: &[u8], label: &str, quality: u8) -> Result<Vec<u8>, FrameError> {
    let img = image::load_from_memory(raw).map_err(FrameError::Decode)?;
    let mut rgb = img.to_rgb8();
    overlay::draw_text(&mut rgb, label, 10, 30, 2, LABEL_COLOR);
    encode_jpeg(&rgb, quality)
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(img)
        .map_err(FrameError::Encode)?;
    Ok(out)
}

/// 640x480 black frame shown until the simulator delivers a real image.
pub fn placeholder_jpeg() -> Result<Vec<u8>, FrameError> {
    let mut img = RgbImage::new(640, 480);
    let scale = 3;
    let x = (640 - overlay::text_width(PLACEHOLDER_TEXT, scale)) / 2;
    overlay::draw_text(&mut img, PLACEHOLDER_TEXT, x, 250, scale, PLACEHOLDER_COLOR);
    encode_jpeg(&img, 80)
}
