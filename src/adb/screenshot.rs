//! Screen capture over ADB.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GenericImageView, RgbImage};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

use super::exec::{AdbError, AdbRunner, SCREENSHOT_TIMEOUT};

/// Dimensions used for the synthesized frame when the device refuses capture.
const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// A captured device frame.
///
/// When `sensitive` is true the device returned an empty or fully-black frame
/// (Android blanks protected surfaces such as payment pages) and `png` holds
/// a synthesized black image of the declared dimensions, so downstream
/// coordinate math always has nonzero width and height to work with.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sensitive: bool,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    /// Base64 of the PNG payload, for data-URL embedding in model messages.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }

    /// A synthesized uniformly-black frame.
    pub fn black_fallback(sensitive: bool) -> Self {
        let img = RgbImage::from_pixel(FALLBACK_WIDTH, FALLBACK_HEIGHT, image::Rgb([0, 0, 0]));
        let mut buffer = Cursor::new(Vec::new());
        // Encoding an in-memory RGB image to PNG cannot fail
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .ok();
        Self {
            png: buffer.into_inner(),
            width: FALLBACK_WIDTH,
            height: FALLBACK_HEIGHT,
            sensitive,
            captured_at: Utc::now(),
        }
    }
}

/// Capture the current screen of a device.
///
/// Runs `adb exec-out screencap -p` and parses the PNG header for the frame
/// dimensions. An empty payload, a non-PNG payload, or a frame that decodes
/// to pure black is treated as a protected surface and reported as
/// `sensitive=true` with a synthesized black frame.
pub async fn capture(
    runner: &AdbRunner,
    device_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Screenshot, AdbError> {
    let out = runner
        .run(
            device_id,
            &["exec-out", "screencap", "-p"],
            "screenshot",
            SCREENSHOT_TIMEOUT,
            cancel,
        )
        .await?;

    if !out.status_ok && out.stdout.is_empty() {
        return Err(AdbError::Io(format!(
            "screencap failed: {}",
            out.stderr.trim()
        )));
    }

    if out.stdout.is_empty() {
        tracing::warn!(device = device_id.unwrap_or("default"), "empty screencap payload, treating as protected surface");
        return Ok(Screenshot::black_fallback(true));
    }

    let Some((width, height)) = png_dimensions(&out.stdout) else {
        tracing::warn!(device = device_id.unwrap_or("default"), "non-PNG screencap payload, treating as protected surface");
        return Ok(Screenshot::black_fallback(true));
    };

    if is_black_frame(&out.stdout) {
        return Ok(Screenshot::black_fallback(true));
    }

    Ok(Screenshot {
        png: out.stdout,
        width,
        height,
        sensitive: false,
        captured_at: Utc::now(),
    })
}

/// Read (width, height) from the IHDR chunk of a PNG byte stream.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE {
        return None;
    }
    // IHDR is mandated to be the first chunk: length(4) type(4) data(13)
    if &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Whether the PNG decodes to a fully-opaque black image.
///
/// Samples a coarse grid rather than every pixel; a protected-surface frame
/// is uniformly black so sampling cannot miss it.
fn is_black_frame(png: &[u8]) -> bool {
    let Ok(img) = image::load_from_memory(png) else {
        return false;
    };
    let (w, h) = img.dimensions();
    let step_x = (w / 32).max(1);
    let step_y = (h / 32).max(1);
    for y in (0..h).step_by(step_y as usize) {
        for x in (0..w).step_by(step_x as usize) {
            let p = img.get_pixel(x, y);
            if p.0[0] != 0 || p.0[1] != 0 || p.0[2] != 0 {
                return false;
            }
        }
    }
    true
}
