use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::io::Cursor;
use std::time::{Duration, Instant};

const CANVAS_SIZE: u32 = 400;
/// Shapes drawn between two deadline checks
const DEADLINE_STRIDE: usize = 32;

/// Draws `shapes` filled rectangles and circles onto an offscreen canvas,
/// encodes it as JPEG and returns the elapsed wall time.
///
/// The canvas and the encoded output are dropped before returning.
pub fn measure(shapes: usize) -> Result<Duration, String> {
    measure_until(shapes, None)
}

/// Like [`measure`], but gives up once `deadline` has passed so an
/// abandoned run stops drawing instead of holding its thread.
pub fn measure_until(shapes: usize, deadline: Option<Instant>) -> Result<Duration, String> {
    let started = Instant::now();
    let mut canvas = RgbImage::new(CANVAS_SIZE, CANVAS_SIZE);

    for i in 0..shapes {
        if i % DEADLINE_STRIDE == 0 && deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(format!("Benchmark passed its deadline after {} shapes", i));
        }
        let seed = (i as u32).wrapping_mul(2_654_435_761);
        let x = seed % CANVAS_SIZE;
        let y = (seed >> 8) % CANVAS_SIZE;
        let size = 10 + (seed >> 16) % 40;
        let color = Rgb([(seed & 0xff) as u8, ((seed >> 8) & 0xff) as u8, ((seed >> 16) & 0xff) as u8]);

        if i % 2 == 0 {
            fill_rect(&mut canvas, x, y, size, size, color);
        } else {
            fill_circle(&mut canvas, x, y, size / 2, color);
        }
    }

    let mut buffer = Cursor::new(Vec::new());
    canvas
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, 80))
        .map_err(|e| format!("Benchmark encode failed: {}", e))?;
    let encoded = buffer.into_inner().len();
    drop(canvas);

    if encoded == 0 {
        return Err("Benchmark encode produced no output".to_string());
    }
    Ok(started.elapsed())
}

fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = (x + w).min(canvas.width());
    let y_end = (y + h).min(canvas.height());
    for py in y..y_end {
        for px in x..x_end {
            canvas.put_pixel(px, py, color);
        }
    }
}

fn fill_circle(canvas: &mut RgbImage, cx: u32, cy: u32, r: u32, color: Rgb<u8>) {
    let r = r as i64;
    let (cx, cy) = (cx as i64, cy as i64);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let (px, py) = (cx + dx, cy + dy);
            if px >= 0 && py >= 0 && (px as u32) < canvas.width() && (py as u32) < canvas.height() {
                canvas.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Maps benchmark time to a 0-100 score. 50ms or less scores 100,
/// one second or more scores 0, linear in between.
pub fn score_from_elapsed(elapsed: Duration) -> u8 {
    let ms = elapsed.as_millis() as u64;
    if ms <= 50 {
        100
    } else if ms >= 1000 {
        0
    } else {
        (100 - (ms - 50) * 100 / 950) as u8
    }
}
