use crate::models::{
    GalleryDerivative, ImageInfo, PdfDerivative, ProcessedImage, SourceImage, TransformOptions,
};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageError, ImageFormat, ImageReader};
use std::io::Cursor;

/// Error type for transform operations
#[derive(Debug)]
pub enum TransformError {
    /// Input could not be decoded as an image
    Decode(String),
    /// Input exceeds the byte or pixel limits
    InputTooLarge(String),
    /// Encoder returned no bytes for the named derivative
    EmptyOutput(&'static str),
    Encode(String),
    /// Decoder hit an allocation limit
    MemoryLimit(String),
    /// No result within the per-request timeout
    Timeout,
    /// The worker was destroyed; no further requests are accepted
    WorkerDestroyed,
    /// A worker thread panicked or exited while holding the request
    WorkerCrashed(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Decode(msg) => write!(f, "Image decode error: {}", msg),
            TransformError::InputTooLarge(msg) => write!(f, "Input too large: {}", msg),
            TransformError::EmptyOutput(which) => {
                write!(f, "Encoder produced empty {} output", which)
            }
            TransformError::Encode(msg) => write!(f, "Image encode error: {}", msg),
            TransformError::MemoryLimit(msg) => write!(f, "Out of memory while decoding: {}", msg),
            TransformError::Timeout => write!(f, "Transform timed out"),
            TransformError::WorkerDestroyed => write!(f, "Transform worker has been destroyed"),
            TransformError::WorkerCrashed(msg) => write!(f, "Transform worker crashed: {}", msg),
            TransformError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<std::io::Error> for TransformError {
    fn from(err: std::io::Error) -> Self {
        TransformError::IoError(err)
    }
}

impl TransformError {
    /// Whether this failure concerns one input only. `false` means the
    /// worker pool itself is unavailable.
    pub fn is_unit_failure(&self) -> bool {
        !matches!(
            self,
            TransformError::WorkerDestroyed | TransformError::WorkerCrashed(_)
        )
    }
}

pub type TransformResult<T> = Result<T, TransformError>;

fn decode_error(err: ImageError) -> TransformError {
    match err {
        ImageError::Limits(e) => TransformError::MemoryLimit(e.to_string()),
        other => TransformError::Decode(other.to_string()),
    }
}

/// Fits `width`x`height` into a `max_edge` square keeping the aspect ratio.
/// Never upscales.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let ratio = (width as f32 / max_edge as f32).max(height as f32 / max_edge as f32);

    if ratio > 1.0 {
        let new_width = ((width as f32 / ratio) as u32).max(1);
        let new_height = ((height as f32 / ratio) as u32).max(1);
        (new_width, new_height)
    } else {
        (width, height)
    }
}

fn downscale(img: &DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = fit_within(img.width(), img.height(), max_edge);
    if (w, h) == (img.width(), img.height()) {
        img.clone()
    } else {
        img.resize(w, h, FilterType::Lanczos3)
    }
}

/// Decodes `bytes` after checking the size limits against the header
pub fn decode_checked(bytes: &[u8], options: &TransformOptions) -> TransformResult<DynamicImage> {
    if bytes.is_empty() {
        return Err(TransformError::Decode("empty input".to_string()));
    }
    if bytes.len() as u64 > options.max_input_bytes {
        return Err(TransformError::InputTooLarge(format!(
            "{} bytes exceeds limit of {}",
            bytes.len(),
            options.max_input_bytes
        )));
    }

    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
        .map_err(decode_error)?;

    let pixels = width as u64 * height as u64;
    if pixels > options.max_pixels {
        return Err(TransformError::InputTooLarge(format!(
            "{}x{} exceeds limit of {} pixels",
            width, height, options.max_pixels
        )));
    }

    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()
        .map_err(decode_error)
}

/// Encodes a baseline RGB JPEG no larger than `max_edge`.
/// Returns (bytes, width, height).
pub fn encode_jpeg(
    img: &DynamicImage,
    max_edge: u32,
    quality: u8,
) -> TransformResult<(Vec<u8>, u32, u32)> {
    let scaled = downscale(img, max_edge);
    let rgb = scaled.to_rgb8();

    let mut buffer = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)))
        .map_err(|e| TransformError::Encode(format!("Failed to write JPEG: {}", e)))?;

    let bytes = buffer.into_inner();
    if bytes.is_empty() {
        return Err(TransformError::EmptyOutput("pdf"));
    }
    Ok((bytes, rgb.width(), rgb.height()))
}

fn encode_gallery(img: &DynamicImage, max_edge: u32) -> TransformResult<GalleryDerivative> {
    let scaled = DynamicImage::ImageRgb8(downscale(img, max_edge).to_rgb8());

    let mut buffer = Cursor::new(Vec::new());
    scaled
        .write_to(&mut buffer, ImageFormat::WebP)
        .map_err(|e| TransformError::Encode(format!("Failed to write gallery WebP: {}", e)))?;

    let bytes = buffer.into_inner();
    if bytes.is_empty() {
        return Err(TransformError::EmptyOutput("gallery"));
    }

    Ok(GalleryDerivative {
        size: bytes.len(),
        width: scaled.width(),
        height: scaled.height(),
        bytes,
    })
}

/// Produces the gallery WebP and the PDF JPEG for one input.
/// Blocking; callers run it on a worker thread.
pub fn process_image(
    source: &SourceImage,
    options: &TransformOptions,
) -> TransformResult<ProcessedImage> {
    log::debug!(
        "Transforming {} ({} bytes, tier {})",
        source.filename,
        source.bytes.len(),
        options.quality
    );

    let img = decode_checked(&source.bytes, options)?;

    let gallery = encode_gallery(&img, options.quality.gallery_max_edge())?;
    let (pdf_bytes, _, _) = encode_jpeg(
        &img,
        options.quality.pdf_max_edge(),
        options.quality.pdf_jpeg_quality(),
    )?;

    Ok(ProcessedImage {
        filename: source.filename.clone(),
        gallery,
        pdf: PdfDerivative {
            size: pdf_bytes.len(),
            bytes: pdf_bytes,
        },
        metadata: ImageInfo {
            original_size: source.bytes.len(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            gps: source.gps,
        },
    })
}

/// Re-encodes an arbitrary downloaded image for PDF embedding
pub fn reencode_for_pdf(
    bytes: &[u8],
    max_edge: u32,
    quality: u8,
) -> TransformResult<(Vec<u8>, u32, u32)> {
    let img = decode_checked(bytes, &TransformOptions::default())?;
    encode_jpeg(&img, max_edge, quality)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::QualityTier;
    use image::{Rgb, RgbImage};

    pub(crate) fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buffer = Cursor::new(Vec::new());
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, 90))
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_fit_within() {
        // Image larger than max
        let (w, h) = fit_within(2000, 1500, 1024);
        assert!(w <= 1024);
        assert!(h <= 1024);
        assert_eq!(w, 1024);
        assert_eq!(h, 768);

        // Image smaller than max
        let (w, h) = fit_within(800, 600, 1024);
        assert_eq!(w, 800);
        assert_eq!(h, 600);
    }

    #[test]
    fn test_process_image_produces_both_derivatives() {
        let source = SourceImage::new("front.jpg", sample_jpeg(1600, 1200));
        let options = TransformOptions {
            quality: QualityTier::Mobile,
            ..Default::default()
        };

        let processed = process_image(&source, &options).unwrap();
        assert_eq!(processed.filename, "front.jpg");
        assert_eq!(processed.gallery.width, 1280);
        assert_eq!(processed.gallery.height, 960);
        assert_eq!(processed.gallery.size, processed.gallery.bytes.len());
        assert!(processed.pdf.size > 0);
        assert_eq!(processed.metadata.original_size, source.bytes.len());

        let (w, h) = ImageReader::new(Cursor::new(&processed.pdf.bytes))
            .with_guessed_format()
            .unwrap()
            .into_dimensions()
            .unwrap();
        assert_eq!((w, h), (800, 600));
    }

    #[test]
    fn test_corrupt_input_is_decode_error() {
        let source = SourceImage::new("broken.jpg", b"definitely not a jpeg".to_vec());
        let err = process_image(&source, &TransformOptions::default()).unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
        assert!(err.is_unit_failure());
    }

    #[test]
    fn test_oversized_input_rejected_before_decode() {
        let source = SourceImage::new("huge.jpg", sample_jpeg(400, 300));
        let options = TransformOptions {
            max_pixels: 1_000,
            ..Default::default()
        };
        let err = process_image(&source, &options).unwrap_err();
        assert!(matches!(err, TransformError::InputTooLarge(_)));

        let options = TransformOptions {
            max_input_bytes: 10,
            ..Default::default()
        };
        let err = process_image(&source, &options).unwrap_err();
        assert!(matches!(err, TransformError::InputTooLarge(_)));
    }

    #[test]
    fn test_worker_errors_are_not_unit_failures() {
        assert!(!TransformError::WorkerDestroyed.is_unit_failure());
        assert!(!TransformError::WorkerCrashed("panic".into()).is_unit_failure());
        assert!(TransformError::Timeout.is_unit_failure());
    }
}
