use serde::{Deserialize, Serialize};

/// Quality tier chosen per run, from the capability estimate or the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Mobile,      // constrained devices, smallest derivatives
    Protocol,    // default for handover protocols
    HighQuality, // fast devices on fast networks
}

impl QualityTier {
    /// Longest edge of the gallery WebP in pixels
    pub fn gallery_max_edge(&self) -> u32 {
        match self {
            QualityTier::Mobile => 1280,
            QualityTier::Protocol => 1920,
            QualityTier::HighQuality => 2560,
        }
    }

    /// JPEG quality of the PDF derivative (1-100)
    pub fn pdf_jpeg_quality(&self) -> u8 {
        match self {
            QualityTier::Mobile => 20,
            QualityTier::Protocol => 40,
            QualityTier::HighQuality => 60,
        }
    }

    /// Longest edge of the PDF derivative in pixels
    pub fn pdf_max_edge(&self) -> u32 {
        800
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Mobile => "mobile",
            QualityTier::Protocol => "protocol",
            QualityTier::HighQuality => "high_quality",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location attached to a captured photo by the caller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Raw input handed to the transform worker
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub gps: Option<GpsPoint>,
}

impl SourceImage {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            gps: None,
        }
    }

    pub fn with_gps(mut self, gps: GpsPoint) -> Self {
        self.gps = Some(gps);
        self
    }
}

/// Limits and tier applied to a single transform
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub quality: QualityTier,
    /// Inputs above this many bytes are rejected before decoding
    pub max_input_bytes: u64,
    /// Inputs above this many pixels are rejected before decoding
    pub max_pixels: u64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            quality: QualityTier::Protocol,
            max_input_bytes: 40 * 1024 * 1024,
            max_pixels: 100_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryDerivative {
    pub bytes: Vec<u8>,
    pub size: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfDerivative {
    pub bytes: Vec<u8>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub original_size: usize,
    /// Milliseconds since epoch at transform time
    pub timestamp: i64,
    pub gps: Option<GpsPoint>,
}

/// Both derivatives of one input image
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub filename: String,
    pub gallery: GalleryDerivative,
    pub pdf: PdfDerivative,
    pub metadata: ImageInfo,
}

/// One input that failed inside a batch
#[derive(Debug)]
pub struct BatchFailure {
    pub index: usize,
    pub filename: String,
    pub error: crate::TransformError,
}

/// Successes and failures of a batch, both ordered by input index
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub successes: Vec<(usize, ProcessedImage)>,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// True when a failure means the worker itself is gone
    pub fn worker_unavailable(&self) -> bool {
        self.failures.iter().any(|f| !f.error.is_unit_failure())
    }
}
