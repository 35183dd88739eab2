use capture_imaging::QualityTier;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Slow,
    Medium,
    Fast,
}

impl NetworkClass {
    pub fn as_str(&self) -> &str {
        match self {
            NetworkClass::Slow => "slow",
            NetworkClass::Medium => "medium",
            NetworkClass::Fast => "fast",
        }
    }
}

/// Estimated device resources and the derived pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCapabilities {
    pub memory_gb: f64,
    pub cpu_cores: u32,
    pub network: NetworkClass,
    /// 0-100 from the canvas benchmark, 50 when it timed out
    pub performance_score: u8,
    /// Always within 1..=6
    pub recommended_batch_size: usize,
    pub recommended_quality: QualityTier,
    /// Memory below 4 GB narrows the transform batch bound
    pub memory_constrained: bool,
}
