use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Locally resolvable reference to upload bytes.
///
/// `Memory` handles point into the in-process blob cache and do not survive
/// a restart. `File` handles point at a file on disk. The bytes themselves
/// are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BlobRef {
    Memory(String),
    File(PathBuf),
}

impl BlobRef {
    pub fn to_ref_string(&self) -> String {
        match self {
            BlobRef::Memory(key) => format!("mem:{}", key),
            BlobRef::File(path) => format!("file:{}", path.to_string_lossy()),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if let Some(key) = s.strip_prefix("mem:") {
            if !key.is_empty() {
                return Some(BlobRef::Memory(key.to_string()));
            }
        } else if let Some(path) = s.strip_prefix("file:") {
            if !path.is_empty() {
                return Some(BlobRef::File(PathBuf::from(path)));
            }
        }
        None
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BlobRef::Memory(_))
    }
}

impl From<BlobRef> for String {
    fn from(value: BlobRef) -> Self {
        value.to_ref_string()
    }
}

impl TryFrom<String> for BlobRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BlobRef::parse(&value).ok_or_else(|| format!("Invalid blob reference: {}", value))
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_ref_string())
    }
}
