//! Write guard keeping image payloads out of the durable store.
//!
//! Every text value written to a table passes through here. Data URIs,
//! control bytes and long base64 runs that decode to an image or PDF are
//! rejected. Opaque base64 such as bearer tokens passes.

use super::{StoreError, StoreResult};
use base64::Engine;

/// Shortest string that is treated as a possible base64 blob
const BASE64_SUSPECT_LEN: usize = 256;

/// Leading bytes of the formats a capture session produces
fn has_media_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"\x89PNG")
        || bytes.starts_with(b"GIF8")
        || bytes.starts_with(b"%PDF")
        || (bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()))
        || bytes.get(4..8) == Some(b"ftyp".as_slice())
}

fn is_base64_blob(value: &str) -> bool {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.len() < BASE64_SUSPECT_LEN {
        return false;
    }
    let engines = [
        &base64::engine::general_purpose::STANDARD,
        &base64::engine::general_purpose::STANDARD_NO_PAD,
        &base64::engine::general_purpose::URL_SAFE,
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
    ];
    engines
        .iter()
        .filter_map(|engine| engine.decode(compact.as_bytes()).ok())
        .any(|bytes| has_media_magic(&bytes))
}

/// Returns why `value` looks like a payload, or `None` for plain metadata
pub fn payload_reason(value: &str) -> Option<&'static str> {
    let head: String = value.trim_start().chars().take(5).collect();
    if head.eq_ignore_ascii_case("data:") {
        return Some("data URI");
    }
    if value
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Some("binary content");
    }
    if is_base64_blob(value) {
        return Some("base64 blob");
    }
    None
}

pub fn ensure_metadata(field: &str, value: &str) -> StoreResult<()> {
    match payload_reason(value) {
        Some(reason) => {
            log::error!("Rejected payload-like value for {} ({})", field, reason);
            Err(StoreError::PayloadRejected {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        }
        None => Ok(()),
    }
}

pub fn ensure_metadata_opt(field: &str, value: Option<&str>) -> StoreResult<()> {
    match value {
        Some(v) => ensure_metadata(field, v),
        None => Ok(()),
    }
}

/// Walks a JSON document and checks every string in it
pub fn ensure_json_metadata(field: &str, value: &serde_json::Value) -> StoreResult<()> {
    match value {
        serde_json::Value::String(s) => ensure_metadata(field, s),
        serde_json::Value::Array(items) => {
            for item in items {
                ensure_json_metadata(field, item)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                ensure_json_metadata(&format!("{}.{}", field, key), item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
