//! `Upload-Metadata` header encoding.
//!
//! The header is a comma-separated list of `key base64(value)` pairs.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::ProtocolError;

/// Key always injected with the upload id as value.
pub const FILENAME_KEY: &str = "filename";

/// Encodes metadata pairs, injecting `filename=<upload_id>`.
///
/// Pairs are emitted in key order so the header is stable across calls.
pub fn encode_metadata(metadata: &BTreeMap<String, String>, upload_id: &str) -> String {
    let mut pairs = metadata.clone();
    pairs.insert(FILENAME_KEY.to_string(), upload_id.to_string());
    pairs
        .iter()
        .map(|(key, value)| format!("{key} {}", STANDARD.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decodes an `Upload-Metadata` header value.
///
/// A key without a value decodes to an empty string.
pub fn decode_metadata(header: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut out = BTreeMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProtocolError::InvalidMetadata(pair.to_string()))?;
        let value = match parts.next().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|_| ProtocolError::InvalidBase64 { key: key.to_string() })?;
                String::from_utf8(bytes)
                    .map_err(|_| ProtocolError::InvalidBase64 { key: key.to_string() })?
            }
            _ => String::new(),
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}
