//! Build-time defaults: `KEY=VALUE` property files
//!
//! - whitespace around key and value is stripped
//! - lines whose key starts with `#` are comments
//! - lines without `=` are ignored
//! - only the first `=` splits; the value may contain more
//! - lines that are not UTF-8 are logged and skipped

use std::path::Path;

use crate::error::PropertyError;

/// Parse property file contents into `(key, value)` pairs, in file order
#[must_use]
pub fn parse_properties(data: &str) -> Vec<(String, String)> {
    data.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.starts_with('#') {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Like `parse_properties`, for raw file contents
fn parse_properties_bytes(data: &[u8], origin: &Path) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for (n, line) in data.split(|&b| b == b'\n').enumerate() {
        match std::str::from_utf8(line) {
            Ok(line) => entries.extend(parse_line(line)),
            Err(_) => tracing::warn!("{}:{}: not UTF-8, line skipped", origin.display(), n + 1),
        }
    }
    entries
}

/// Read and parse a property file
pub fn load_properties_file(path: &Path) -> Result<Vec<(String, String)>, PropertyError> {
    let data = std::fs::read(path).map_err(|source| PropertyError::PersistIo {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = parse_properties_bytes(&data, path);
    tracing::debug!("read {} entries from {}", entries.len(), path.display());
    Ok(entries)
}
