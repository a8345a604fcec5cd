//! Local catalog content: a single FBC file or a directory of them.

use std::path::Path;

use super::Result;

/// What: Read catalog content from a file or directory.
///
/// Inputs:
/// - `path`: A file containing an FBC stream, or a directory whose
///   `.json` files are concatenated in name order.
///
/// Output:
/// - The combined content stream.
pub fn read_catalog_path(path: &Path) -> Result<String> {
    if path.is_file() {
        return Ok(std::fs::read_to_string(path)?);
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_file() && name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    let mut combined = String::new();
    for name in names {
        combined.push_str(&std::fs::read_to_string(path.join(name))?);
        combined.push('\n');
    }
    Ok(combined)
}
