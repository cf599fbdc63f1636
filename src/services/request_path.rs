//! Canonical request paths.
//!
//! Admission decisions are made on the raw path, and that same path is what the upstream
//! receives. A path that a URL library or an upstream server would rewrite into another
//! path (dot segments, encoded separators, empty segments) is refused, never normalized.
use tracing::debug;

use crate::error::AppError;

/// Byte sequences that let one path be read as another once decoded.
const FORBIDDEN: [&str; 7] = ["\\", "\0", ";", "%2f", "%5c", "%25", "%00"];

/// Accept `path` only when it is already in canonical form.
pub fn ensure_canonical(path: &str) -> Result<(), AppError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(reject(path, "path must start with '/'"));
    };

    let lower = path.to_ascii_lowercase();
    if FORBIDDEN.iter().any(|s| lower.contains(s)) {
        return Err(reject(path, "path contains an encoded or reserved separator"));
    }

    if rest.is_empty() {
        return Ok(());
    }
    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        // A trailing slash is fine; `//` elsewhere is not.
        if segment.is_empty() && i != last {
            return Err(reject(path, "path contains an empty segment"));
        }
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        if decoded == "." || decoded == ".." {
            return Err(reject(path, "path contains a dot segment"));
        }
    }
    Ok(())
}

fn reject(path: &str, reason: &'static str) -> AppError {
    debug!(path, reason, "non-canonical request path");
    AppError::invalid_request(reason)
}
