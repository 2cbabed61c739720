#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn length(self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Parses a single-range `Range` header against a body of `size` bytes.
/// Supported forms: `bytes=a-b`, `bytes=a-` (clamped to the end) and
/// `bytes=-n` (suffix). Multi-range headers are rejected.
pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let header = header.trim();
    let Some(range) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };
    if range.is_empty() || range.contains(',') {
        return Err(RangeError::Invalid);
    }

    let parts: Vec<&str> = range.split('-').collect();
    if parts.len() != 2 {
        return Err(RangeError::Invalid);
    }

    let start_str = parts[0].trim();
    let end_str = parts[1].trim();

    if start_str.is_empty() {
        // suffix range: bytes=-N
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let start = size.saturating_sub(suffix);
        return Ok(RangeSpec {
            start,
            end: size - 1,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end_val: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        end_val.min(size - 1)
    };

    if end < start {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(RangeSpec { start, end })
}

pub fn build_content_range(spec: RangeSpec, size: u64) -> String {
    format!("bytes {}-{}/{}", spec.start, spec.end, size)
}

/// The `Content-Range` value sent alongside a 416 rejection.
pub fn unsatisfiable_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}
