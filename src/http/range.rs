//! HTTP `Range` header parsing and multipart/byteranges framing.

use crate::errors::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    pub fn content_range(&self, total_size: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            total_size
        )
    }

    pub fn mime_header(&self, content_type: &str, total_size: u64) -> Vec<(String, String)> {
        vec![
            ("Content-Range".to_string(), self.content_range(total_size)),
            ("Content-Type".to_string(), content_type.to_string()),
        ]
    }
}

/// Parses a `Range: bytes=a-b,c-d` header value against a resource of
/// `size` bytes. An empty header (no `Range` sent at all) is the caller's
/// concern, not this function's — call only when a header is present.
pub fn parse_range(header_value: &str, size: i64) -> Result<Vec<HttpRange>> {
    let header_value = header_value.trim();
    let spec = header_value
        .strip_prefix("bytes=")
        .ok_or_else(|| StoreError::RangeNotSatisfiable)?;

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let dash = part.find('-').ok_or(StoreError::RangeNotSatisfiable)?;
        let start_str = &part[..dash];
        let end_str = &part[dash + 1..];

        let range = if start_str.is_empty() {
            // Suffix range: "-N" means the last N bytes.
            let suffix_len: i64 = end_str
                .parse()
                .map_err(|_| StoreError::RangeNotSatisfiable)?;
            if suffix_len == 0 {
                continue;
            }
            let length = suffix_len.min(size);
            HttpRange {
                start: (size - length).max(0) as u64,
                length: length as u64,
            }
        } else {
            let start: i64 = start_str
                .parse()
                .map_err(|_| StoreError::RangeNotSatisfiable)?;
            if start < 0 || start >= size {
                return Err(StoreError::RangeNotSatisfiable);
            }
            let end = if end_str.is_empty() {
                size - 1
            } else {
                let e: i64 = end_str.parse().map_err(|_| StoreError::RangeNotSatisfiable)?;
                if e >= size {
                    size - 1
                } else {
                    e
                }
            };
            if end < start {
                return Err(StoreError::RangeNotSatisfiable);
            }
            HttpRange {
                start: start as u64,
                length: (end - start + 1) as u64,
            }
        };
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(StoreError::RangeNotSatisfiable);
    }
    Ok(ranges)
}

pub fn sum_ranges_size(ranges: &[HttpRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// Total bytes of a `multipart/byteranges` response, including MIME part
/// boundaries and headers, mirroring `rangesMIMESize`'s estimate-by-writing
/// approach (here computed directly rather than writing to a discard sink).
pub fn ranges_mime_size(ranges: &[HttpRange], content_type: &str, total_size: u64, boundary: &str) -> u64 {
    let mut encoding_size = 0u64;
    for range in ranges {
        let header = format!(
            "--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: {}\r\n\r\n",
            range.content_range(total_size)
        );
        encoding_size += header.len() as u64 + range.length + 2; // trailing \r\n after each part body
    }
    encoding_size + format!("--{boundary}--\r\n").len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range() {
        let ranges = parse_range("bytes=0-99", 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 0, length: 100 }]);
    }

    #[test]
    fn open_ended_range() {
        let ranges = parse_range("bytes=900-", 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 900, length: 100 }]);
    }

    #[test]
    fn suffix_range() {
        let ranges = parse_range("bytes=-500", 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 500, length: 500 }]);
    }

    #[test]
    fn suffix_range_longer_than_resource_is_clamped() {
        let ranges = parse_range("bytes=-5000", 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 0, length: 1000 }]);
    }

    #[test]
    fn multiple_ranges() {
        let ranges = parse_range("bytes=0-9,20-29", 1000).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(sum_ranges_size(&ranges), 20);
    }

    #[test]
    fn start_past_end_is_not_satisfiable() {
        assert!(parse_range("bytes=5000-", 1000).is_err());
    }

    #[test]
    fn malformed_header_is_not_satisfiable() {
        assert!(parse_range("items=0-9", 1000).is_err());
    }
}
