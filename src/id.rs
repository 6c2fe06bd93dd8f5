//! Volume/needle/file identifiers: parsing and formatting for the wire
//! encoding used on URLs and in the replication/sync surface.

use crate::errors::StoreError;

pub type VolumeId = u32;
pub type NeedleKey = u64;
pub type Cookie = u32;

/// A fully-qualified needle address: `(VolumeId, Key, Cookie)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleKey,
    pub cookie: Cookie,
}

impl FileId {
    pub fn to_string(&self) -> String {
        format!("{},{}", self.volume_id, format_needle_id(self.key, self.cookie))
    }
}

pub fn parse_volume_id(s: &str) -> Result<VolumeId, StoreError> {
    s.parse::<VolumeId>()
        .map_err(|_| StoreError::InvalidId(format!("invalid volume id: {s}")))
}

/// Splits off an optional trailing `_<decimal>` delta, left-pads to even hex
/// length, and requires 9-24 total nibbles.
pub fn parse_needle_id(s: &str) -> Result<(NeedleKey, Cookie), StoreError> {
    let (hex_part, delta) = match s.rfind('_') {
        // A leading `_` (index 0) has no hex part before it and is not a
        // valid delta separator.
        Some(idx) if idx > 0 => (&s[..idx], Some(&s[idx + 1..])),
        _ => (s, None),
    };

    let padded: std::borrow::Cow<str> = if hex_part.len() % 2 == 1 {
        std::borrow::Cow::Owned(format!("0{hex_part}"))
    } else {
        std::borrow::Cow::Borrowed(hex_part)
    };

    if padded.len() <= 8 || padded.len() > 24 {
        return Err(StoreError::InvalidId(format!("invalid key/cookie: {s}")));
    }

    let split = padded.len() - 8;
    let key_hex = &padded[..split];
    let cookie_hex = &padded[split..];

    let mut key = u64::from_str_radix(key_hex, 16)
        .map_err(|_| StoreError::InvalidId(format!("invalid key: {s}")))?;
    let cookie = u32::from_str_radix(cookie_hex, 16)
        .map_err(|_| StoreError::InvalidId(format!("invalid cookie: {s}")))?;

    if let Some(delta) = delta {
        let d: u64 = delta
            .parse()
            .map_err(|_| StoreError::InvalidId(format!("invalid delta: {s}")))?;
        key = key.wrapping_add(d);
    }

    Ok((key, cookie))
}

/// Encodes 12 bytes (`Key` big-endian ‖ `Cookie` big-endian) as hex and strips
/// leading `0x00` bytes, but never strips to an empty string.
pub fn format_needle_id(key: NeedleKey, cookie: Cookie) -> String {
    let mut buf = [0u8; 12];
    buf[0..8].copy_from_slice(&key.to_be_bytes());
    buf[8..12].copy_from_slice(&cookie.to_be_bytes());

    let nonzero = buf.iter().position(|&b| b != 0).unwrap_or(buf.len() - 1);
    hex::encode(&buf[nonzero..])
}

/// Accepts either `,` or `/` between volume id and needle id.
pub fn parse_file_id(s: &str) -> Result<FileId, StoreError> {
    let sep = if s.contains(',') { ',' } else { '/' };
    let mut parts = s.splitn(2, sep);
    let vid_str = parts
        .next()
        .ok_or_else(|| StoreError::InvalidId(s.to_string()))?;
    let nid_str = parts
        .next()
        .ok_or_else(|| StoreError::InvalidId(s.to_string()))?;

    let volume_id = parse_volume_id(vid_str)?;
    let (key, cookie) = parse_needle_id(nid_str)?;
    Ok(FileId { volume_id, key, cookie })
}

/// Minimal hex encoder so the crate does not need a whole `hex` dependency for
/// this one call site.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            out.push(DIGITS[(b >> 4) as usize] as char);
            out.push(DIGITS[(b & 0x0f) as usize] as char);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_needle_id_examples() {
        assert_eq!(parse_needle_id("4ed4c8116e41").unwrap(), (0x4ed4, 0xc8116e41));
        assert_eq!(parse_needle_id("4ed4c8116e41_5").unwrap(), (0x4ed9, 0xc8116e41));
        assert_eq!(parse_needle_id("4ed401116e41").unwrap(), (0x4ed4, 0x01116e41));
        assert_eq!(parse_needle_id("ed400116e41").unwrap(), (0xed4, 0x00116e41));
        assert_eq!(
            parse_needle_id("fed4c8114ed4c811f0116e41_1").unwrap(),
            (0xfed4c8114ed4c812, 0xf0116e41)
        );
        assert!(parse_needle_id("4ed4c811").is_err());
        assert!(parse_needle_id("4ed4c8114ed4c8114ed4c8111").is_err());
    }

    #[test]
    fn round_trip_id() {
        // (0, 0) is excluded: its 12-byte encoding strips down to a single
        // zero byte ("00"), which is below the 9-nibble minimum and is
        // covered separately by `format_never_strips_to_empty`.
        for (key, cookie) in [(1u64, 1u32), (0x4ed4, 0xc8116e41), (u64::MAX, u32::MAX)] {
            let s = format_needle_id(key, cookie);
            assert_eq!(parse_needle_id(&s).unwrap(), (key, cookie));
        }
    }

    #[test]
    fn delta_addition() {
        let s = format_needle_id(0x4ed4, 0xc8116e41);
        let with_delta = format!("{s}_5");
        assert_eq!(parse_needle_id(&with_delta).unwrap(), (0x4ed9, 0xc8116e41));
    }

    #[test]
    fn length_bounds() {
        assert!(parse_needle_id("1").is_err());
        assert!(parse_needle_id(&"f".repeat(25)).is_err());
        assert!(parse_needle_id(&"f".repeat(24)).is_ok());
        assert!(parse_needle_id(&"f".repeat(9)).is_ok());
    }

    #[test]
    fn format_never_strips_to_empty() {
        assert_eq!(format_needle_id(0, 0), "00");
    }

    #[test]
    fn file_id_accepts_both_separators() {
        let a = parse_file_id("7,4ed4c8116e41").unwrap();
        let b = parse_file_id("7/4ed4c8116e41").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.volume_id, 7);
        assert_eq!(a.to_string(), "7,4ed4c8116e41");
    }
}
