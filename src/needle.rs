//! The on-disk needle record (version 2).
//!
//! Layout, all multi-byte integers big-endian:
//!
//! ```text
//! Header (16 bytes, fixed):
//!   Cookie       u32
//!   Key          u64
//!   Size         u32   -- byte length of the body, DataSize..Ttl inclusive
//! Body (variable):
//!   DataSize     u32
//!   Data         DataSize bytes
//!   Flags        u8
//!   NameSize     u8        (iff Flags & HAS_NAME)
//!   Name         NameSize bytes (iff Flags & HAS_NAME)
//!   MimeSize     u8        (iff Flags & HAS_MIME)
//!   Mime         MimeSize bytes (iff Flags & HAS_MIME)
//!   LastModified 5 bytes   (iff Flags & HAS_LAST_MODIFIED)
//!   Ttl          2 bytes   (iff Flags & HAS_TTL)
//! Trailer:
//!   Checksum     u32  -- CRC32 of Data
//!   Padding      zeros so total record length is a multiple of 8
//! ```

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Result, StoreError};
use crate::id::{Cookie, NeedleKey};

pub const HEADER_SIZE: u64 = 16;
const CHECKSUM_SIZE: u64 = 4;

pub const FLAG_HAS_NAME: u8 = 0x01;
pub const FLAG_HAS_MIME: u8 = 0x02;
pub const FLAG_HAS_LAST_MODIFIED: u8 = 0x04;
pub const FLAG_HAS_TTL: u8 = 0x08;
pub const FLAG_GZIPPED: u8 = 0x10;
pub const FLAG_IS_CHUNK_MANIFEST: u8 = 0x20;

/// Unit byte + count byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl {
    pub unit: u8,
    pub count: u8,
}

/// One needle, fully materialized in memory.
#[derive(Debug, Clone)]
pub struct Needle {
    pub cookie: Cookie,
    pub key: NeedleKey,
    pub data: Vec<u8>,
    pub flags: u8,
    pub name: Option<Vec<u8>>,
    pub mime: Option<Vec<u8>>,
    pub last_modified: Option<u64>,
    pub ttl: Option<Ttl>,
}

impl Needle {
    pub fn new(key: NeedleKey, cookie: Cookie, data: Vec<u8>) -> Needle {
        Needle {
            cookie,
            key,
            data,
            flags: 0,
            name: None,
            mime: None,
            last_modified: None,
            ttl: None,
        }
    }

    pub fn with_name(mut self, name: Vec<u8>) -> Needle {
        assert!(name.len() <= 255, "Name must be bounded by 255 bytes");
        self.flags |= FLAG_HAS_NAME;
        self.name = Some(name);
        self
    }

    pub fn with_mime(mut self, mime: Vec<u8>) -> Needle {
        assert!(mime.len() <= 255, "Mime must be bounded by 255 bytes");
        self.flags |= FLAG_HAS_MIME;
        self.mime = Some(mime);
        self
    }

    pub fn with_last_modified(mut self, unix_secs: u64) -> Needle {
        self.flags |= FLAG_HAS_LAST_MODIFIED;
        self.last_modified = Some(unix_secs);
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Needle {
        self.flags |= FLAG_HAS_TTL;
        self.ttl = Some(ttl);
        self
    }

    pub fn gzipped(mut self, yes: bool) -> Needle {
        if yes {
            self.flags |= FLAG_GZIPPED;
        } else {
            self.flags &= !FLAG_GZIPPED;
        }
        self
    }

    pub fn chunk_manifest(mut self, yes: bool) -> Needle {
        if yes {
            self.flags |= FLAG_IS_CHUNK_MANIFEST;
        } else {
            self.flags &= !FLAG_IS_CHUNK_MANIFEST;
        }
        self
    }

    pub fn is_gzipped(&self) -> bool {
        self.flags & FLAG_GZIPPED != 0
    }

    pub fn is_chunk_manifest(&self) -> bool {
        self.flags & FLAG_IS_CHUNK_MANIFEST != 0
    }

    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    /// Byte length of the body (`DataSize`..`Ttl` inclusive).
    fn body_len(&self) -> u64 {
        let mut n = 4 + self.data.len() as u64 + 1; // DataSize + Data + Flags
        if self.flags & FLAG_HAS_NAME != 0 {
            n += 1 + self.name.as_ref().map_or(0, |v| v.len() as u64);
        }
        if self.flags & FLAG_HAS_MIME != 0 {
            n += 1 + self.mime.as_ref().map_or(0, |v| v.len() as u64);
        }
        if self.flags & FLAG_HAS_LAST_MODIFIED != 0 {
            n += 5;
        }
        if self.flags & FLAG_HAS_TTL != 0 {
            n += 2;
        }
        n
    }

    /// Total on-disk length including header, body, checksum, and padding.
    pub fn record_len(&self) -> u64 {
        let unpadded = HEADER_SIZE + self.body_len() + CHECKSUM_SIZE;
        unpadded + padding_for(unpadded)
    }

    /// Serializes the needle, computing its checksum and trailing padding so
    /// the emitted length is a multiple of 8.
    pub fn write(&self, w: &mut impl Write) -> Result<u64> {
        let body_len = self.body_len();
        if body_len > u32::MAX as u64 {
            return Err(StoreError::Corrupt("needle body too large".into()));
        }

        w.write_u32::<BigEndian>(self.cookie)?;
        w.write_u64::<BigEndian>(self.key)?;
        w.write_u32::<BigEndian>(body_len as u32)?;

        w.write_u32::<BigEndian>(self.data.len() as u32)?;
        w.write_all(&self.data)?;
        w.write_u8(self.flags)?;

        if self.flags & FLAG_HAS_NAME != 0 {
            let name = self.name.as_deref().unwrap_or(&[]);
            w.write_u8(name.len() as u8)?;
            w.write_all(name)?;
        }
        if self.flags & FLAG_HAS_MIME != 0 {
            let mime = self.mime.as_deref().unwrap_or(&[]);
            w.write_u8(mime.len() as u8)?;
            w.write_all(mime)?;
        }
        if self.flags & FLAG_HAS_LAST_MODIFIED != 0 {
            let lm = self.last_modified.unwrap_or(0);
            let bytes = lm.to_be_bytes();
            w.write_all(&bytes[3..8])?; // low 5 bytes, big-endian
        }
        if self.flags & FLAG_HAS_TTL != 0 {
            let ttl = self.ttl.unwrap_or(Ttl { unit: 0, count: 0 });
            w.write_u8(ttl.unit)?;
            w.write_u8(ttl.count)?;
        }

        w.write_u32::<BigEndian>(self.checksum())?;

        let unpadded = HEADER_SIZE + body_len + CHECKSUM_SIZE;
        let pad = padding_for(unpadded);
        if pad > 0 {
            w.write_all(&[0u8; 8][..pad as usize])?;
        }

        Ok(unpadded + pad)
    }

    /// Parses a needle out of exactly `record_len` bytes read from `r`
    /// (the caller already knows the record's size from the index). Verifies
    /// that the stored `Size` is self-consistent and that the checksum
    /// matches; otherwise returns `StoreError::Corrupt`/`ChecksumMismatch`.
    pub fn read(r: &mut impl Read, max_record_len: u64) -> Result<Needle> {
        let cookie = r.read_u32::<BigEndian>()?;
        let key = r.read_u64::<BigEndian>()?;
        let size = r.read_u32::<BigEndian>()? as u64;

        if HEADER_SIZE + size + CHECKSUM_SIZE > max_record_len {
            return Err(StoreError::Corrupt(
                "needle size would overflow its record".into(),
            ));
        }

        let mut body = vec![0u8; size as usize];
        r.read_exact(&mut body)?;
        let mut cursor = io::Cursor::new(&body);

        let data_size = cursor.read_u32::<BigEndian>()? as usize;
        if 4 + data_size > body.len() {
            return Err(StoreError::Corrupt("DataSize exceeds body".into()));
        }
        let mut data = vec![0u8; data_size];
        cursor.read_exact(&mut data)?;
        let flags = cursor.read_u8()?;

        let name = if flags & FLAG_HAS_NAME != 0 {
            let n = cursor.read_u8()? as usize;
            let mut buf = vec![0u8; n];
            cursor.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        let mime = if flags & FLAG_HAS_MIME != 0 {
            let n = cursor.read_u8()? as usize;
            let mut buf = vec![0u8; n];
            cursor.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        let last_modified = if flags & FLAG_HAS_LAST_MODIFIED != 0 {
            let mut buf = [0u8; 8];
            cursor.read_exact(&mut buf[3..8])?;
            Some(u64::from_be_bytes(buf))
        } else {
            None
        };

        let ttl = if flags & FLAG_HAS_TTL != 0 {
            let unit = cursor.read_u8()?;
            let count = cursor.read_u8()?;
            Some(Ttl { unit, count })
        } else {
            None
        };

        let checksum = r.read_u32::<BigEndian>()?;

        let unpadded = HEADER_SIZE + size + CHECKSUM_SIZE;
        let pad = padding_for(unpadded);
        if pad > 0 {
            let mut discard = [0u8; 8];
            r.read_exact(&mut discard[..pad as usize])?;
        }

        let needle = Needle {
            cookie,
            key,
            data,
            flags,
            name,
            mime,
            last_modified,
            ttl,
        };

        if needle.checksum() != checksum {
            return Err(StoreError::ChecksumMismatch);
        }

        Ok(needle)
    }

    /// Builds the tombstone record written by delete:
    /// `Size == 0xFFFFFFFF`, no data.
    pub fn write_tombstone(key: NeedleKey, cookie: Cookie, w: &mut impl Write) -> Result<u64> {
        w.write_u32::<BigEndian>(cookie)?;
        w.write_u64::<BigEndian>(key)?;
        w.write_u32::<BigEndian>(TOMBSTONE_SIZE)?;
        Ok(HEADER_SIZE)
    }
}

/// Sentinel stored in the `Size` header field for a deleted needle.
pub const TOMBSTONE_SIZE: u32 = 0xFFFF_FFFF;

/// The fixed 16-byte header, read on its own so a volume scan can tell a
/// tombstone (`size == TOMBSTONE_SIZE`) from a live record before deciding
/// whether to read a body at all.
#[derive(Debug, Clone, Copy)]
pub struct NeedleHeader {
    pub cookie: Cookie,
    pub key: NeedleKey,
    pub size: u32,
}

impl NeedleHeader {
    pub fn read(r: &mut impl Read) -> Result<NeedleHeader> {
        let cookie = r.read_u32::<BigEndian>()?;
        let key = r.read_u64::<BigEndian>()?;
        let size = r.read_u32::<BigEndian>()?;
        Ok(NeedleHeader { cookie, key, size })
    }

    pub fn is_tombstone(&self) -> bool {
        self.size == TOMBSTONE_SIZE
    }

    /// Total on-disk length of the record this header describes (header +
    /// body + checksum + padding), or just the header for a tombstone.
    pub fn record_len(&self) -> u64 {
        if self.is_tombstone() {
            return HEADER_SIZE;
        }
        let unpadded = HEADER_SIZE + self.size as u64 + CHECKSUM_SIZE;
        unpadded + padding_for(unpadded)
    }
}

fn padding_for(len: u64) -> u64 {
    let rem = len % 8;
    if rem == 0 {
        0
    } else {
        8 - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let n = Needle::new(0x4ed4, 0xc8116e41, b"hello".to_vec());
        let mut buf = Vec::new();
        let written = n.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, written);
        assert_eq!(written % 8, 0, "padding invariant");

        let mut cur = io::Cursor::new(&buf);
        let read_back = Needle::read(&mut cur, written).unwrap();
        assert_eq!(read_back.data, b"hello");
        assert_eq!(read_back.key, 0x4ed4);
        assert_eq!(read_back.cookie, 0xc8116e41);
    }

    #[test]
    fn round_trip_with_all_optional_fields() {
        let n = Needle::new(7, 42, b"some bytes".to_vec())
            .with_name(b"hi.txt".to_vec())
            .with_mime(b"text/plain".to_vec())
            .with_last_modified(1_700_000_000)
            .with_ttl(Ttl { unit: 1, count: 3 })
            .gzipped(true);

        let mut buf = Vec::new();
        let written = n.write(&mut buf).unwrap();
        let mut cur = io::Cursor::new(&buf);
        let back = Needle::read(&mut cur, written).unwrap();

        assert_eq!(back.name.as_deref(), Some(&b"hi.txt"[..]));
        assert_eq!(back.mime.as_deref(), Some(&b"text/plain"[..]));
        assert_eq!(back.last_modified, Some(1_700_000_000));
        assert_eq!(back.ttl, Some(Ttl { unit: 1, count: 3 }));
        assert!(back.is_gzipped());
    }

    #[test]
    fn checksum_mismatch_detected() {
        let n = Needle::new(1, 1, b"data".to_vec());
        let mut buf = Vec::new();
        let written = n.write(&mut buf).unwrap();

        // Corrupt a data byte without touching the stored checksum.
        let data_byte_offset = (HEADER_SIZE + 4) as usize; // after Cookie/Key/Size/DataSize
        buf[data_byte_offset] ^= 0xff;

        let mut cur = io::Cursor::new(&buf);
        let err = Needle::read(&mut cur, written).unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch));
    }

    #[test]
    fn padding_always_multiple_of_eight() {
        for len in 0..40usize {
            let n = Needle::new(1, 1, vec![0u8; len]);
            let mut buf = Vec::new();
            let written = n.write(&mut buf).unwrap();
            assert_eq!(written % 8, 0);
            assert_eq!(buf.len() as u64, n.record_len());
        }
    }
}
