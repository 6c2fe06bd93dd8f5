//! Volume superblock: version, collection tag, replica policy, default TTL,
//! and the `CompactRevision` counter bumped on each compaction.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Result, StoreError};
use crate::needle::Ttl;

const MAGIC: &[u8; 4] = b"HYV2";
const FORMAT_VERSION: u8 = 2;
const FIXED_PART_LEN: usize = 4 + 1 + 1 + 2 + 2 + 1; // magic,version,replica,ttl,revision,collection_len

pub struct Superblock {
    pub replica_placement: u8,
    pub default_ttl: Ttl,
    pub compact_revision: u16,
    pub collection: String,
}

impl Superblock {
    pub fn new(collection: String) -> Superblock {
        Superblock {
            replica_placement: 0,
            default_ttl: Ttl { unit: 0, count: 0 },
            compact_revision: 0,
            collection,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let len = FIXED_PART_LEN + self.collection.len();
        len + padding_for(len)
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        if self.collection.len() > 255 {
            return Err(StoreError::Corrupt("collection name too long".into()));
        }

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(self.replica_placement);
        buf.push(self.default_ttl.unit);
        buf.push(self.default_ttl.count);
        {
            let mut cursor = Cursor::new(&mut buf);
            cursor.set_position((4 + 1 + 1 + 2) as u64);
            cursor.write_u16::<BigEndian>(self.compact_revision)?;
        }
        buf.push(self.collection.len() as u8);
        buf.extend_from_slice(self.collection.as_bytes());

        let pad = padding_for(buf.len());
        buf.resize(buf.len() + pad, 0);

        w.write_all(&buf)?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Superblock> {
        let mut fixed = [0u8; FIXED_PART_LEN];
        r.read_exact(&mut fixed)?;

        if &fixed[0..4] != MAGIC {
            return Err(StoreError::Corrupt("bad superblock magic".into()));
        }
        let version = fixed[4];
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported superblock version {version}"
            )));
        }
        let replica_placement = fixed[5];
        let default_ttl = Ttl { unit: fixed[6], count: fixed[7] };
        let compact_revision = (&fixed[8..10]).read_u16::<BigEndian>()?;
        let collection_len = fixed[10] as usize;

        let mut collection_buf = vec![0u8; collection_len];
        r.read_exact(&mut collection_buf)?;
        let collection = String::from_utf8(collection_buf)
            .map_err(|_| StoreError::Corrupt("collection name not utf8".into()))?;

        let unpadded = FIXED_PART_LEN + collection_len;
        let pad = padding_for(unpadded);
        if pad > 0 {
            let mut discard = [0u8; 8];
            r.read_exact(&mut discard[..pad])?;
        }

        Ok(Superblock {
            replica_placement,
            default_ttl,
            compact_revision,
            collection,
        })
    }
}

fn padding_for(len: usize) -> usize {
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
    fn round_trip() {
        let sb = Superblock {
            replica_placement: 1,
            default_ttl: Ttl { unit: 3, count: 7 },
            compact_revision: 42,
            collection: "photos".to_string(),
        };
        let mut buf = Vec::new();
        sb.write(&mut buf).unwrap();
        assert_eq!(buf.len() % 8, 0);

        let mut cur = Cursor::new(&buf);
        let back = Superblock::read(&mut cur).unwrap();
        assert_eq!(back.replica_placement, 1);
        assert_eq!(back.default_ttl, Ttl { unit: 3, count: 7 });
        assert_eq!(back.compact_revision, 42);
        assert_eq!(back.collection, "photos");
    }
}
