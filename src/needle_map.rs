//! In-memory needle map and its on-disk `.idx` representation: a dense
//! sequence of `(key, offset_padded, size)` tuples, replayed in order on
//! open, where `offset_padded == 0` marks a tombstone.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::Result;
use crate::id::NeedleKey;

pub const INDEX_ENTRY_SIZE: u64 = 16;

/// `(offset_padded, size)` for one needle. `offset_padded == 0` means deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleIndexValue {
    pub offset_padded: u32,
    pub size: u32,
}

impl NeedleIndexValue {
    pub fn is_deleted(&self) -> bool {
        self.offset_padded == 0
    }

    pub fn offset_bytes(&self) -> u64 {
        self.offset_padded as u64 * 8
    }
}

/// The canonical live-lookup structure: `Key -> (offset_padded, size)`.
#[derive(Default)]
pub struct NeedleMap {
    entries: HashMap<NeedleKey, NeedleIndexValue>,
}

impl NeedleMap {
    pub fn new() -> NeedleMap {
        NeedleMap::default()
    }

    pub fn get(&self, key: NeedleKey) -> Option<NeedleIndexValue> {
        self.entries.get(&key).copied().filter(|v| !v.is_deleted())
    }

    /// Inserts/overwrites a live entry, returning the previous value if any
    /// (including tombstones, so callers can account for reclaimable space).
    pub fn set(&mut self, key: NeedleKey, value: NeedleIndexValue) -> Option<NeedleIndexValue> {
        self.entries.insert(key, value)
    }

    /// Marks `key` deleted by inserting a zero-offset tombstone entry,
    /// returning the previous value if the key existed and was live.
    pub fn delete(&mut self, key: NeedleKey) -> Option<NeedleIndexValue> {
        let prev = self
            .entries
            .insert(key, NeedleIndexValue { offset_padded: 0, size: 0 });
        prev.filter(|v| !v.is_deleted())
    }

    pub fn count(&self) -> usize {
        self.entries.values().filter(|v| !v.is_deleted()).count()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (NeedleKey, NeedleIndexValue)> + '_ {
        self.entries.iter().filter(|(_, v)| !v.is_deleted()).map(|(&k, &v)| (k, v))
    }

    /// Replays an on-disk `.idx` file from the start: later entries for a key
    /// win, `offset_padded == 0` deletes it.
    pub fn load_from_index(file: &File) -> Result<NeedleMap> {
        let mut map = NeedleMap::new();
        walk_index_file(file, |key, offset_padded, size| {
            if offset_padded == 0 {
                map.entries.insert(key, NeedleIndexValue { offset_padded: 0, size: 0 });
            } else {
                map.entries.insert(key, NeedleIndexValue { offset_padded, size });
            }
            Ok(())
        })?;
        Ok(map)
    }
}

/// Appends one `(key, offset_padded, size)` tuple to an open `.idx` file.
pub fn append_index_entry(
    w: &mut impl Write,
    key: NeedleKey,
    offset_padded: u32,
    size: u32,
) -> Result<()> {
    w.write_u64::<BigEndian>(key)?;
    w.write_u32::<BigEndian>(offset_padded)?;
    w.write_u32::<BigEndian>(size)?;
    Ok(())
}

/// Walks a `.idx` file's dense 16-byte tuples in order, calling `visit` for
/// each. A trailing partial tuple (from a crash mid-write) is ignored rather
/// than erroring, since the volume's recovery pass is responsible for
/// reconciling the tail against `.dat`.
pub fn walk_index_file<F>(file: &File, mut visit: F) -> Result<()>
where
    F: FnMut(NeedleKey, u32, u32) -> Result<()>,
{
    let mut reader = BufReader::new(file.try_clone()?);
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];

    loop {
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let mut cursor = std::io::Cursor::new(&buf);
        let key = cursor.read_u64::<BigEndian>()?;
        let offset_padded = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        visit(key, offset_padded, size)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn set_get_delete() {
        let mut m = NeedleMap::new();
        assert!(m.get(1).is_none());

        m.set(1, NeedleIndexValue { offset_padded: 10, size: 20 });
        assert_eq!(m.get(1), Some(NeedleIndexValue { offset_padded: 10, size: 20 }));
        assert_eq!(m.count(), 1);

        let prev = m.delete(1);
        assert_eq!(prev, Some(NeedleIndexValue { offset_padded: 10, size: 20 }));
        assert!(m.get(1).is_none());
        assert_eq!(m.count(), 0);
    }

    #[test]
    fn replay_last_entry_wins_and_zero_offset_deletes() {
        let mut f = tempfile::tempfile().unwrap();
        append_index_entry(&mut f, 1, 8, 100).unwrap();
        append_index_entry(&mut f, 2, 16, 50).unwrap();
        append_index_entry(&mut f, 1, 0, 0).unwrap(); // key 1 deleted
        append_index_entry(&mut f, 2, 32, 60).unwrap(); // key 2 updated
        f.seek(std::io::SeekFrom::Start(0)).unwrap();

        let map = NeedleMap::load_from_index(&f).unwrap();
        assert!(map.get(1).is_none());
        assert_eq!(map.get(2), Some(NeedleIndexValue { offset_padded: 32, size: 60 }));
        assert_eq!(map.count(), 1);
    }
}
