//! Chunk manifests: large files split across multiple needles, stitched back
//! together on read.
//!
//! A needle flagged as a chunk manifest stores a JSON document describing the
//! ordered list of chunks (each its own `FileId` plus offset and size) rather
//! than the file's bytes directly; reads detect the flag, load the manifest,
//! and serve byte ranges by walking its chunk list.

use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::id::parse_file_id;
use crate::needle::Needle;
use crate::store::Store;

/// One piece of a chunked file: the needle holding its bytes, its offset in
/// the logical file, and its length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub fid: String,
    pub offset: u64,
    pub size: u64,
}

/// The JSON body stored in a needle flagged `FLAG_IS_CHUNK_MANIFEST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub name: Option<String>,
    pub mime: Option<String>,
    pub size: u64,
    pub chunks: Vec<ChunkEntry>,
}

impl ChunkManifest {
    pub fn from_needle(needle: &Needle) -> Result<ChunkManifest> {
        if !needle.is_chunk_manifest() {
            return Err(StoreError::Corrupt("not a chunk manifest needle".into()));
        }
        serde_json::from_slice(&needle.data)
            .map_err(|e| StoreError::Corrupt(format!("bad chunk manifest: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Corrupt(format!("{e}")))
    }
}

/// Materializes `len` bytes starting at `start` from a chunk manifest's
/// needles, fetched through `store`. Chunks are assumed contiguous and
/// sorted by `offset`, matching how `append_chunks` builds them.
pub struct ChunkedFileReader<'a> {
    store: &'a Store,
    chunks: &'a [ChunkEntry],
    position: u64,
    next_chunk: usize,
    current: Option<Cursor<Vec<u8>>>,
}

impl<'a> ChunkedFileReader<'a> {
    pub fn new(store: &'a Store, manifest: &'a ChunkManifest, start: u64) -> Result<ChunkedFileReader<'a>> {
        let chunks = &manifest.chunks;
        let next_chunk = chunks
            .iter()
            .position(|c| start < c.offset + c.size)
            .unwrap_or(chunks.len());

        Ok(ChunkedFileReader {
            store,
            chunks,
            position: start,
            next_chunk,
            current: None,
        })
    }

    fn load_chunk(&mut self, index: usize) -> Result<Cursor<Vec<u8>>> {
        let chunk = &self.chunks[index];
        let file_id = parse_file_id(&chunk.fid)?;
        let needle = self.store.read_needle(file_id.volume_id, file_id.key, file_id.cookie)?;

        let skip = self.position.saturating_sub(chunk.offset) as usize;
        let mut cursor = Cursor::new(needle.data);
        cursor.set_position(skip as u64);
        Ok(cursor)
    }
}

impl<'a> Read for ChunkedFileReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                let n = cursor.read(buf)?;
                if n > 0 {
                    self.position += n as u64;
                    return Ok(n);
                }
                self.current = None;
                self.next_chunk += 1;
            }

            if self.next_chunk >= self.chunks.len() {
                return Ok(0);
            }

            let cursor = self
                .load_chunk(self.next_chunk)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.current = Some(cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = ChunkManifest {
            name: Some("movie.mp4".into()),
            mime: Some("video/mp4".into()),
            size: 30,
            chunks: vec![
                ChunkEntry { fid: "1,01".into(), offset: 0, size: 10 },
                ChunkEntry { fid: "1,02".into(), offset: 10, size: 20 },
            ],
        };
        let json = manifest.to_json().unwrap();
        let back: ChunkManifest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.chunks.len(), 2);
        assert_eq!(back.size, 30);
    }

    #[test]
    fn from_needle_rejects_non_manifest() {
        let n = Needle::new(1, 1, b"plain data".to_vec());
        assert!(ChunkManifest::from_needle(&n).is_err());
    }
}
