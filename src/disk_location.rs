//! A directory holding zero or more volumes, discovered on startup and
//! tracked by id under a single reader/writer lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::errors::{Result, StoreError};
use crate::id::VolumeId;
use crate::volume::Volume;

pub struct DiskLocation {
    directory: PathBuf,
    max_volume_count: usize,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
}

impl DiskLocation {
    pub fn new(directory: PathBuf, max_volume_count: usize) -> DiskLocation {
        DiskLocation {
            directory,
            max_volume_count,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Scans `directory` for `[<collection>_]<vid>.dat` files and opens each
    /// one not already tracked.
    pub fn load_existing(&self) -> Result<()> {
        let read_dir = match std::fs::read_dir(&self.directory) {
            Ok(it) => it,
            Err(e) => return Err(StoreError::Io(e)),
        };

        for entry in read_dir {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            let Some(base) = name.strip_suffix(".dat") else {
                continue;
            };

            let (collection, vid_str) = match base.rfind('_') {
                Some(i) if i > 0 => (base[..i].to_string(), &base[i + 1..]),
                _ => (String::new(), base),
            };

            let vid: VolumeId = match vid_str.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };

            if self.has(vid) {
                continue;
            }

            let dat_path = self.directory.join(name);
            let idx_path = self.directory.join(format!("{base}.idx"));
            match Volume::open(dat_path, idx_path, vid) {
                Ok(v) => {
                    tracing::info!(
                        volume_id = vid,
                        collection = %collection,
                        size = v.size(),
                        "loaded existing volume"
                    );
                    self.add(vid, Arc::new(v));
                }
                Err(e) => {
                    tracing::warn!(volume_id = vid, error = %e, "failed to open volume");
                }
            }
        }

        tracing::info!(
            directory = %self.directory.display(),
            volumes = self.count(),
            max = self.max_volume_count,
            "disk location ready"
        );
        Ok(())
    }

    pub fn add(&self, vid: VolumeId, v: Arc<Volume>) {
        self.volumes.write().unwrap().insert(vid, v);
    }

    pub fn delete(&self, vid: VolumeId) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap();
        if let Some(v) = volumes.remove(&vid) {
            v.destroy()?;
        }
        Ok(())
    }

    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap();
        let doomed: Vec<VolumeId> = volumes
            .iter()
            .filter(|(_, v)| v.collection() == collection)
            .map(|(&vid, _)| vid)
            .collect();
        for vid in doomed {
            if let Some(v) = volumes.remove(&vid) {
                v.destroy()?;
            }
        }
        Ok(())
    }

    pub fn has(&self, vid: VolumeId) -> bool {
        self.volumes.read().unwrap().contains_key(&vid)
    }

    pub fn get(&self, vid: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().unwrap().get(&vid).cloned()
    }

    pub fn count(&self) -> usize {
        self.volumes.read().unwrap().len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.count() < self.max_volume_count
    }

    pub fn free_slots(&self) -> usize {
        self.max_volume_count.saturating_sub(self.count())
    }

    pub fn close_all(&self) -> Result<()> {
        for v in self.volumes.read().unwrap().values() {
            v.close()?;
        }
        Ok(())
    }

    /// Calls `visit` for every currently-tracked volume. Must not add or
    /// remove volumes from within `visit`.
    pub fn walk(&self, mut visit: impl FnMut(&Arc<Volume>) -> Result<()>) -> Result<()> {
        for v in self.volumes.read().unwrap().values() {
            visit(v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::needle::Needle;
    use tempfile::tempdir;

    #[test]
    fn load_existing_discovers_collection_prefixed_volume() {
        let dir = tempdir().unwrap();
        {
            let dat = dir.path().join("photos_7.dat");
            let idx = dir.path().join("photos_7.idx");
            let v = Volume::create(dat, idx, 7, "photos".to_string()).unwrap();
            v.append(&Needle::new(1, 1, b"x".to_vec())).unwrap();
        }

        let loc = DiskLocation::new(dir.path().to_path_buf(), 8);
        loc.load_existing().unwrap();

        assert!(loc.has(7));
        assert_eq!(loc.count(), 1);
        assert_eq!(loc.get(7).unwrap().collection(), "photos");
    }

    #[test]
    fn delete_removes_files_and_tracking() {
        let dir = tempdir().unwrap();
        let dat = dir.path().join("9.dat");
        let idx = dir.path().join("9.idx");
        let loc = DiskLocation::new(dir.path().to_path_buf(), 8);
        loc.add(9, Arc::new(Volume::create(dat.clone(), idx.clone(), 9, String::new()).unwrap()));

        loc.delete(9).unwrap();
        assert!(!loc.has(9));
        assert!(!dat.exists());
        assert!(!idx.exists());
    }
}
