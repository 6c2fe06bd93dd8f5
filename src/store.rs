//! Aggregates the disk locations on this machine into one addressable
//! volume space, and falls back to a remote lookup for volumes it does not
//! hold locally.
//!
//! Routes reads, writes, and deletes across whichever `DiskLocation` holds
//! the target volume; a volume absent from every local location falls
//! through to the `NeedleFetcher` remote trait rather than a full
//! replication client.

use std::sync::Arc;

use crate::disk_location::DiskLocation;
use crate::errors::{Result, StoreError};
use crate::id::{Cookie, NeedleKey, VolumeId};
use crate::needle::Needle;
use crate::remote::NeedleFetcher;
use crate::volume::Volume;

/// The set of disk locations this process serves, plus an optional remote
/// fetcher for volumes that live elsewhere in the cluster.
pub struct Store {
    locations: Vec<DiskLocation>,
    remote: Option<Arc<dyn NeedleFetcher>>,
}

impl Store {
    pub fn new(locations: Vec<DiskLocation>) -> Store {
        Store { locations, remote: None }
    }

    pub fn with_remote(mut self, remote: Arc<dyn NeedleFetcher>) -> Store {
        self.remote = Some(remote);
        self
    }

    pub fn locations(&self) -> &[DiskLocation] {
        &self.locations
    }

    pub fn load_existing_volumes(&self) -> Result<()> {
        for loc in &self.locations {
            loc.load_existing()?;
        }
        Ok(())
    }

    /// Finds the volume locally across every disk location.
    pub fn find_volume(&self, vid: VolumeId) -> Option<Arc<Volume>> {
        self.locations.iter().find_map(|loc| loc.get(vid))
    }

    pub fn has_volume_locally(&self, vid: VolumeId) -> bool {
        self.locations.iter().any(|loc| loc.has(vid))
    }

    /// Reads a needle, trying every local disk location and falling back to
    /// the remote fetcher (if configured) only when no local copy exists.
    pub fn read_needle(&self, vid: VolumeId, key: NeedleKey, cookie: Cookie) -> Result<Needle> {
        if let Some(v) = self.find_volume(vid) {
            return v.read(key, cookie);
        }

        match &self.remote {
            Some(remote) => remote.fetch(vid, key, cookie),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn write_needle(&self, vid: VolumeId, needle: &Needle) -> Result<()> {
        let v = self.find_volume(vid).ok_or(StoreError::NotFound)?;
        v.append(needle)?;
        Ok(())
    }

    pub fn delete_needle(&self, vid: VolumeId, key: NeedleKey, cookie: Cookie) -> Result<u32> {
        let v = self.find_volume(vid).ok_or(StoreError::NotFound)?;
        v.delete(key, cookie)
    }

    /// Picks the disk location with the most free volume slots, for
    /// directing a new volume's creation. Returns `None` if every location
    /// this process manages is full.
    pub fn pick_location_for_new_volume(&self) -> Option<&DiskLocation> {
        self.locations
            .iter()
            .filter(|loc| loc.has_free_slot())
            .max_by_key(|loc| loc.free_slots())
    }
}
