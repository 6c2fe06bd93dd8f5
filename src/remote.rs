//! Narrow seams onto cluster concerns this engine does not implement itself:
//! master-node lookups and replication transport. A real deployment wires
//! these to whatever master-node client it has; this crate only needs to
//! call them.

use crate::errors::{Result, StoreError};
use crate::id::{Cookie, NeedleKey, VolumeId};
use crate::needle::Needle;

/// Resolves a volume id to the machines that hold it. Used by the HTTP read
/// surface to decide whether to serve a request locally, redirect, or proxy.
pub trait MasterLookup: Send + Sync {
    /// Public URLs (e.g. `http://10.0.0.4:8080`) of machines known to hold a
    /// replica of `vid`, most-preferred first. Empty if unknown.
    fn locate_volume(&self, vid: VolumeId) -> Vec<String>;
}

/// Fetches a needle that does not live on any disk location this process
/// manages.
pub trait NeedleFetcher: Send + Sync {
    fn fetch(&self, vid: VolumeId, key: NeedleKey, cookie: Cookie) -> Result<Needle>;
}

/// A `MasterLookup`/`NeedleFetcher` pair that knows about nothing, for
/// single-node deployments and tests.
pub struct NullMasterLookup;

impl MasterLookup for NullMasterLookup {
    fn locate_volume(&self, _vid: VolumeId) -> Vec<String> {
        Vec::new()
    }
}

impl NeedleFetcher for NullMasterLookup {
    fn fetch(&self, _vid: VolumeId, _key: NeedleKey, _cookie: Cookie) -> Result<Needle> {
        Err(StoreError::NotFound)
    }
}
