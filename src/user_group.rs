//! Mapping between filesystem-wide and node-local user and group ids.
//!
//! Ids are opaque 32-bit tokens everywhere else in the daemon; this module
//! owns the per-peer and default translation tables. An incoming id with no
//! mapping falls back to the configured default; an outgoing id with no
//! mapping becomes the wildcard id.

use std::collections::HashMap;

use crate::proto::WILDCARD_ID;

/// One direction-pair of id translations.
#[derive(Debug, Default, Clone)]
pub struct IdMap {
    to_local: HashMap<u32, u32>,
    to_zfs: HashMap<u32, u32>,
}

impl IdMap {
    pub fn new() -> Self {
        IdMap::default()
    }

    /// Register a bidirectional pair.
    pub fn add(&mut self, zfs_id: u32, local_id: u32) {
        self.to_local.insert(zfs_id, local_id);
        self.to_zfs.insert(local_id, zfs_id);
    }

    /// Translate an id arriving from the wire into the local namespace,
    /// falling back to `default_id`.
    pub fn map_in(&self, zfs_id: u32, default_id: u32) -> u32 {
        self.to_local.get(&zfs_id).copied().unwrap_or(default_id)
    }

    /// Translate a local id for the wire, falling back to the wildcard.
    pub fn map_out(&self, local_id: u32) -> u32 {
        self.to_zfs.get(&local_id).copied().unwrap_or(WILDCARD_ID)
    }
}

/// Default uid/gid tables plus the configured fallback identities.
#[derive(Debug, Clone)]
pub struct IdentityTables {
    pub uid: IdMap,
    pub gid: IdMap,
    pub default_uid: u32,
    pub default_gid: u32,
}

impl IdentityTables {
    pub fn new(default_uid: u32, default_gid: u32) -> Self {
        IdentityTables {
            uid: IdMap::new(),
            gid: IdMap::new(),
            default_uid,
            default_gid,
        }
    }

    pub fn uid_in(&self, zfs_uid: u32) -> u32 {
        self.uid.map_in(zfs_uid, self.default_uid)
    }

    pub fn gid_in(&self, zfs_gid: u32) -> u32 {
        self.gid.map_in(zfs_gid, self.default_gid)
    }

    pub fn uid_out(&self, local_uid: u32) -> u32 {
        self.uid.map_out(local_uid)
    }

    pub fn gid_out(&self, local_gid: u32) -> u32 {
        self.gid.map_out(local_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_ids_translate_both_ways() {
        let mut tables = IdentityTables::new(65534, 65533);
        tables.uid.add(500, 1000);
        assert_eq!(tables.uid_in(500), 1000);
        assert_eq!(tables.uid_out(1000), 500);
    }

    #[test]
    fn unmapped_incoming_falls_back_to_default() {
        let tables = IdentityTables::new(65534, 65533);
        assert_eq!(tables.uid_in(42), 65534);
        assert_eq!(tables.gid_in(42), 65533);
    }

    #[test]
    fn unmapped_outgoing_becomes_wildcard() {
        let tables = IdentityTables::new(65534, 65533);
        assert_eq!(tables.uid_out(1000), WILDCARD_ID);
        assert_eq!(tables.gid_out(1000), WILDCARD_ID);
    }
}
