//! Zlomek FS userspace daemon.
//!
//! The daemon exports a POSIX-like filesystem assembled from volumes to a
//! local kernel client (over a character device) and to peer daemons (over
//! a framed binary RPC protocol). This crate is the daemon runtime: the
//! wire codec, the per-volume metadata store, the in-memory object graph
//! with its locking discipline, the worker pools, and the operation
//! dispatch shared by both transports.

#![warn(missing_debug_implementations, rust_2018_idioms)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

pub mod codec;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod fh;
pub mod hardlink;
pub mod hashfile;
pub mod interval;
pub mod journal;
pub mod kernel_channel;
pub mod lock_order;
pub mod metadata;
pub mod network;
pub mod node;
pub mod ops;
pub mod proto;
pub mod user_group;
pub mod virtual_dir;
pub mod volume;
pub mod worker;

pub use crate::codec::{CodecError, DataCoder, FrameReader};
pub use crate::config::Config;
pub use crate::proto::{Fattr, Opcode, ZfsCap, ZfsError, ZfsFh, ZfsResult};

use crate::fh::FhTables;
use crate::node::{Node, NodeTable};
use crate::user_group::IdentityTables;
use crate::virtual_dir::VirtualTree;
use crate::volume::{Volume, VolumeTable};

/// The daemon's shared state: every table of the object model, built in
/// dependency order at startup and dropped in reverse at shutdown.
#[derive(Debug)]
pub struct Runtime {
    pub config: Config,
    pub this_node: Arc<Node>,
    pub nodes: NodeTable,
    pub volumes: VolumeTable,
    pub vtree: VirtualTree,
    pub tables: FhTables,
    running: AtomicBool,
    rpc_counter: AtomicU64,
}

impl Runtime {
    pub fn new(config: Config) -> io::Result<Arc<Runtime>> {
        let identities = IdentityTables::new(config.default_uid, config.default_gid);

        let this_node = Node::new(
            config.node_id,
            config.node_name.clone(),
            config.host_name.clone(),
            identities.clone(),
        );
        let nodes = NodeTable::new();
        nodes.insert(this_node.clone());
        for peer in &config.nodes {
            nodes.insert(Node::new(
                peer.id,
                peer.name.clone(),
                peer.host.clone(),
                identities.clone(),
            ));
        }

        let volumes = VolumeTable::new();
        let vtree = VirtualTree::new();
        for declared in &config.volumes {
            let volume = Volume::new(
                declared.id,
                declared.name.clone(),
                declared.mountpoint.clone(),
                declared.master_id,
                declared.local_path.clone(),
                declared.size_limit,
            );
            volume.init_metadata(config.metadata_tree_depth)?;
            vtree
                .mount(&declared.mountpoint, declared.id)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            volumes.insert(volume);
            info!(
                "volume {} ({}) mounted at {}",
                declared.id, declared.name, declared.mountpoint
            );
        }

        Ok(Arc::new(Runtime {
            config,
            this_node,
            nodes,
            volumes,
            vtree,
            tables: FhTables::new(),
            running: AtomicBool::new(true),
            rpc_counter: AtomicU64::new(0),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the soft shutdown flag; suspension points observe it and
    /// return `EXITING` at their next wake.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
        }
    }

    /// Count one outgoing peer request.
    pub fn note_rpc(&self) {
        self.rpc_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of outgoing peer requests so far.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_counter.load(Ordering::Relaxed)
    }

    /// The volume a file handle lives on.
    pub fn volume_of(&self, fh: &ZfsFh) -> Option<Arc<Volume>> {
        self.volumes.by_id(fh.vid)
    }

    /// The node mastering `volume`.
    pub fn master_of(&self, volume: &Volume) -> Option<Arc<Node>> {
        self.nodes.by_id(volume.master_id)
    }
}
