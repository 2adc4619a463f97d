//! Peer nodes.
//!
//! One [`Node`] exists per known peer (and one for the local node). The
//! mutable half — connection handle, generation, negotiated speed, feature
//! bits, identity maps — sits behind the per-node mutex, the last class in
//! the lock order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::lock_order::{LockClass, OrderedGuard, OrderedMutex};
use crate::network::PeerConn;
use crate::proto::{ConnectionSpeed, Opcode};
use crate::user_group::IdentityTables;

/// A peer daemon (or this node itself).
pub struct Node {
    pub id: u32,
    pub name: String,
    pub host_name: String,
    state: OrderedMutex<NodeState>,
}

/// Mutable per-node state, under the node mutex.
pub struct NodeState {
    /// Last connect attempt, throttling reconnect storms.
    pub last_connect: Option<Instant>,
    /// The live connection, if any.
    pub conn: Option<Arc<PeerConn>>,
    /// Bumped on every reconnect; requests carrying a stale generation are
    /// discarded.
    pub generation: u64,
    /// Link speed from the second auth stage.
    pub speed: ConnectionSpeed,
    /// Operations the peer answered with ENOSYS; calls short-circuit.
    pub disabled_ops: HashSet<Opcode>,
    /// Identity maps for ids arriving from / sent to this peer.
    pub identities: IdentityTables,
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("generation", &self.generation)
            .field("speed", &self.speed)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl Node {
    pub fn new(id: u32, name: String, host_name: String, identities: IdentityTables) -> Arc<Node> {
        Arc::new(Node {
            id,
            name,
            host_name,
            state: OrderedMutex::new(
                LockClass::Node,
                NodeState {
                    last_connect: None,
                    conn: None,
                    generation: 0,
                    speed: ConnectionSpeed::None,
                    disabled_ops: HashSet::new(),
                    identities,
                },
            ),
        })
    }

    pub fn lock_state(&self) -> OrderedGuard<'_, NodeState> {
        self.state.lock()
    }

    /// Install a fresh connection, bumping the generation.
    pub fn set_conn(&self, conn: Arc<PeerConn>) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.last_connect = Some(Instant::now());
        state.conn = Some(conn);
        state.generation
    }

    /// Drop the connection of `generation`; a newer connection stays.
    pub fn clear_conn(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.conn = None;
        }
    }

    /// The live connection, if the node is connected.
    pub fn conn(&self) -> Option<Arc<PeerConn>> {
        self.state.lock().conn.clone()
    }

    pub fn op_disabled(&self, opcode: Opcode) -> bool {
        self.state.lock().disabled_ops.contains(&opcode)
    }

    pub fn disable_op(&self, opcode: Opcode) {
        self.state.lock().disabled_ops.insert(opcode);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host_name", &self.host_name)
            .finish()
    }
}

/// Table of all known nodes. Registration happens at startup and during
/// peer authentication; lookups vastly dominate, so the table sits behind a
/// plain read-write lock outside the leveled classes.
#[derive(Default)]
pub struct NodeTable {
    by_id: RwLock<HashMap<u32, Arc<Node>>>,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable::default()
    }

    pub fn insert(&self, node: Arc<Node>) {
        self.by_id.write().insert(node.id, node);
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<Node>> {
        self.by_id.read().get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.by_id
            .read()
            .values()
            .find(|node| node.name == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.by_id.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTable")
            .field("nodes", &self.by_id.read().len())
            .finish()
    }
}
