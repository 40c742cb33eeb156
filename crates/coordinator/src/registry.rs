//! Node registry
//!
//! Owns every known node. The map itself sits behind a read/write lock that
//! is only taken to look up, insert or remove entries; each node carries its
//! own mutex, and every mutation of a node (counters included) happens under
//! that mutex. Locks are synchronous and are never held across an `.await`.

use crate::node::{Node, NodeDescriptor, NodeResources, NodeStatus};
use nodemesh_common::error::{MeshError, Result};
use nodemesh_common::METRICS;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared handle to one node's state and its lock
pub type NodeHandle = Arc<Mutex<Node>>;

/// Registry of compute nodes
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeHandle>>,
    local_node_id: String,
}

impl NodeRegistry {
    /// Create a registry containing the local node, online
    pub fn new(local: NodeDescriptor) -> Self {
        let local_node_id = local.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local_node_id.clone(), Arc::new(Mutex::new(Node::new(local))));

        info!(node_id = %local_node_id, "Registered local node");

        let registry = Self {
            nodes: RwLock::new(nodes),
            local_node_id,
        };
        registry.refresh_gauges();
        registry
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn is_local(&self, node_id: &str) -> bool {
        self.local_node_id == node_id
    }

    /// Insert a node, or replace the identity of a known one
    ///
    /// Replacing keeps the node's lock and its task counters, so in-flight
    /// tasks still settle against the right entry. The node comes back online.
    pub fn register(&self, descriptor: NodeDescriptor) -> Node {
        let existing = self.handle(&descriptor.id);

        let snapshot = match existing {
            Some(handle) => {
                let mut node = handle.lock();
                node.hostname = descriptor.hostname;
                node.address = descriptor.address;
                node.available_models = descriptor.available_models;
                node.capabilities = descriptor.capabilities;
                node.status = NodeStatus::Online;
                node.expired_by_sweep = false;
                node.touch();
                debug!(node_id = %node.id, "Re-registered node");
                node.clone()
            }
            None => {
                let id = descriptor.id.clone();
                let node = Node::new(descriptor);
                let snapshot = node.clone();

                // Another caller may have inserted the same id meanwhile; the
                // first entry wins so the lock instance stays unique.
                let mut nodes = self.nodes.write();
                nodes.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(node)));
                drop(nodes);

                info!(node_id = %id, hostname = %snapshot.hostname, "Registered node");
                snapshot
            }
        };

        self.refresh_gauges();
        snapshot
    }

    /// Remove a node; the local node cannot be removed
    pub fn unregister(&self, node_id: &str) -> Result<()> {
        if self.is_local(node_id) {
            return Err(MeshError::invalid_input("The local node cannot be unregistered"));
        }

        let removed = self.nodes.write().remove(node_id);
        match removed {
            Some(_) => {
                info!(node_id = %node_id, "Unregistered node");
                self.refresh_gauges();
                Ok(())
            }
            None => Err(MeshError::not_found(format!("node {}", node_id))),
        }
    }

    /// Snapshot of one node
    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.handle(node_id).map(|handle| handle.lock().clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Snapshots of every node with status ONLINE, ordered by id
    pub fn list_online(&self) -> Vec<Node> {
        self.snapshot(|node| node.is_online())
    }

    /// Snapshots of every node, ordered by id
    pub fn list_all(&self) -> Vec<Node> {
        self.snapshot(|_| true)
    }

    /// Nodes for display; without `include_offline` only OFFLINE nodes are hidden
    pub fn list(&self, include_offline: bool) -> Vec<Node> {
        self.snapshot(|node| include_offline || node.status != NodeStatus::Offline)
    }

    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        self.mutate(node_id, |node| {
            if node.status != status {
                debug!(node_id = %node.id, from = ?node.status, to = ?status, "Node status changed");
            }
            node.status = status;
            node.expired_by_sweep = false;
        })?;
        self.refresh_gauges();
        Ok(())
    }

    /// Merge a partial telemetry update into the node's resources
    pub fn update_resources(&self, node_id: &str, resources: &NodeResources) -> Result<()> {
        self.mutate(node_id, |node| node.resources.merge(resources))
    }

    pub fn update_available_models<I, S>(&self, node_id: &str, models: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models: BTreeSet<String> = models.into_iter().map(Into::into).collect();
        self.mutate(node_id, move |node| node.available_models = models)
    }

    /// Lock handle used for counter updates
    pub(crate) fn handle(&self, node_id: &str) -> Option<NodeHandle> {
        self.nodes.read().get(node_id).cloned()
    }

    /// All handles, ordered by id; used by the health sweep
    pub(crate) fn handles(&self) -> Vec<NodeHandle> {
        let nodes = self.nodes.read();
        let mut ids: Vec<&String> = nodes.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| nodes.get(id).cloned()).collect()
    }

    /// Apply `f` under the node's lock and touch its heartbeat
    fn mutate<F>(&self, node_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Node),
    {
        let handle = self.handle(node_id).ok_or_else(|| {
            warn!(node_id = %node_id, "Update for unknown node");
            MeshError::not_found(format!("node {}", node_id))
        })?;

        let mut node = handle.lock();
        f(&mut node);
        node.touch();
        Ok(())
    }

    fn snapshot<P>(&self, predicate: P) -> Vec<Node>
    where
        P: Fn(&Node) -> bool,
    {
        let handles: Vec<NodeHandle> = self.nodes.read().values().cloned().collect();
        let mut nodes: Vec<Node> = handles
            .iter()
            .map(|handle| handle.lock().clone())
            .filter(|node| predicate(node))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub(crate) fn refresh_gauges(&self) {
        let all = self.list_all();
        let offline = all.iter().filter(|n| n.status == NodeStatus::Offline).count();
        METRICS.coordinator.online_nodes.set(all.iter().filter(|n| n.is_online()).count() as i64);
        METRICS.coordinator.offline_nodes.set(offline as i64);
    }
}
