//! Cluster Topology
//!
//! The membership table replicated from the master to every member.
//!
//! The master mutates the table directly (`add`/`remove`) and publishes
//! coalesced change batches (`flush_changes`), each advancing the revision by
//! exactly one. Members replace the table from a snapshot (`reload`) or apply
//! a batch whose base revision matches their own (`apply_update`). The local
//! node is a permanent member and is never overwritten by remote data.

mod change;
mod node;

pub use change::{Change, TopologySnapshot, UpdateBatch, TOPOLOGY_VERSION};
pub use node::{Node, NodeInfo, PortValue};

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Membership table plus revision log
#[derive(Debug, Clone)]
pub struct Topology {
    /// The node representing this process
    local: Node,
    /// All known nodes, including `local`. Ordered so election is a min lookup.
    nodes: BTreeMap<String, Node>,
    /// Current master, if known
    master_id: Option<String>,
    /// Latest committed revision
    revision: u64,
    /// Revision already published as a synchronization baseline
    base_revision: u64,
    /// Pending changes: node id -> the node as of the last flush
    changes: BTreeMap<String, Option<Node>>,
}

impl Topology {
    /// Create a topology holding only the local node
    pub fn new(local: Node) -> Self {
        let mut topology = Self {
            local,
            nodes: BTreeMap::new(),
            master_id: None,
            revision: 0,
            base_revision: 0,
            changes: BTreeMap::new(),
        };
        topology.clear();
        topology
    }

    /// Id of the local node
    pub fn id(&self) -> &str {
        self.local.id()
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn master_id(&self) -> Option<&str> {
        self.master_id.as_deref()
    }

    /// The master node, if one is known
    pub fn master(&self) -> Option<&Node> {
        self.master_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// A topology is valid once a master is known
    pub fn is_valid(&self) -> bool {
        self.master_id.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.master_id.as_deref() == Some(self.local.id())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    /// Whether unflushed changes are pending
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Reset to the singleton view without a master
    pub fn clear(&mut self) -> &mut Self {
        self.nodes.clear();
        self.nodes.insert(self.local.id().to_string(), self.local.clone());
        self.master_id = None;
        self.revision = 0;
        self.base_revision = 0;
        self.changes.clear();
        self
    }

    /// Claim mastership: the table shrinks to the local node and members
    /// re-register. The revision keeps counting from the last known value.
    pub fn become_master(&mut self) -> &mut Self {
        self.nodes.clear();
        self.nodes.insert(self.local.id().to_string(), self.local.clone());
        self.master_id = Some(self.local.id().to_string());
        self.base_revision = self.revision;
        self.changes.clear();
        self
    }

    fn require_master(&self, operation: &'static str) -> Result<()> {
        if self.is_master() {
            Ok(())
        } else {
            Err(Error::NotMaster { operation })
        }
    }

    fn require_member(&self, operation: &'static str) -> Result<()> {
        if self.is_master() {
            Err(Error::IsMaster { operation })
        } else {
            Ok(())
        }
    }

    /// Record the baseline state of `id` the first time it changes in a batch
    fn track(&mut self, id: &str) {
        if !self.changes.contains_key(id) {
            let baseline = self.nodes.get(id).cloned();
            self.changes.insert(id.to_string(), baseline);
        }
    }

    /// Insert or replace a member (master only).
    ///
    /// Re-adding an existing id with different details records an `update`
    /// carrying the previous entry as `origin`. Re-adding an identical node
    /// records nothing and leaves the revision alone; the caller resends the
    /// snapshot to that member instead of broadcasting an empty change.
    ///
    /// Returns `false` when nothing changed: the local node cannot be
    /// replaced, and re-adding an identical node is not a change.
    pub fn add(&mut self, node: Node) -> Result<bool> {
        self.require_master("add")?;
        if node.id() == self.local.id() || self.nodes.get(node.id()) == Some(&node) {
            return Ok(false);
        }
        self.track(node.id());
        self.nodes.insert(node.id().to_string(), node);
        Ok(true)
    }

    /// Remove a member (master only). Non-members and the local node are no-ops.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        self.require_master("remove")?;
        if id == self.local.id() || !self.nodes.contains_key(id) {
            return Ok(false);
        }
        self.track(id);
        self.nodes.remove(id);
        Ok(true)
    }

    /// Publish pending changes as one batch (master only).
    ///
    /// Returns `None` when there is nothing to send. Otherwise the revision
    /// advances by one and becomes the new baseline.
    pub fn flush_changes(&mut self) -> Result<Option<UpdateBatch>> {
        self.require_master("flushChanges")?;
        if self.changes.is_empty() {
            return Ok(None);
        }

        let pending = std::mem::take(&mut self.changes);
        let changes = pending
            .into_iter()
            .map(|(id, baseline)| match (self.nodes.get(&id), baseline) {
                (Some(node), None) => Change::Insert { node: node.clone() },
                (Some(node), Some(origin)) => Change::Update { node: node.clone(), origin: Some(origin) },
                (None, _) => Change::Delete { node_id: id },
            })
            .collect();

        let base_revision = self.base_revision;
        self.revision = base_revision + 1;
        self.base_revision = self.revision;

        Ok(Some(UpdateBatch {
            base_revision,
            revision: self.revision,
            changes,
        }))
    }

    /// Replace the table wholesale from a master snapshot (member only)
    pub fn reload(&mut self, snapshot: &TopologySnapshot) -> Result<()> {
        self.require_member("reload")?;
        if snapshot.v != TOPOLOGY_VERSION {
            return Err(Error::BadTopology(format!("version {:?}", snapshot.v)));
        }
        let master = snapshot.master.as_deref()
            .filter(|m| !m.is_empty())
            .ok_or(Error::NoMaster)?;

        let mut nodes: BTreeMap<String, Node> = snapshot
            .nodes
            .iter()
            .map(|n| (n.id().to_string(), n.clone()))
            .collect();
        if !nodes.contains_key(master) {
            return Err(Error::InvalidMaster(master.to_string()));
        }
        nodes.insert(self.local.id().to_string(), self.local.clone());

        self.nodes = nodes;
        self.master_id = Some(master.to_string());
        self.revision = snapshot.revision;
        self.base_revision = snapshot.revision;
        Ok(())
    }

    /// Apply a change list (member only). Returns whether anything changed.
    ///
    /// Changes touching the local node are ignored, and the current master
    /// is only ever dropped by `elect_master`.
    pub fn update(&mut self, changes: &[Change]) -> Result<bool> {
        self.require_member("update")?;
        let mut changed = false;
        for change in changes {
            let id = change.node_id();
            if id == self.local.id() {
                continue;
            }
            match change {
                Change::Insert { node } | Change::Update { node, .. } => {
                    if self.nodes.get(id) != Some(node) {
                        self.nodes.insert(id.to_string(), node.clone());
                        changed = true;
                    }
                }
                Change::Delete { .. } => {
                    if self.master_id.as_deref() == Some(id) {
                        continue;
                    }
                    changed |= self.nodes.remove(id).is_some();
                }
            }
        }
        Ok(changed)
    }

    /// Apply an incremental batch if it extends the local revision (member only)
    pub fn apply_update(&mut self, batch: &UpdateBatch) -> Result<bool> {
        self.require_member("update")?;
        if batch.base_revision != self.revision {
            return Err(Error::OutOfDate {
                local: self.revision,
                base: batch.base_revision,
            });
        }
        let changed = self.update(&batch.changes)?;
        self.revision = batch.revision;
        self.base_revision = batch.revision;
        Ok(changed)
    }

    /// Drop the unreachable master and pick the smallest remaining id (member only).
    ///
    /// Always terminates with a master: the local node is never removed, so at
    /// worst it elects itself.
    pub fn elect_master(&mut self) -> Result<&Node> {
        self.require_member("electMaster")?;
        if let Some(master) = self.master_id.take() {
            if master != self.local.id() {
                self.nodes.remove(&master);
            }
        }
        let (id, node) = self
            .nodes
            .iter()
            .next()
            .ok_or_else(|| Error::BadTopology("empty node table".into()))?;
        self.master_id = Some(id.clone());
        Ok(node)
    }

    /// Full snapshot of the current table
    pub fn to_snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            v: TOPOLOGY_VERSION.to_string(),
            id: Some(self.local.id().to_string()),
            master: self.master_id.clone(),
            revision: self.revision,
            nodes: self.nodes.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16) -> Node {
        Node::new(id, "localhost", port).unwrap()
    }

    fn local_topology(id: &str) -> Topology {
        Topology::new(node(id, 2000))
    }

    fn snapshot(master: &str, revision: u64, nodes: &[Node]) -> TopologySnapshot {
        TopologySnapshot {
            v: TOPOLOGY_VERSION.to_string(),
            id: None,
            master: Some(master.to_string()),
            revision,
            nodes: nodes.to_vec(),
        }
    }

    fn member_topology() -> Topology {
        let mut topology = local_topology("localId");
        topology
            .reload(&snapshot("node1", 1, &[node("node1", 2001), node("node2", 2002)]))
            .unwrap();
        topology
    }

    #[test]
    fn test_new_topology() {
        let topology = local_topology("localId");
        assert_eq!(topology.id(), "localId");
        assert!(!topology.is_valid());
        assert!(!topology.is_master());
        assert!(topology.master().is_none());
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.revision(), 0);
    }

    #[test]
    fn test_clear_keeps_local_node() {
        let mut topology = member_topology();
        assert!(topology.is_valid());
        topology.clear();
        assert!(!topology.is_valid());
        assert_eq!(topology.len(), 1);
        assert!(topology.contains("localId"));
    }

    #[test]
    fn test_master_operations_forbidden_as_member() {
        let mut topology = local_topology("localId");
        assert!(matches!(topology.add(node("a", 1)), Err(Error::NotMaster { .. })));
        assert!(matches!(topology.remove("a"), Err(Error::NotMaster { .. })));
        assert!(matches!(topology.flush_changes(), Err(Error::NotMaster { .. })));
    }

    #[test]
    fn test_member_operations_forbidden_as_master() {
        let mut topology = local_topology("localId");
        topology.become_master();
        let snap = snapshot("x", 1, &[node("x", 1)]);
        assert!(matches!(topology.reload(&snap), Err(Error::IsMaster { .. })));
        assert!(matches!(topology.update(&[]), Err(Error::IsMaster { .. })));
        assert!(matches!(topology.elect_master(), Err(Error::IsMaster { .. })));
    }

    #[test]
    fn test_add_remove_coalesce_into_one_change() {
        let mut topology = local_topology("localId");
        topology.become_master();

        assert!(topology.add(node("node1", 2001)).unwrap());
        assert!(topology.remove("node1").unwrap());
        assert!(!topology.remove("node1").unwrap());
        assert!(!topology.remove("node2").unwrap());
        assert_eq!(topology.revision(), 0);

        let batch = topology.flush_changes().unwrap().unwrap();
        assert_eq!(batch.base_revision, 0);
        assert_eq!(batch.revision, 1);
        assert_eq!(batch.changes, vec![Change::Delete { node_id: "node1".into() }]);
        assert_eq!(topology.base_revision(), topology.revision());
        assert!(topology.flush_changes().unwrap().is_none());
    }

    #[test]
    fn test_flush_counts_distinct_ids() {
        let mut topology = local_topology("localId");
        topology.become_master();

        topology.add(node("a", 1)).unwrap();
        topology.add(node("b", 2)).unwrap();
        topology.add(node("a", 3)).unwrap();
        topology.add(node("c", 4)).unwrap();
        topology.remove("c").unwrap();

        let before = topology.base_revision();
        let batch = topology.flush_changes().unwrap().unwrap();
        assert_eq!(batch.changes.len(), 3);
        assert_eq!(topology.revision(), before + 1);
        // "a" was inserted within this batch, so it is still an insert
        assert!(batch.changes.contains(&Change::Insert { node: node("a", 3) }));

        topology.add(node("a", 5)).unwrap();
        let batch = topology.flush_changes().unwrap().unwrap();
        assert_eq!(batch.base_revision, 1);
        assert_eq!(batch.revision, 2);
        assert_eq!(
            batch.changes,
            vec![Change::Update { node: node("a", 5), origin: Some(node("a", 3)) }]
        );
    }

    #[test]
    fn test_identical_add_records_nothing() {
        let mut topology = local_topology("localId");
        topology.become_master();
        assert!(topology.add(node("a", 1)).unwrap());
        topology.flush_changes().unwrap();

        assert!(!topology.add(node("a", 1)).unwrap());
        assert!(!topology.is_changed());
        assert!(topology.flush_changes().unwrap().is_none());
        assert_eq!(topology.revision(), 1);
    }

    #[test]
    fn test_local_node_not_removable_by_master() {
        let mut topology = local_topology("localId");
        topology.become_master();
        assert!(!topology.remove("localId").unwrap());
        assert!(!topology.add(node("localId", 9999)).unwrap());
        assert_eq!(topology.node("localId").unwrap().port(), 2000);
        assert!(!topology.is_changed());
    }

    #[test]
    fn test_reload_validation() {
        let mut topology = local_topology("localId");

        let mut bad_version = snapshot("a", 1, &[node("a", 1)]);
        bad_version.v = "abc".into();
        assert!(matches!(topology.reload(&bad_version), Err(Error::BadTopology(_))));

        let mut no_master = snapshot("a", 1, &[]);
        no_master.master = None;
        assert!(matches!(topology.reload(&no_master), Err(Error::NoMaster)));

        let unknown_master = snapshot("abc", 1, &[]);
        assert!(matches!(topology.reload(&unknown_master), Err(Error::InvalidMaster(_))));

        assert!(!topology.is_valid());
    }

    #[test]
    fn test_reload_does_not_overwrite_local_node() {
        let mut topology = local_topology("localId");
        topology
            .reload(&snapshot("node1", 4, &[node("node1", 2001), node("localId", 2002)]))
            .unwrap();
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.node("localId").unwrap().port(), 2000);
        assert_eq!(topology.revision(), 4);
        assert_eq!(topology.master_id(), Some("node1"));
    }

    #[test]
    fn test_update_nodes() {
        let mut topology = member_topology();
        let changed = topology
            .update(&[Change::Update { node: Node::new("node2", "local", 2012).unwrap(), origin: None }])
            .unwrap();
        assert!(changed);
        assert_eq!(topology.node("node2").unwrap().address(), "local");

        topology.update(&[Change::Update { node: node("node3", 2003), origin: None }]).unwrap();
        assert!(topology.contains("node3"));

        assert!(topology.update(&[Change::Delete { node_id: "node2".into() }]).unwrap());
        assert!(!topology.contains("node2"));
    }

    #[test]
    fn test_update_ignores_local_and_master() {
        let mut topology = member_topology();
        let changed = topology
            .update(&[
                Change::Update { node: Node::new("localId", "local", 2012).unwrap(), origin: None },
                Change::Delete { node_id: "localId".into() },
                Change::Delete { node_id: "node1".into() },
            ])
            .unwrap();
        assert!(!changed);
        assert_eq!(topology.node("localId").unwrap().address(), "localhost");
        assert!(topology.contains("node1"));
        assert_eq!(topology.master_id(), Some("node1"));
    }

    #[test]
    fn test_apply_update_requires_matching_base() {
        let mut topology = member_topology();
        let batch = UpdateBatch {
            base_revision: 3,
            revision: 4,
            changes: vec![Change::Insert { node: node("node9", 2009) }],
        };
        assert!(matches!(topology.apply_update(&batch), Err(Error::OutOfDate { local: 1, base: 3 })));
        assert!(!topology.contains("node9"));
        assert_eq!(topology.revision(), 1);

        let batch = UpdateBatch { base_revision: 1, ..batch };
        assert!(topology.apply_update(&batch).unwrap());
        assert_eq!(topology.revision(), 4);
        assert!(topology.contains("node9"));
    }

    #[test]
    fn test_become_master_resets_table() {
        let mut topology = member_topology();
        assert_eq!(topology.len(), 3);
        topology.become_master();
        assert!(topology.is_master());
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.master().unwrap().id(), "localId");
    }

    #[test]
    fn test_elect_master_picks_smallest_id() {
        let mut topology = local_topology("10");
        topology
            .reload(&snapshot("08", 1, &[node("08", 2008), node("09", 2009), node("11", 2011)]))
            .unwrap();
        assert_eq!(topology.len(), 4);

        assert_eq!(topology.elect_master().unwrap().id(), "09");
        assert_eq!(topology.len(), 3);
        assert!(!topology.is_master());

        assert_eq!(topology.elect_master().unwrap().id(), "10");
        assert!(topology.is_master());
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn test_elect_master_single_node() {
        let mut topology = local_topology("solo");
        assert_eq!(topology.elect_master().unwrap().id(), "solo");
        assert!(topology.is_master());
        assert!(topology.contains(topology.master_id().unwrap()));
    }

    #[test]
    fn test_incremental_updates_converge_with_full_reload() {
        let mut master = local_topology("a");
        master.become_master();
        let mut member = local_topology("m");

        master.add(node("m", 2000)).unwrap();
        master.flush_changes().unwrap();
        member.reload(&master.to_snapshot()).unwrap();

        let steps: Vec<Box<dyn Fn(&mut Topology)>> = vec![
            Box::new(|t: &mut Topology| { t.add(node("b", 1)).unwrap(); }),
            Box::new(|t: &mut Topology| { t.add(node("c", 2)).unwrap(); t.add(node("d", 3)).unwrap(); }),
            Box::new(|t: &mut Topology| { t.remove("b").unwrap(); t.add(node("c", 22)).unwrap(); }),
            Box::new(|t: &mut Topology| { t.add(node("b", 11)).unwrap(); t.remove("d").unwrap(); }),
        ];
        for step in steps {
            step(&mut master);
            let batch = master.flush_changes().unwrap().unwrap();
            member.apply_update(&batch).unwrap();
        }

        let mut fresh = local_topology("m");
        fresh.reload(&master.to_snapshot()).unwrap();

        let incremental: Vec<_> = member.nodes().cloned().collect();
        let reloaded: Vec<_> = fresh.nodes().cloned().collect();
        assert_eq!(incremental, reloaded);
        assert_eq!(member.revision(), fresh.revision());
        assert_eq!(member.revision(), master.revision());
    }
}
