//! Node id to link index kept by the master

use std::collections::HashMap;

use crate::network::LinkId;

/// One-to-one mapping between member node ids and their links.
///
/// Both directions are updated together, so a node is never reachable
/// through a link that no longer maps back to it.
#[derive(Debug, Default)]
pub struct LinkIndex {
    by_node: HashMap<String, LinkId>,
    by_link: HashMap<LinkId, String>,
}

impl LinkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `node_id` to `link`. Returns the link previously bound to the
    /// node, if it was a different one.
    pub fn insert(&mut self, node_id: &str, link: LinkId) -> Option<LinkId> {
        if let Some(previous_node) = self.by_link.remove(&link) {
            self.by_node.remove(&previous_node);
        }
        let previous = self.by_node.insert(node_id.to_string(), link);
        if let Some(previous) = previous {
            self.by_link.remove(&previous);
        }
        self.by_link.insert(link, node_id.to_string());
        previous.filter(|p| *p != link)
    }

    /// Unbind a link, returning the node it served
    pub fn remove_link(&mut self, link: LinkId) -> Option<String> {
        let node_id = self.by_link.remove(&link)?;
        self.by_node.remove(&node_id);
        Some(node_id)
    }

    /// Unbind a node, returning its link
    pub fn remove_node(&mut self, node_id: &str) -> Option<LinkId> {
        let link = self.by_node.remove(node_id)?;
        self.by_link.remove(&link);
        Some(link)
    }

    pub fn link_for(&self, node_id: &str) -> Option<LinkId> {
        self.by_node.get(node_id).copied()
    }

    pub fn node_for(&self, link: LinkId) -> Option<&str> {
        self.by_link.get(&link).map(String::as_str)
    }

    /// Identified links, in no particular order
    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.by_link.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_node.clear();
        self.by_link.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut index = LinkIndex::new();
        assert_eq!(index.insert("b", LinkId(1)), None);
        assert_eq!(index.insert("c", LinkId(2)), None);

        assert_eq!(index.link_for("b"), Some(LinkId(1)));
        assert_eq!(index.node_for(LinkId(2)), Some("c"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_reconnect_displaces_old_link() {
        let mut index = LinkIndex::new();
        index.insert("b", LinkId(1));
        assert_eq!(index.insert("b", LinkId(5)), Some(LinkId(1)));

        // The stale link no longer resolves to the node
        assert_eq!(index.remove_link(LinkId(1)), None);
        assert_eq!(index.link_for("b"), Some(LinkId(5)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_removal_clears_both_sides() {
        let mut index = LinkIndex::new();
        index.insert("b", LinkId(1));
        index.insert("c", LinkId(2));

        assert_eq!(index.remove_link(LinkId(1)), Some("b".to_string()));
        assert_eq!(index.link_for("b"), None);
        assert_eq!(index.remove_node("c"), Some(LinkId(2)));
        assert_eq!(index.node_for(LinkId(2)), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_same_link_renamed() {
        let mut index = LinkIndex::new();
        index.insert("b", LinkId(1));
        assert_eq!(index.insert("d", LinkId(1)), None);
        assert_eq!(index.link_for("b"), None);
        assert_eq!(index.node_for(LinkId(1)), Some("d"));
    }
}
