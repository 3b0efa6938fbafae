//! Stable candidate identity.
//!
//! Ids are keyed by node identity, not attributes: the same element always
//! yields the same id, across attribute churn and detach/re-attach. Entries
//! die only when the node is purged from the arena.

use crate::dom::{Document, NodeId};
use crate::protocol::to_base36;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_node: HashMap<NodeId, String>,
    by_id: HashMap<String, NodeId>,
    counter: u64,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a node, assigning one on first encounter: `e_<htmlId>` when the
    /// DOM id attribute is unique in the document, else `a_<base36>`.
    pub fn id_for(&mut self, doc: &Document, node: NodeId) -> String {
        if let Some(id) = self.by_node.get(&node) {
            return id.clone();
        }
        let id = self
            .dom_derived_id(doc, node)
            .unwrap_or_else(|| self.next_counter_id());
        self.by_node.insert(node, id.clone());
        self.by_id.insert(id.clone(), node);
        id
    }

    fn dom_derived_id(&self, doc: &Document, node: NodeId) -> Option<String> {
        let dom_id = doc.element(node)?.attr("id")?;
        if dom_id.is_empty() || !doc.dom_id_is_unique(node) {
            return None;
        }
        let id = format!("e_{}", dom_id);
        // Another node may have claimed this id before losing its attribute.
        if self.by_id.contains_key(&id) {
            return None;
        }
        Some(id)
    }

    fn next_counter_id(&mut self) -> String {
        let id = format!("a_{}", to_base36(self.counter));
        self.counter += 1;
        id
    }

    pub fn resolve(&self, id: &str) -> Option<NodeId> {
        self.by_id.get(id).copied()
    }

    /// Reverse lookup without assignment.
    pub fn id_of_node(&self, node: NodeId) -> Option<&str> {
        self.by_node.get(&node).map(|s| s.as_str())
    }

    /// Drop entries whose node was purged from the arena (the runtime's
    /// stand-in for garbage collection).
    pub fn prune(&mut self, doc: &Document) {
        let dead: Vec<NodeId> = self
            .by_node
            .keys()
            .copied()
            .filter(|n| doc.element(*n).is_none())
            .collect();
        for node in dead {
            if let Some(id) = self.by_node.remove(&node) {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Viewport;

    fn doc() -> Document {
        Document::new("https://a/", Viewport { width: 800, height: 600 })
    }

    #[test]
    fn counter_ids_are_base36_sequential() {
        let mut d = doc();
        let mut reg = IdentityRegistry::new();
        let body = d.body();
        let a = d.create_element("button");
        let b = d.create_element("button");
        d.append_child(body, a);
        d.append_child(body, b);
        assert_eq!(reg.id_for(&d, a), "a_0");
        assert_eq!(reg.id_for(&d, b), "a_1");
        assert_eq!(reg.id_for(&d, a), "a_0");
    }

    #[test]
    fn unique_dom_id_yields_e_prefixed_id() {
        let mut d = doc();
        let mut reg = IdentityRegistry::new();
        let body = d.body();
        let btn = d.create_element("button");
        d.set_attr(btn, "id", "login");
        d.append_child(body, btn);
        assert_eq!(reg.id_for(&d, btn), "e_login");
        assert_eq!(reg.resolve("e_login"), Some(btn));
    }

    #[test]
    fn duplicate_dom_ids_fall_back_to_counter() {
        let mut d = doc();
        let mut reg = IdentityRegistry::new();
        let body = d.body();
        let a = d.create_element("button");
        let b = d.create_element("button");
        d.set_attr(a, "id", "x");
        d.set_attr(b, "id", "x");
        d.append_child(body, a);
        d.append_child(body, b);
        assert_eq!(reg.id_for(&d, a), "a_0");
        assert_eq!(reg.id_for(&d, b), "a_1");
    }

    #[test]
    fn identity_survives_detach_and_reattach() {
        let mut d = doc();
        let mut reg = IdentityRegistry::new();
        let body = d.body();
        let btn = d.create_element("button");
        d.append_child(body, btn);
        let id = reg.id_for(&d, btn);
        d.remove_child(btn);
        d.append_child(body, btn);
        assert_eq!(reg.id_for(&d, btn), id);
    }

    #[test]
    fn prune_drops_purged_nodes_only() {
        let mut d = doc();
        let mut reg = IdentityRegistry::new();
        let body = d.body();
        let keep = d.create_element("button");
        let drop = d.create_element("button");
        d.append_child(body, keep);
        d.append_child(body, drop);
        reg.id_for(&d, keep);
        let drop_id = reg.id_for(&d, drop);
        d.remove_child(drop);
        reg.prune(&d);
        assert_eq!(reg.len(), 2); // detached but not purged
        d.purge(drop);
        reg.prune(&d);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.resolve(&drop_id), None);
    }
}
