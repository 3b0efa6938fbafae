//! Arena document tree.
//!
//! `NodeId`s are monotonic and never reused, so a detached element keeps its
//! identity until it is explicitly purged — the property the perception
//! engine's id registry relies on.

use crate::dom::Mutation;
use crate::protocol::{Rect, Viewport};
use std::collections::{BTreeMap, HashMap};

pub type NodeId = u64;

/// Computed-style flags the perception engine cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Style {
    pub display_none: bool,
    pub visibility_hidden: bool,
    pub opacity_zero: bool,
    pub cursor_pointer: bool,
    pub background_color: Option<String>,
    pub text_color: Option<String>,
}

/// Synthesized input event, recorded in dispatch order. The agent binary
/// forwards these to the browser's Input domain.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticEvent {
    pub target: NodeId,
    pub kind: String,
    pub button: u8,
    pub detail: u32,
    pub modifiers: Vec<String>,
    pub x: i32,
    pub y: i32,
    pub key: Option<String>,
}

impl SyntheticEvent {
    pub fn new(target: NodeId, kind: impl Into<String>) -> Self {
        Self {
            target,
            kind: kind.into(),
            button: 0,
            detail: 0,
            modifiers: Vec::new(),
            x: 0,
            y: 0,
            key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    attrs: BTreeMap<String, String>,
    /// Own text contribution (not descendants').
    pub text: String,
    pub rect: Rect,
    pub style: Style,
    /// Current value for form controls (runtime state, not the attribute).
    pub value: String,
    pub checked: bool,
    /// Runtime selectedness for `<option>`.
    pub selected: bool,
    /// Open state for `<details>`.
    pub open: bool,
    pub scroll_x: i32,
    pub scroll_y: i32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    connected: bool,
}

impl Element {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            text: String::new(),
            rect: Rect::default(),
            style: Style::default(),
            value: String::new(),
            checked: false,
            selected: false,
            open: false,
            scroll_x: 0,
            scroll_y: 0,
            parent: None,
            children: Vec::new(),
            connected: false,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|v| v.as_str())
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.attrs.keys().cloned().collect()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug)]
pub struct Document {
    nodes: HashMap<NodeId, Element>,
    body: NodeId,
    next_id: NodeId,
    url: String,
    viewport: Viewport,
    user_agent: String,
    focused: Option<NodeId>,
    pub scroll_x: i32,
    pub scroll_y: i32,
    mutations: Vec<Mutation>,
    events: Vec<SyntheticEvent>,
}

impl Document {
    pub fn new(url: impl Into<String>, viewport: Viewport) -> Self {
        let mut body = Element::new("body");
        body.connected = true;
        body.rect = Rect {
            x: 0,
            y: 0,
            w: viewport.width as i32,
            h: viewport.height as i32,
        };
        let mut nodes = HashMap::new();
        nodes.insert(1, body);
        Self {
            nodes,
            body: 1,
            next_id: 2,
            url: url.into(),
            viewport,
            user_agent: String::new(),
            focused: None,
            scroll_x: 0,
            scroll_y: 0,
            mutations: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn set_user_agent(&mut self, ua: impl Into<String>) {
        self.user_agent = ua.into();
    }

    pub fn focused(&self) -> Option<NodeId> {
        self.focused
    }

    pub fn set_focus(&mut self, node: Option<NodeId>) {
        self.focused = node.filter(|n| self.is_connected(*n));
    }

    // ── Construction and mutation ───────────────────────────────

    /// Create a detached element. Attach it with [`Document::append_child`].
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, Element::new(tag));
        id
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        debug_assert!(self.nodes.contains_key(&parent));
        debug_assert!(self.nodes.contains_key(&child));
        if let Some(old_parent) = self.nodes.get(&child).and_then(|e| e.parent) {
            if let Some(p) = self.nodes.get_mut(&old_parent) {
                p.children.retain(|c| *c != child);
            }
        }
        let parent_connected = self.nodes.get(&parent).map(|e| e.connected).unwrap_or(false);
        let child_was_connected = self.is_connected(child);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
        if parent_connected && !child_was_connected {
            self.mark_connected(child, true);
            self.mutations.push(Mutation::ChildAdded { node: child });
        } else if !parent_connected && child_was_connected {
            self.mark_connected(child, false);
            self.mutations.push(Mutation::ChildRemoved { node: child });
        } else if parent_connected && child_was_connected {
            // reparent within the document
            self.mutations.push(Mutation::ChildAdded { node: child });
        }
    }

    /// Detach a subtree. Node data is retained (identity survives re-attach);
    /// use [`Document::purge`] to drop it for good.
    pub fn remove_child(&mut self, node: NodeId) {
        let was_connected = self.is_connected(node);
        if let Some(parent) = self.nodes.get(&node).and_then(|e| e.parent) {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != node);
            }
        }
        if let Some(e) = self.nodes.get_mut(&node) {
            e.parent = None;
        }
        if was_connected {
            self.mark_connected(node, false);
            self.mutations.push(Mutation::ChildRemoved { node });
            if let Some(focused) = self.focused {
                if focused == node || self.had_ancestor(focused, node) {
                    self.focused = None;
                }
            }
        }
    }

    /// Drop a detached subtree from the arena entirely. Identity registries
    /// treat this as garbage collection.
    pub fn purge(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if let Some(e) = self.nodes.remove(&n) {
                stack.extend(e.children);
            }
        }
    }

    fn mark_connected(&mut self, node: NodeId, connected: bool) {
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if let Some(e) = self.nodes.get_mut(&n) {
                e.connected = connected;
                stack.extend(e.children.iter().copied());
            }
        }
    }

    // `focused` may already be detached; walk stored parents regardless.
    fn had_ancestor(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cur = self.nodes.get(&node).and_then(|e| e.parent);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.nodes.get(&n).and_then(|e| e.parent);
        }
        false
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.attrs.insert(name.to_string(), value.to_string());
            if e.connected {
                self.mutations.push(Mutation::Attribute {
                    node,
                    name: name.to_string(),
                });
            }
        }
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) {
        if let Some(e) = self.nodes.get_mut(&node) {
            if e.attrs.remove(name).is_some() && e.connected {
                self.mutations.push(Mutation::Attribute {
                    node,
                    name: name.to_string(),
                });
            }
        }
    }

    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.text = text.to_string();
            if e.connected {
                self.mutations.push(Mutation::Text { node });
            }
        }
    }

    pub fn set_rect(&mut self, node: NodeId, rect: Rect) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.rect = rect;
        }
    }

    pub fn set_style(&mut self, node: NodeId, style: Style) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.style = style;
            if e.connected {
                self.mutations.push(Mutation::Attribute {
                    node,
                    name: "style".to_string(),
                });
            }
        }
    }

    /// Set a form control's runtime value. Journalled under the `value`
    /// attribute name so the observer filter picks it up.
    pub fn set_value(&mut self, node: NodeId, value: &str) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.value = value.to_string();
            if e.connected {
                self.mutations.push(Mutation::Attribute {
                    node,
                    name: "value".to_string(),
                });
            }
        }
    }

    pub fn set_checked(&mut self, node: NodeId, checked: bool) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.checked = checked;
        }
    }

    pub fn set_selected(&mut self, node: NodeId, selected: bool) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.selected = selected;
        }
    }

    pub fn set_open(&mut self, node: NodeId, open: bool) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.open = open;
        }
    }

    pub fn scroll_by(&mut self, dx: i32, dy: i32) {
        self.scroll_x = (self.scroll_x + dx).max(0);
        self.scroll_y = (self.scroll_y + dy).max(0);
    }

    pub fn scroll_element_by(&mut self, node: NodeId, dx: i32, dy: i32) {
        if let Some(e) = self.nodes.get_mut(&node) {
            e.scroll_x = (e.scroll_x + dx).max(0);
            e.scroll_y = (e.scroll_y + dy).max(0);
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn element(&self, node: NodeId) -> Option<&Element> {
        self.nodes.get(&node)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|e| e.connected).unwrap_or(false)
    }

    /// Connected elements in document (depth-first) order.
    pub fn iter_connected(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.body];
        while let Some(n) = stack.pop() {
            if let Some(e) = self.nodes.get(&n) {
                out.push(n);
                // push children reversed so document order pops first
                stack.extend(e.children.iter().rev().copied());
            }
        }
        out
    }

    /// Ancestors from parent up to (and including) body.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes.get(&node).and_then(|e| e.parent);
        while let Some(n) = cur {
            out.push(n);
            cur = self.nodes.get(&n).and_then(|e| e.parent);
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors(node).contains(&ancestor)
    }

    /// True when `a` and `b` are the same node or one contains the other.
    pub fn related(&self, a: NodeId, b: NodeId) -> bool {
        a == b || self.is_ancestor(a, b) || self.is_ancestor(b, a)
    }

    /// Recursive text content, whitespace-normalized.
    pub fn text_content(&self, node: NodeId) -> String {
        let mut parts = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if let Some(e) = self.nodes.get(&n) {
                if !e.text.trim().is_empty() {
                    parts.push(e.text.trim().to_string());
                }
                stack.extend(e.children.iter().rev().copied());
            }
        }
        parts.join(" ")
    }

    /// True when the element is painted at all (independent of viewport
    /// intersection).
    pub fn is_rendered(&self, node: NodeId) -> bool {
        match self.nodes.get(&node) {
            Some(e) => {
                e.connected
                    && !e.rect.is_empty()
                    && !e.style.display_none
                    && !e.style.visibility_hidden
                    && !e.style.opacity_zero
            }
            None => false,
        }
    }

    /// Topmost rendered element at a viewport point. Later document order
    /// approximates higher paint order.
    pub fn element_from_point(&self, x: i32, y: i32) -> Option<NodeId> {
        let mut hit = None;
        for n in self.iter_connected() {
            if self.is_rendered(n) {
                if let Some(e) = self.nodes.get(&n) {
                    if e.rect.contains(x, y) {
                        hit = Some(n);
                    }
                }
            }
        }
        hit
    }

    /// True when the node carries a DOM `id` attribute that no other
    /// connected element shares.
    pub fn dom_id_is_unique(&self, node: NodeId) -> bool {
        let Some(id_attr) = self.nodes.get(&node).and_then(|e| e.attr("id")) else {
            return false;
        };
        self.iter_connected()
            .iter()
            .filter(|n| {
                self.nodes
                    .get(n)
                    .and_then(|e| e.attr("id"))
                    .map(|v| v == id_attr)
                    .unwrap_or(false)
            })
            .count()
            == 1
    }

    // ── Journals ────────────────────────────────────────────────

    pub fn take_mutations(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.mutations)
    }

    pub fn dispatch(&mut self, event: SyntheticEvent) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<SyntheticEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[SyntheticEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new(
            "https://example.com/",
            Viewport {
                width: 1024,
                height: 768,
            },
        )
    }

    fn attach_button(doc: &mut Document, rect: Rect) -> NodeId {
        let btn = doc.create_element("button");
        doc.set_rect(btn, rect);
        let body = doc.body();
        doc.append_child(body, btn);
        btn
    }

    #[test]
    fn append_connects_subtree_and_journals() {
        let mut d = doc();
        let div = d.create_element("div");
        let btn = d.create_element("button");
        d.append_child(div, btn);
        assert!(!d.is_connected(btn));
        let body = d.body();
        d.append_child(body, div);
        assert!(d.is_connected(btn));
        let muts = d.take_mutations();
        assert_eq!(muts, vec![Mutation::ChildAdded { node: div }]);
    }

    #[test]
    fn removal_keeps_node_data_for_reattach() {
        let mut d = doc();
        let btn = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 10,
                h: 10,
            },
        );
        d.set_attr(btn, "aria-label", "Go");
        d.remove_child(btn);
        assert!(!d.is_connected(btn));
        assert_eq!(d.element(btn).unwrap().attr("aria-label"), Some("Go"));
        let body = d.body();
        d.append_child(body, btn);
        assert!(d.is_connected(btn));
    }

    #[test]
    fn detached_mutations_are_not_journalled() {
        let mut d = doc();
        let orphan = d.create_element("button");
        d.take_mutations();
        d.set_attr(orphan, "class", "x");
        assert!(d.take_mutations().is_empty());
    }

    #[test]
    fn element_from_point_prefers_later_document_order() {
        let mut d = doc();
        let below = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 100,
                h: 100,
            },
        );
        let above = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 100,
                h: 100,
            },
        );
        assert_eq!(d.element_from_point(50, 50), Some(above));
        d.remove_child(above);
        assert_eq!(d.element_from_point(50, 50), Some(below));
    }

    #[test]
    fn hidden_elements_are_transparent_to_hit_testing() {
        let mut d = doc();
        let btn = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 100,
                h: 100,
            },
        );
        let cover = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 100,
                h: 100,
            },
        );
        d.set_style(
            cover,
            Style {
                display_none: true,
                ..Style::default()
            },
        );
        assert_eq!(d.element_from_point(10, 10), Some(btn));
    }

    #[test]
    fn dom_id_uniqueness_checks_whole_document() {
        let mut d = doc();
        let a = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 1,
                h: 1,
            },
        );
        let b = attach_button(
            &mut d,
            Rect {
                x: 0,
                y: 0,
                w: 1,
                h: 1,
            },
        );
        d.set_attr(a, "id", "submit");
        assert!(d.dom_id_is_unique(a));
        d.set_attr(b, "id", "submit");
        assert!(!d.dom_id_is_unique(a));
    }

    #[test]
    fn text_content_joins_descendants() {
        let mut d = doc();
        let div = d.create_element("div");
        let span = d.create_element("span");
        d.set_text(div, "Sign");
        d.set_text(span, "in");
        d.append_child(div, span);
        let body = d.body();
        d.append_child(body, div);
        assert_eq!(d.text_content(div), "Sign in");
    }

    #[test]
    fn removing_focused_subtree_clears_focus() {
        let mut d = doc();
        let div = d.create_element("div");
        let btn = d.create_element("button");
        d.set_rect(
            btn,
            Rect {
                x: 0,
                y: 0,
                w: 5,
                h: 5,
            },
        );
        d.append_child(div, btn);
        let body = d.body();
        d.append_child(body, div);
        d.set_focus(Some(btn));
        d.remove_child(div);
        assert_eq!(d.focused(), None);
    }
}
