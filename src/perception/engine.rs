//! Engine core: scan, relevance-filter, debounced diff emission.
//!
//! The engine itself is synchronous; the 50 ms debounce timer is owned by
//! the agent's async loop, which arms a sleep whenever a trigger reports
//! newly-pending work and calls [`PerceptionEngine::flush`] when it fires.

use crate::dom::{Document, Mutation, NodeId};
use crate::perception::candidate;
use crate::perception::diff::diff_candidates;
use crate::perception::identity::IdentityRegistry;
use crate::protocol::{ActionCandidate, CandidateDelta, PageEventKind};
use std::collections::HashMap;
use std::time::Duration;

/// Coalescing window between a trigger and the diff computation.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// Attribute changes that can alter the candidate set or a candidate's
/// observable fields. Anything else is ignored.
pub const OBSERVED_ATTRIBUTES: &[&str] = &[
    "disabled",
    "aria-disabled",
    "aria-expanded",
    "aria-checked",
    "aria-selected",
    "aria-label",
    "class",
    "style",
    "hidden",
    "value",
];

#[derive(Default)]
pub struct PerceptionEngine {
    identity: IdentityRegistry,
    previous: HashMap<String, ActionCandidate>,
    pending: bool,
    started: bool,
}

impl PerceptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, id: &str) -> Option<NodeId> {
        self.identity.resolve(id)
    }

    /// Last emitted candidate set, keyed by id. The in-page `query` command
    /// searches this.
    pub fn current(&self) -> &HashMap<String, ActionCandidate> {
        &self.previous
    }

    fn scan(&mut self, doc: &Document) -> HashMap<String, ActionCandidate> {
        let mut out = HashMap::new();
        for node in doc.iter_connected() {
            if candidate::is_interactive(doc, node) && candidate::is_visible(doc, node) {
                let id = self.identity.id_for(doc, node);
                out.insert(id.clone(), candidate::extract(doc, node, id));
            }
        }
        out
    }

    /// Begin watching: returns the initial candidate set in document order.
    /// The caller sends it as a snapshot; subsequent emissions are deltas.
    pub fn start(&mut self, doc: &Document) -> Vec<ActionCandidate> {
        self.started = true;
        self.snapshot(doc)
    }

    /// Full rescan, resetting the diff baseline (used for
    /// `request_snapshot`). Candidates are returned in document order.
    pub fn snapshot(&mut self, doc: &Document) -> Vec<ActionCandidate> {
        let set = self.scan(doc);
        let mut ordered = Vec::with_capacity(set.len());
        for node in doc.iter_connected() {
            if let Some(id) = self.identity.id_of_node(node) {
                if let Some(c) = set.get(id) {
                    ordered.push(c.clone());
                }
            }
        }
        self.previous = set;
        self.pending = false;
        ordered
    }

    /// Apply the observer relevance filter to a mutation batch. Returns true
    /// when this batch newly marked the engine pending (arm the debounce).
    pub fn observe_mutations(&mut self, mutations: &[Mutation], doc: &Document) -> bool {
        if !self.started {
            return false;
        }
        let relevant = mutations.iter().any(|m| is_relevant(m, doc));
        if relevant && !self.pending {
            self.pending = true;
            return true;
        }
        false
    }

    /// Window scroll / resize / intersection triggers.
    pub fn note_viewport_change(&mut self) -> bool {
        if !self.started || self.pending {
            return false;
        }
        self.pending = true;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Debounce fire: diff against the previous snapshot and advance the
    /// baseline. `None` when nothing observable changed.
    pub fn flush(&mut self, doc: &Document) -> Option<CandidateDelta> {
        if !self.started {
            return None;
        }
        self.pending = false;
        let next = self.scan(doc);
        let delta = diff_candidates(&self.previous, &next);
        self.previous = next;
        self.identity.prune(doc);
        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// External refresh: bypasses the debounce entirely.
    pub fn force_update(&mut self, doc: &Document) -> Option<CandidateDelta> {
        self.flush(doc)
    }

    /// Overlay watcher: modal / menu open and close events derived from
    /// added/removed subtrees.
    pub fn overlay_events(&self, mutations: &[Mutation], doc: &Document) -> Vec<PageEventKind> {
        let mut events = Vec::new();
        for m in mutations {
            match m {
                Mutation::ChildAdded { node } => {
                    if subtree_has_overlay(doc, *node, OverlayKind::Modal) {
                        events.push(PageEventKind::ModalOpened);
                    }
                    if subtree_has_overlay(doc, *node, OverlayKind::Menu) {
                        events.push(PageEventKind::MenuOpened);
                    }
                }
                Mutation::ChildRemoved { node } => {
                    if subtree_has_overlay(doc, *node, OverlayKind::Modal) {
                        events.push(PageEventKind::ModalClosed);
                    }
                    if subtree_has_overlay(doc, *node, OverlayKind::Menu) {
                        events.push(PageEventKind::MenuClosed);
                    }
                }
                _ => {}
            }
        }
        events
    }
}

fn is_relevant(mutation: &Mutation, doc: &Document) -> bool {
    match mutation {
        Mutation::Attribute { name, .. } => OBSERVED_ATTRIBUTES.contains(&name.as_str()),
        Mutation::ChildAdded { node } | Mutation::ChildRemoved { node } => {
            subtree_has_interactive(doc, *node)
        }
        Mutation::Text { .. } => false,
    }
}

#[derive(Clone, Copy)]
enum OverlayKind {
    Modal,
    Menu,
}

fn subtree_has_interactive(doc: &Document, root: NodeId) -> bool {
    walk(doc, root, |n| candidate::is_interactive(doc, n))
}

fn subtree_has_overlay(doc: &Document, root: NodeId, kind: OverlayKind) -> bool {
    walk(doc, root, |n| {
        let Some(e) = doc.element(n) else { return false };
        let role = e
            .attr("role")
            .map(|r| r.to_ascii_lowercase())
            .unwrap_or_else(|| match e.tag.as_str() {
                "dialog" => "dialog".to_string(),
                "menu" => "menu".to_string(),
                _ => String::new(),
            });
        match kind {
            OverlayKind::Modal => role == "dialog" || role == "alertdialog",
            OverlayKind::Menu => role == "menu" || role == "listbox",
        }
    })
}

fn walk(doc: &Document, root: NodeId, mut pred: impl FnMut(NodeId) -> bool) -> bool {
    let mut stack = vec![root];
    while let Some(n) = stack.pop() {
        if pred(n) {
            return true;
        }
        if let Some(e) = doc.element(n) {
            stack.extend(e.children().iter().copied());
        }
    }
    false
}
