//! Mirror construction and maintenance from `DOMSnapshot.captureSnapshot`
//! payloads.
//!
//! [`Mirror::sync`] applies a fresh capture onto the existing [`Document`],
//! keyed by CDP backend node ids, so element identity (and therefore
//! candidate ids) survives re-capture. Changes land through the document's
//! normal mutation API and show up in its journal like any page mutation.

use crate::dom::{Document, NodeId, Style};
use crate::error::{PagelensError, Result};
use crate::protocol::{Rect, Viewport};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Computed styles requested from `DOMSnapshot.captureSnapshot`, in the
/// order the layout rows report them.
pub const CAPTURE_STYLES: &[&str] = &[
    "display",
    "visibility",
    "opacity",
    "cursor",
    "background-color",
    "color",
];

fn malformed(what: &str) -> PagelensError {
    PagelensError::MalformedMessage(format!("DOM snapshot: {}", what))
}

#[derive(Debug)]
struct ParsedNode {
    key: i64,
    parent_index: Option<usize>,
    tag: String,
    attrs: Vec<(String, String)>,
    own_text: String,
    rect: Option<Rect>,
    style: Option<Style>,
    value: Option<String>,
    checked: bool,
    selected: bool,
    is_body: bool,
}

/// A DOM mirror that can be refreshed in place from snapshot captures.
pub struct Mirror {
    doc: Document,
    by_key: HashMap<i64, NodeId>,
}

impl Mirror {
    pub fn new(url: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            doc: Document::new(url, viewport),
            by_key: HashMap::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn into_document(self) -> Document {
        self.doc
    }

    /// Apply a capture. Attribute / value / structure changes flow through
    /// the document's mutation journal; the return value reports changes the
    /// journal cannot carry (geometry, checked/selected state), which should
    /// be surfaced to the engine as a viewport-style trigger.
    pub fn sync(&mut self, snapshot: &Value) -> Result<bool> {
        let parsed = parse_snapshot(snapshot)?;
        let mut out_of_band = false;
        let mut index_to_node: HashMap<usize, NodeId> = HashMap::new();
        let mut seen: HashSet<i64> = HashSet::new();

        // Pass 1: ensure nodes exist, update their data.
        for (index, node) in parsed.iter().enumerate() {
            let Some(node) = node else { continue };
            seen.insert(node.key);

            let mirror_node = if node.is_body {
                self.by_key.insert(node.key, self.doc.body());
                self.doc.body()
            } else {
                match self.by_key.get(&node.key).copied() {
                    Some(existing)
                        if self
                            .doc
                            .element(existing)
                            .map(|e| e.tag == node.tag)
                            .unwrap_or(false) =>
                    {
                        existing
                    }
                    stale => {
                        // Same backend id with a different tag is a new
                        // element; detach the stale mirror node.
                        if let Some(old) = stale {
                            if self.doc.is_connected(old) {
                                self.doc.remove_child(old);
                            }
                        }
                        let created = self.doc.create_element(&node.tag);
                        self.by_key.insert(node.key, created);
                        created
                    }
                }
            };
            index_to_node.insert(index, mirror_node);

            if !node.is_body {
                out_of_band |= self.update_node(mirror_node, node);
            }
        }

        // Pass 2: structure. Parents come before children in snapshot
        // order, so attachment proceeds top-down.
        for (index, node) in parsed.iter().enumerate() {
            let Some(node) = node else { continue };
            if node.is_body {
                continue;
            }
            let Some(mirror_node) = index_to_node.get(&index).copied() else {
                continue;
            };
            let Some(parent_node) = node
                .parent_index
                .and_then(|p| index_to_node.get(&p))
                .copied()
            else {
                continue;
            };
            let current_parent = self.doc.element(mirror_node).and_then(|e| e.parent());
            if current_parent != Some(parent_node) || !self.doc.is_connected(mirror_node) {
                self.doc.append_child(parent_node, mirror_node);
            }
        }

        // Pass 3: detach mirror nodes that vanished from the capture. The
        // node data (and its key mapping) is retained so a reappearing
        // element keeps its identity.
        let vanished: Vec<NodeId> = self
            .by_key
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(_, node)| *node)
            .collect();
        for node in vanished {
            if self.doc.is_connected(node) && node != self.doc.body() {
                self.doc.remove_child(node);
            }
        }

        Ok(out_of_band)
    }

    fn update_node(&mut self, mirror_node: NodeId, node: &ParsedNode) -> bool {
        let mut out_of_band = false;

        let (old_names, old_text, old_rect, old_style, old_value, old_checked, old_selected) = {
            let e = self.doc.element(mirror_node).expect("mirror node exists");
            (
                e.attr_names(),
                e.text.clone(),
                e.rect,
                e.style.clone(),
                e.value.clone(),
                e.checked,
                e.selected,
            )
        };

        for (k, v) in &node.attrs {
            let unchanged = self
                .doc
                .element(mirror_node)
                .and_then(|e| e.attr(k))
                .map(|old| old == v)
                .unwrap_or(false);
            if !unchanged {
                self.doc.set_attr(mirror_node, k, v);
            }
        }
        for name in old_names {
            if !node.attrs.iter().any(|(k, _)| *k == name) {
                self.doc.remove_attr(mirror_node, &name);
            }
        }

        if old_text != node.own_text {
            self.doc.set_text(mirror_node, &node.own_text);
        }
        if let Some(rect) = node.rect {
            if rect != old_rect {
                self.doc.set_rect(mirror_node, rect);
                out_of_band = true;
            }
        }
        if let Some(style) = &node.style {
            if *style != old_style {
                self.doc.set_style(mirror_node, style.clone());
            }
        }
        if let Some(value) = &node.value {
            if *value != old_value {
                self.doc.set_value(mirror_node, value);
            }
        }
        if node.checked != old_checked {
            self.doc.set_checked(mirror_node, node.checked);
            out_of_band = true;
        }
        if node.selected != old_selected {
            self.doc.set_selected(mirror_node, node.selected);
            out_of_band = true;
        }

        out_of_band
    }
}

/// One-shot build: a fresh mirror with the construction journal discarded.
pub fn document_from_snapshot(snapshot: &Value, url: &str, viewport: Viewport) -> Result<Document> {
    let mut mirror = Mirror::new(url, viewport);
    mirror.sync(snapshot)?;
    let mut doc = mirror.into_document();
    doc.take_mutations();
    Ok(doc)
}

fn string_at<'a>(strings: &'a [Value], idx: i64) -> Option<&'a str> {
    if idx < 0 {
        return None;
    }
    strings.get(idx as usize).and_then(|v| v.as_str())
}

fn int_column(nodes: &Value, name: &str) -> Vec<i64> {
    nodes
        .get(name)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default()
}

/// Index column of a DOMSnapshot "rare" boolean table.
fn rare_indexes(nodes: &Value, name: &str) -> Vec<i64> {
    nodes
        .get(name)
        .map(|table| int_column(table, "index"))
        .unwrap_or_default()
}

fn parse_snapshot(snapshot: &Value) -> Result<Vec<Option<ParsedNode>>> {
    let strings: Vec<Value> = snapshot
        .get("strings")
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| malformed("missing strings table"))?;

    let dom = snapshot
        .get("documents")
        .and_then(|d| d.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| malformed("no documents"))?;

    let nodes = dom.get("nodes").ok_or_else(|| malformed("no nodes"))?;
    let parent_index = int_column(nodes, "parentIndex");
    if parent_index.is_empty() {
        return Err(malformed("no parentIndex"));
    }
    let node_type = int_column(nodes, "nodeType");
    let node_name = int_column(nodes, "nodeName");
    let node_value = int_column(nodes, "nodeValue");
    let backend_ids = int_column(nodes, "backendNodeId");
    let attributes = nodes.get("attributes").and_then(|v| v.as_array());

    let count = parent_index.len();
    let mut parsed: Vec<Option<ParsedNode>> = Vec::with_capacity(count);
    let mut body_seen = false;

    for i in 0..count {
        let ty = node_type.get(i).copied().unwrap_or(0);
        if ty != 1 {
            parsed.push(None);
            continue;
        }
        let tag = string_at(&strings, node_name.get(i).copied().unwrap_or(-1))
            .unwrap_or("")
            .to_ascii_lowercase();
        let is_body = tag == "body" && !body_seen;
        if is_body {
            body_seen = true;
        }

        let mut attrs = Vec::new();
        if let Some(rows) = attributes {
            if let Some(pairs) = rows.get(i).and_then(|v| v.as_array()) {
                for pair in pairs.chunks(2) {
                    if let (Some(k), Some(v)) = (
                        pair.first()
                            .and_then(|v| v.as_i64())
                            .and_then(|idx| string_at(&strings, idx)),
                        pair.get(1)
                            .and_then(|v| v.as_i64())
                            .and_then(|idx| string_at(&strings, idx)),
                    ) {
                        attrs.push((k.to_string(), v.to_string()));
                    }
                }
            }
        }

        let key = backend_ids
            .get(i)
            .copied()
            .filter(|id| *id > 0)
            // No backend id: fall back to a per-index synthetic key.
            .unwrap_or(-(i as i64) - 1);

        parsed.push(Some(ParsedNode {
            key,
            parent_index: parent_index[i].try_into().ok(),
            tag,
            attrs,
            own_text: String::new(),
            rect: None,
            style: None,
            value: None,
            checked: false,
            selected: false,
            is_body,
        }));
    }

    // Fold text nodes into their parent element's own text.
    for i in 0..count {
        if node_type.get(i).copied().unwrap_or(0) != 3 {
            continue;
        }
        let Some(text) = string_at(&strings, node_value.get(i).copied().unwrap_or(-1)) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        let Ok(parent) = usize::try_from(parent_index[i]) else {
            continue;
        };
        if let Some(Some(p)) = parsed.get_mut(parent) {
            if !p.own_text.is_empty() {
                p.own_text.push(' ');
            }
            p.own_text.push_str(text.trim());
        }
    }

    // Rare-data tables: input values and boolean flags.
    if let Some(table) = nodes.get("inputValue") {
        let idxs = int_column(table, "index");
        let values = int_column(table, "value");
        for (slot, node_idx) in idxs.iter().enumerate() {
            let Ok(node_idx) = usize::try_from(*node_idx) else {
                continue;
            };
            if let (Some(Some(p)), Some(value)) = (
                parsed.get_mut(node_idx),
                values.get(slot).and_then(|idx| string_at(&strings, *idx)),
            ) {
                p.value = Some(value.to_string());
            }
        }
    }
    for node_idx in rare_indexes(nodes, "inputChecked") {
        if let Ok(node_idx) = usize::try_from(node_idx) {
            if let Some(Some(p)) = parsed.get_mut(node_idx) {
                p.checked = true;
            }
        }
    }
    for node_idx in rare_indexes(nodes, "optionSelected") {
        if let Ok(node_idx) = usize::try_from(node_idx) {
            if let Some(Some(p)) = parsed.get_mut(node_idx) {
                p.selected = true;
            }
        }
    }

    // Layout rows: bounds and the requested computed styles.
    if let Some(layout) = dom.get("layout") {
        let node_index = int_column(layout, "nodeIndex");
        let bounds = layout.get("bounds").and_then(|v| v.as_array());
        let styles = layout.get("styles").and_then(|v| v.as_array());

        for (row, idx) in node_index.iter().enumerate() {
            let Ok(idx) = usize::try_from(*idx) else {
                continue;
            };
            let Some(Some(p)) = parsed.get_mut(idx) else {
                continue;
            };
            if let Some(b) = bounds.and_then(|b| b.get(row)).and_then(|v| v.as_array()) {
                let get = |i: usize| b.get(i).and_then(|v| v.as_f64()).unwrap_or(0.0);
                p.rect = Some(Rect {
                    x: get(0).round() as i32,
                    y: get(1).round() as i32,
                    w: get(2).round() as i32,
                    h: get(3).round() as i32,
                });
            }
            if let Some(row_styles) = styles.and_then(|s| s.get(row)).and_then(|v| v.as_array()) {
                let style_str = |i: usize| {
                    row_styles
                        .get(i)
                        .and_then(|v| v.as_i64())
                        .and_then(|idx| string_at(&strings, idx))
                        .unwrap_or("")
                };
                let opacity = style_str(2).parse::<f64>().unwrap_or(1.0);
                p.style = Some(Style {
                    display_none: style_str(0) == "none",
                    visibility_hidden: style_str(1) == "hidden",
                    opacity_zero: opacity == 0.0,
                    cursor_pointer: style_str(3) == "pointer",
                    background_color: non_empty(style_str(4)),
                    text_color: non_empty(style_str(5)),
                });
            }
        }
    }

    Ok(parsed)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vp() -> Viewport {
        Viewport {
            width: 1024,
            height: 768,
        }
    }

    // strings: 0=BODY 1=BUTTON 2=aria-label 3="Sign in" 4=#text 5=Go
    //          6=block 7=visible 8=1 9=pointer 10="Buy"
    fn base_snapshot() -> Value {
        json!({
            "strings": ["BODY", "BUTTON", "aria-label", "Sign in", "#text", "Go",
                        "block", "visible", "1", "pointer", "Buy"],
            "documents": [{
                "nodes": {
                    "parentIndex": [-1, 0, 1],
                    "nodeType": [1, 1, 3],
                    "nodeName": [0, 1, 4],
                    "nodeValue": [-1, -1, 5],
                    "backendNodeId": [10, 11, 12],
                    "attributes": [[], [2, 3], []]
                },
                "layout": {
                    "nodeIndex": [1],
                    "bounds": [[10.0, 20.0, 100.0, 30.0]],
                    "styles": [[6, 7, 8, 9, -1, -1]]
                }
            }]
        })
    }

    #[test]
    fn builds_mirror_from_minimal_snapshot() {
        let doc = document_from_snapshot(&base_snapshot(), "https://a/", vp()).unwrap();
        let body = doc.body();
        let children = doc.element(body).unwrap().children().to_vec();
        assert_eq!(children.len(), 1);
        let btn = children[0];
        let el = doc.element(btn).unwrap();
        assert_eq!(el.tag, "button");
        assert_eq!(el.attr("aria-label"), Some("Sign in"));
        assert_eq!(el.text, "Go");
        assert_eq!(
            el.rect,
            Rect {
                x: 10,
                y: 20,
                w: 100,
                h: 30
            }
        );
        assert!(el.style.cursor_pointer);
        assert!(!el.style.display_none);
    }

    #[test]
    fn resync_preserves_node_identity_by_backend_id() {
        let mut mirror = Mirror::new("https://a/", vp());
        mirror.sync(&base_snapshot()).unwrap();
        let before = mirror.document().element(mirror.document().body()).unwrap().children()[0];
        mirror.document_mut().take_mutations();

        // Same backend id, changed label.
        let mut next = base_snapshot();
        next["documents"][0]["nodes"]["attributes"][1] = json!([2, 10]);
        mirror.sync(&next).unwrap();

        let after = mirror.document().element(mirror.document().body()).unwrap().children()[0];
        assert_eq!(before, after);
        assert_eq!(
            mirror.document().element(after).unwrap().attr("aria-label"),
            Some("Buy")
        );
        // The attribute change went through the journal.
        let muts = mirror.document_mut().take_mutations();
        assert!(muts
            .iter()
            .any(|m| matches!(m, crate::dom::Mutation::Attribute { name, .. } if name == "aria-label")));
    }

    #[test]
    fn resync_detaches_vanished_nodes_and_restores_them() {
        let mut mirror = Mirror::new("https://a/", vp());
        mirror.sync(&base_snapshot()).unwrap();
        let btn = mirror.document().element(mirror.document().body()).unwrap().children()[0];

        // Capture without the button.
        let empty = json!({
            "strings": ["BODY"],
            "documents": [{
                "nodes": {
                    "parentIndex": [-1],
                    "nodeType": [1],
                    "nodeName": [0],
                    "nodeValue": [-1],
                    "backendNodeId": [10],
                    "attributes": [[]]
                }
            }]
        });
        mirror.sync(&empty).unwrap();
        assert!(!mirror.document().is_connected(btn));

        // The same backend id reappears: same mirror node.
        mirror.sync(&base_snapshot()).unwrap();
        assert!(mirror.document().is_connected(btn));
    }

    #[test]
    fn geometry_change_is_reported_out_of_band() {
        let mut mirror = Mirror::new("https://a/", vp());
        assert!(mirror.sync(&base_snapshot()).unwrap());

        // Unchanged capture: nothing out of band.
        assert!(!mirror.sync(&base_snapshot()).unwrap());

        let mut moved = base_snapshot();
        moved["documents"][0]["layout"]["bounds"][0] = json!([10.0, 300.0, 100.0, 30.0]);
        assert!(mirror.sync(&moved).unwrap());
    }

    #[test]
    fn missing_strings_table_is_rejected() {
        let err =
            document_from_snapshot(&json!({"documents": []}), "https://a/", Viewport::default())
                .unwrap_err();
        assert!(err.to_string().contains("strings"));
    }
}
