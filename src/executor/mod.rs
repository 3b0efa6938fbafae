//! Command execution against the DOM mirror.
//!
//! Converts a routed command into the synthesized input-event sequence the
//! page would see, applies the native activation effects, and produces
//! exactly one acknowledgment. Event sequences land in the document's event
//! journal; the agent binary forwards them to the browser's Input domain.

use crate::dom::{Document, NodeId, SyntheticEvent};
use crate::error::PagelensError;
use crate::perception::candidate::{is_interactive, is_occluded};
use crate::perception::{search, PerceptionEngine};
use crate::protocol::{
    ActionCandidate, Command, CommandAck, MouseCurve, SearchFilters, SelectValue, TypeMode,
    Verification,
};
use serde_json::json;
use std::time::Duration;

/// Smooth-scroll animation window.
const SCROLL_SETTLE: Duration = Duration::from_millis(300);

const DEFAULT_MOVE_STEPS: u32 = 10;

pub struct Executor<'a> {
    doc: &'a mut Document,
    engine: &'a mut PerceptionEngine,
}

impl<'a> Executor<'a> {
    pub fn new(doc: &'a mut Document, engine: &'a mut PerceptionEngine) -> Self {
        Self { doc, engine }
    }

    pub async fn execute(&mut self, command: &Command) -> CommandAck {
        let command_id = command.command_id().to_string();
        match command {
            Command::Click {
                id,
                button,
                modifiers,
                click_count,
                ..
            } => self.click(&command_id, id, *button, modifiers, *click_count),
            Command::Type {
                id,
                text,
                mode,
                clear_first,
                delay,
                ..
            } => {
                self.type_text(&command_id, id, text, *mode, *clear_first, *delay)
                    .await
            }
            Command::Hover { id, duration, .. } => self.hover(&command_id, id, *duration).await,
            Command::Scroll {
                dx, dy, target, ..
            } => self.scroll(&command_id, *dx, *dy, target.as_deref()).await,
            Command::Focus { id, .. } => self.focus(&command_id, id),
            Command::Select { id, value, .. } => self.select(&command_id, id, value),
            Command::MoveMouse {
                x,
                y,
                steps,
                curve,
                duration,
                ..
            } => {
                self.move_mouse(&command_id, *x, *y, *steps, *curve, *duration)
                    .await
            }
            Command::Query {
                search, filters, ..
            } => self.query(&command_id, search, filters.as_ref()),
        }
    }

    fn resolve(&self, id: &str) -> Result<NodeId, String> {
        self.engine
            .resolve(id)
            .filter(|n| self.doc.is_connected(*n))
            .ok_or_else(|| PagelensError::UnknownElement(id.to_string()).to_string())
    }

    /// Post-execution re-read of the target.
    fn verify(&self, node: NodeId, id: &str) -> Verification {
        let still_visible = self.doc.is_connected(node);
        let rect = self.doc.element(node).map(|e| e.rect).unwrap_or_default();
        let hit_test_ok = still_visible && !is_occluded(self.doc, node);
        Verification {
            id: id.to_string(),
            still_visible,
            hit_test_ok,
            rect_changed: false,
            new_rect: Some(rect),
        }
    }

    fn mouse_event(
        node: NodeId,
        kind: &str,
        x: i32,
        y: i32,
        button: u8,
        detail: u32,
        modifiers: &[String],
    ) -> SyntheticEvent {
        SyntheticEvent {
            target: node,
            kind: kind.to_string(),
            button,
            detail,
            modifiers: modifiers.to_vec(),
            x,
            y,
            key: None,
        }
    }

    fn focusable(&self, node: NodeId) -> bool {
        is_interactive(self.doc, node)
            && !self
                .doc
                .element(node)
                .map(|e| e.has_attr("disabled"))
                .unwrap_or(true)
    }

    // ── click ───────────────────────────────────────────────────

    fn click(
        &mut self,
        command_id: &str,
        id: &str,
        button: u8,
        modifiers: &[String],
        click_count: u32,
    ) -> CommandAck {
        let node = match self.resolve(id) {
            Ok(n) => n,
            Err(reason) => return CommandAck::fail(command_id, reason),
        };
        let hit = self
            .doc
            .element(node)
            .map(|e| e.rect.center())
            .unwrap_or_default();

        let count = click_count.max(1);
        for n in 1..=count {
            for kind in ["mousedown", "mouseup", "click"] {
                self.doc.dispatch(Self::mouse_event(
                    node, kind, hit.cx, hit.cy, button, n, modifiers,
                ));
            }
        }
        if self.focusable(node) {
            self.doc.set_focus(Some(node));
        }
        self.activate(node);

        CommandAck::verify(command_id, self.verify(node, id))
    }

    /// Native activation effects for controls the mirror models.
    fn activate(&mut self, node: NodeId) {
        let Some(e) = self.doc.element(node) else { return };
        let tag = e.tag.clone();
        let input_type = e.attr("type").unwrap_or("text").to_ascii_lowercase();
        let checked = e.checked;
        let open = e.open;
        let parent = e.parent();

        match tag.as_str() {
            "input" if input_type == "checkbox" => {
                self.doc.set_checked(node, !checked);
                self.doc.dispatch(SyntheticEvent::new(node, "change"));
            }
            "input" if input_type == "radio" => {
                self.doc.set_checked(node, true);
                self.doc.dispatch(SyntheticEvent::new(node, "change"));
            }
            "summary" => {
                let details = parent.filter(|p| {
                    self.doc
                        .element(*p)
                        .map(|e| e.tag == "details")
                        .unwrap_or(false)
                });
                if let Some(details) = details {
                    let next = !self.doc.element(details).map(|e| e.open).unwrap_or(false);
                    self.doc.set_open(details, next);
                    self.doc.dispatch(SyntheticEvent::new(details, "toggle"));
                }
            }
            "details" => {
                self.doc.set_open(node, !open);
                self.doc.dispatch(SyntheticEvent::new(node, "toggle"));
            }
            _ => {}
        }
    }

    // ── type ────────────────────────────────────────────────────

    fn text_entry_kind(&self, node: NodeId) -> Option<TextEntry> {
        let e = self.doc.element(node)?;
        if e.attr("contenteditable") == Some("true") {
            return Some(TextEntry::ContentEditable);
        }
        match e.tag.as_str() {
            "textarea" => Some(TextEntry::Value),
            "input" => {
                match e.attr("type").unwrap_or("text").to_ascii_lowercase().as_str() {
                    "checkbox" | "radio" | "button" | "submit" | "reset" | "image" | "range"
                    | "file" | "color" => None,
                    _ => Some(TextEntry::Value),
                }
            }
            _ => None,
        }
    }

    async fn type_text(
        &mut self,
        command_id: &str,
        id: &str,
        text: &str,
        mode: TypeMode,
        clear_first: bool,
        delay: u64,
    ) -> CommandAck {
        let node = match self.resolve(id) {
            Ok(n) => n,
            Err(reason) => return CommandAck::fail(command_id, reason),
        };
        let Some(entry) = self.text_entry_kind(node) else {
            return CommandAck::fail(
                command_id,
                PagelensError::InvalidTarget(format!("{} is not a text input", id)).to_string(),
            );
        };

        self.doc.set_focus(Some(node));
        self.doc.dispatch(SyntheticEvent::new(node, "focus"));

        let mut current = match entry {
            TextEntry::Value => self.doc.element(node).map(|e| e.value.clone()),
            TextEntry::ContentEditable => self.doc.element(node).map(|e| e.text.clone()),
        }
        .unwrap_or_default();

        if clear_first || mode == TypeMode::Replace {
            current.clear();
            self.write_text(node, entry, &current);
        }

        // Insertion cursor: typed text lands in order, before or after the
        // existing content.
        let mut cursor = match mode {
            TypeMode::Prepend => 0,
            _ => current.chars().count(),
        };

        for ch in text.chars() {
            let key = ch.to_string();
            let mut keydown = SyntheticEvent::new(node, "keydown");
            keydown.key = Some(key.clone());
            self.doc.dispatch(keydown);

            let byte_pos = char_to_byte(&current, cursor);
            current.insert(byte_pos, ch);
            cursor += 1;
            self.write_text(node, entry, &current);
            self.doc.dispatch(SyntheticEvent::new(node, "input"));

            let mut keyup = SyntheticEvent::new(node, "keyup");
            keyup.key = Some(key);
            self.doc.dispatch(keyup);

            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        self.doc.dispatch(SyntheticEvent::new(node, "change"));
        CommandAck::ok(command_id, Some(json!({ "value": current })))
    }

    fn write_text(&mut self, node: NodeId, entry: TextEntry, text: &str) {
        match entry {
            TextEntry::Value => self.doc.set_value(node, text),
            TextEntry::ContentEditable => self.doc.set_text(node, text),
        }
    }

    // ── hover ───────────────────────────────────────────────────

    async fn hover(&mut self, command_id: &str, id: &str, duration: Option<u64>) -> CommandAck {
        let node = match self.resolve(id) {
            Ok(n) => n,
            Err(reason) => return CommandAck::fail(command_id, reason),
        };
        let hit = self
            .doc
            .element(node)
            .map(|e| e.rect.center())
            .unwrap_or_default();
        for kind in ["mouseenter", "mouseover", "mousemove"] {
            self.doc
                .dispatch(Self::mouse_event(node, kind, hit.cx, hit.cy, 0, 0, &[]));
        }
        if let Some(ms) = duration {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        CommandAck::verify(command_id, self.verify(node, id))
    }

    // ── scroll ──────────────────────────────────────────────────

    async fn scroll(
        &mut self,
        command_id: &str,
        dx: i32,
        dy: i32,
        target: Option<&str>,
    ) -> CommandAck {
        let result = match target {
            Some(t) if t != "viewport" => {
                let node = match self.resolve(t) {
                    Ok(n) => n,
                    Err(reason) => return CommandAck::fail(command_id, reason),
                };
                self.doc.scroll_element_by(node, dx, dy);
                let e = self.doc.element(node).expect("scrolled node is live");
                json!({ "scrollX": e.scroll_x, "scrollY": e.scroll_y })
            }
            _ => {
                self.doc.scroll_by(dx, dy);
                json!({ "scrollX": self.doc.scroll_x, "scrollY": self.doc.scroll_y })
            }
        };
        tokio::time::sleep(SCROLL_SETTLE).await;
        CommandAck::ok(command_id, Some(result))
    }

    // ── focus ───────────────────────────────────────────────────

    fn focus(&mut self, command_id: &str, id: &str) -> CommandAck {
        let node = match self.resolve(id) {
            Ok(n) => n,
            Err(reason) => return CommandAck::fail(command_id, reason),
        };
        if !self.focusable(node) {
            return CommandAck::fail(
                command_id,
                PagelensError::InvalidTarget(format!("{} is not focusable", id)).to_string(),
            );
        }
        self.doc.set_focus(Some(node));
        self.doc.dispatch(SyntheticEvent::new(node, "focus"));
        CommandAck::ok(command_id, None)
    }

    // ── select ──────────────────────────────────────────────────

    fn select(&mut self, command_id: &str, id: &str, value: &SelectValue) -> CommandAck {
        let node = match self.resolve(id) {
            Ok(n) => n,
            Err(reason) => return CommandAck::fail(command_id, reason),
        };
        let Some(e) = self.doc.element(node) else {
            return CommandAck::fail(command_id, format!("Unknown element: {}", id));
        };
        if e.tag != "select" {
            return CommandAck::fail(
                command_id,
                PagelensError::InvalidTarget(format!("{} is not a select", id)).to_string(),
            );
        }
        let multiple = e.has_attr("multiple");
        let options = self.collect_options(node);
        let wanted = value.values();

        if multiple {
            for opt in &options {
                self.doc.set_selected(*opt, false);
            }
        }

        let mut chosen = Vec::new();
        for opt in &options {
            let (opt_value, opt_text) = {
                let el = self.doc.element(*opt).expect("option is live");
                (
                    el.attr("value").unwrap_or("").to_string(),
                    self.doc.text_content(*opt),
                )
            };
            let matched = wanted
                .iter()
                .any(|w| *w == opt_value || w.trim() == opt_text.trim());
            if matched && (multiple || chosen.is_empty()) {
                self.doc.set_selected(*opt, true);
                chosen.push(if opt_value.is_empty() {
                    opt_text.trim().to_string()
                } else {
                    opt_value
                });
            } else if !multiple {
                self.doc.set_selected(*opt, false);
            }
        }

        if chosen.is_empty() {
            return CommandAck::fail(
                command_id,
                format!("No option matching {:?} in {}", wanted, id),
            );
        }

        self.doc.set_value(node, &chosen.join(","));
        self.doc.dispatch(SyntheticEvent::new(node, "change"));
        CommandAck::ok(command_id, Some(json!({ "value": chosen.join(",") })))
    }

    fn collect_options(&self, select: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .doc
            .element(select)
            .map(|e| e.children().to_vec())
            .unwrap_or_default();
        while let Some(n) = stack.pop() {
            if let Some(e) = self.doc.element(n) {
                if e.tag == "option" {
                    out.push(n);
                }
                stack.extend(e.children().iter().copied());
            }
        }
        out.reverse();
        out
    }

    // ── move_mouse ──────────────────────────────────────────────

    async fn move_mouse(
        &mut self,
        command_id: &str,
        x: i32,
        y: i32,
        steps: Option<u32>,
        curve: Option<MouseCurve>,
        duration: Option<u64>,
    ) -> CommandAck {
        let vp = self.doc.viewport();
        let (sx, sy) = (vp.width as f64 / 2.0, vp.height as f64 / 2.0);
        let steps = steps.unwrap_or(DEFAULT_MOVE_STEPS).max(1);
        let curve = curve.unwrap_or_default();
        let step_delay = duration.unwrap_or(0) / steps as u64;

        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            let eased = ease(curve, t);
            let px = (sx + (x as f64 - sx) * eased).round() as i32;
            let py = (sy + (y as f64 - sy) * eased).round() as i32;
            let target = self
                .doc
                .element_from_point(px, py)
                .unwrap_or_else(|| self.doc.body());
            self.doc
                .dispatch(Self::mouse_event(target, "mousemove", px, py, 0, 0, &[]));
            if step_delay > 0 {
                tokio::time::sleep(Duration::from_millis(step_delay)).await;
            }
        }
        CommandAck::ok(command_id, None)
    }

    // ── query ───────────────────────────────────────────────────

    fn query(
        &mut self,
        command_id: &str,
        q: &str,
        filters: Option<&SearchFilters>,
    ) -> CommandAck {
        let default_filters = SearchFilters::default();
        let filters = filters.unwrap_or(&default_filters);
        let mut matches: Vec<&ActionCandidate> =
            search::search(self.engine.current().values(), q, filters);
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        let matches: Vec<ActionCandidate> = matches.into_iter().cloned().collect();
        CommandAck::ok(command_id, Some(json!({ "matches": matches })))
    }
}

#[derive(Clone, Copy)]
enum TextEntry {
    Value,
    ContentEditable,
}

fn char_to_byte(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn ease(curve: MouseCurve, t: f64) -> f64 {
    match curve {
        MouseCurve::Linear => t,
        MouseCurve::EaseInOut => {
            if t < 0.5 {
                2.0 * t * t
            } else {
                1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
            }
        }
        MouseCurve::Smoothstep => t * t * (3.0 - 2.0 * t),
    }
}
