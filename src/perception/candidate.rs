//! Candidate selection and extraction: which elements are interactive, and
//! what the controller gets to see about each one.

use crate::dom::{Document, NodeId};
use crate::protocol::{ActionCandidate, CandidateCtx, CandidateState, StyleHint};

/// ARIA roles that make an element interactive regardless of tag.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "tab",
    "switch",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "slider",
    "spinbutton",
    "searchbox",
    "textbox",
];

/// Accessible names from text content are cut here.
const NAME_TEXT_LIMIT: usize = 80;

pub fn is_interactive(doc: &Document, node: NodeId) -> bool {
    let Some(e) = doc.element(node) else {
        return false;
    };
    match e.tag.as_str() {
        "a" => {
            if e.has_attr("href") {
                return true;
            }
        }
        "button" | "input" | "select" | "textarea" | "summary" | "details" => return true,
        "label" => {
            if e.has_attr("for") {
                return true;
            }
        }
        _ => {}
    }
    if e.attr("tabindex")
        .and_then(|v| v.parse::<i32>().ok())
        .map(|v| v > 0)
        .unwrap_or(false)
    {
        return true;
    }
    if e.has_attr("onclick") {
        return true;
    }
    if e.attr("contenteditable") == Some("true") {
        return true;
    }
    if let Some(role) = e.attr("role") {
        if INTERACTIVE_ROLES.contains(&role.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    false
}

/// Visibility filter. Occlusion is computed separately and never excludes.
pub fn is_visible(doc: &Document, node: NodeId) -> bool {
    let Some(e) = doc.element(node) else {
        return false;
    };
    if e.rect.is_empty()
        || e.style.display_none
        || e.style.visibility_hidden
        || e.style.opacity_zero
    {
        return false;
    }
    let vp = doc.viewport();
    !e.rect.outside_viewport(vp.width, vp.height)
}

/// ARIA role, explicit or derived from tag/type.
pub fn derive_role(doc: &Document, node: NodeId) -> String {
    let Some(e) = doc.element(node) else {
        return "generic".to_string();
    };
    if let Some(role) = e.attr("role") {
        if !role.is_empty() {
            return role.to_ascii_lowercase();
        }
    }
    match e.tag.as_str() {
        "a" if e.has_attr("href") => "link",
        "button" => "button",
        "input" => match e.attr("type").unwrap_or("text").to_ascii_lowercase().as_str() {
            "button" | "submit" | "reset" | "image" => "button",
            "checkbox" => "checkbox",
            "radio" => "radio",
            "range" => "slider",
            "search" => "searchbox",
            "number" => "spinbutton",
            _ => "textbox",
        },
        "select" => {
            if e.has_attr("multiple") {
                "listbox"
            } else {
                "combobox"
            }
        }
        "textarea" => "textbox",
        "summary" => "button",
        "option" => "option",
        "nav" => "navigation",
        "main" => "main",
        "header" => "banner",
        "footer" => "contentinfo",
        "aside" => "complementary",
        "form" => "form",
        _ => "generic",
    }
    .to_string()
}

fn element_by_dom_id(doc: &Document, dom_id: &str) -> Option<NodeId> {
    doc.iter_connected()
        .into_iter()
        .find(|n| doc.element(*n).and_then(|e| e.attr("id")) == Some(dom_id))
}

fn truncate(s: String, limit: usize) -> String {
    if s.chars().count() <= limit {
        s
    } else {
        s.chars().take(limit).collect()
    }
}

/// Accessible name, in priority order: aria-label → aria-labelledby target
/// text → associated label text → title → placeholder → truncated text.
pub fn accessible_name(doc: &Document, node: NodeId) -> String {
    let Some(e) = doc.element(node) else {
        return String::new();
    };
    if let Some(label) = e.attr("aria-label") {
        if !label.trim().is_empty() {
            return label.trim().to_string();
        }
    }
    if let Some(refs) = e.attr("aria-labelledby") {
        let text: Vec<String> = refs
            .split_whitespace()
            .filter_map(|r| element_by_dom_id(doc, r))
            .map(|n| doc.text_content(n))
            .filter(|t| !t.is_empty())
            .collect();
        if !text.is_empty() {
            return text.join(" ");
        }
    }
    if let Some(label) = associated_label(doc, node) {
        let text = doc.text_content(label);
        if !text.is_empty() {
            return text;
        }
    }
    if let Some(title) = e.attr("title") {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }
    if let Some(placeholder) = e.attr("placeholder") {
        if !placeholder.trim().is_empty() {
            return placeholder.trim().to_string();
        }
    }
    truncate(doc.text_content(node), NAME_TEXT_LIMIT)
}

/// A `<label for=…>` pointing at this element, or an enclosing `<label>`.
fn associated_label(doc: &Document, node: NodeId) -> Option<NodeId> {
    if let Some(own_id) = doc.element(node).and_then(|e| e.attr("id")) {
        let hit = doc.iter_connected().into_iter().find(|n| {
            doc.element(*n)
                .map(|e| e.tag == "label" && e.attr("for") == Some(own_id))
                .unwrap_or(false)
        });
        if hit.is_some() {
            return hit;
        }
    }
    doc.ancestors(node)
        .into_iter()
        .find(|a| doc.element(*a).map(|e| e.tag == "label").unwrap_or(false))
}

pub fn extract_state(doc: &Document, node: NodeId) -> CandidateState {
    let Some(e) = doc.element(node) else {
        return CandidateState::default();
    };
    let aria_true = |name: &str| e.attr(name) == Some("true");
    let expanded = aria_true("aria-expanded")
        || e.open
        || (e.tag == "summary"
            && e.parent()
                .and_then(|p| doc.element(p))
                .map(|p| p.tag == "details" && p.open)
                .unwrap_or(false));
    CandidateState {
        disabled: e.has_attr("disabled") || aria_true("aria-disabled"),
        expanded,
        checked: e.checked || aria_true("aria-checked"),
        selected: e.selected || aria_true("aria-selected"),
        focused: doc.focused() == Some(node),
    }
}

pub fn extract_ctx(doc: &Document, node: NodeId) -> CandidateCtx {
    let mut ctx = CandidateCtx::default();
    let ancestors = doc.ancestors(node);
    ctx.depth = ancestors.len() as u32;
    for a in ancestors {
        let Some(e) = doc.element(a) else { continue };
        let role = e.attr("role").unwrap_or("");
        if e.tag == "dialog" || role == "dialog" || role == "alertdialog" {
            ctx.in_modal = true;
        }
        if e.tag == "nav" || role == "navigation" {
            ctx.in_nav = true;
        }
        if e.tag == "form" && !ctx.in_form {
            ctx.in_form = true;
            ctx.form_id = e.attr("id").map(|v| v.to_string());
        }
    }
    ctx
}

pub fn extract_style_hint(doc: &Document, node: NodeId) -> StyleHint {
    let Some(e) = doc.element(node) else {
        return StyleHint::default();
    };
    let classes = e.attr("class").unwrap_or("").to_ascii_lowercase();
    let tokens: Vec<&str> = classes.split_whitespace().collect();
    let variant = e.attr("data-variant").unwrap_or("").to_ascii_lowercase();

    let is_primary = tokens.iter().any(|t| t.contains("primary") || *t == "cta")
        || variant.contains("primary")
        || (matches!(e.tag.as_str(), "button" | "input")
            && e.attr("type").map(|t| t.eq_ignore_ascii_case("submit")).unwrap_or(false));
    let is_danger = tokens
        .iter()
        .any(|t| t.contains("danger") || t.contains("destructive") || t.contains("delete"))
        || variant.contains("danger");

    StyleHint {
        is_primary,
        is_danger,
        cursor_pointer: e.style.cursor_pointer,
        background_color: e.style.background_color.clone(),
        text_color: e.style.text_color.clone(),
    }
}

/// True when the topmost element at the hit point is unrelated to the node.
pub fn is_occluded(doc: &Document, node: NodeId) -> bool {
    let Some(e) = doc.element(node) else {
        return false;
    };
    let hit = e.rect.center();
    match doc.element_from_point(hit.cx, hit.cy) {
        Some(top) => !doc.related(top, node),
        None => false,
    }
}

/// Build the full candidate record for one element.
pub fn extract(doc: &Document, node: NodeId, id: String) -> ActionCandidate {
    let vp = doc.viewport();
    let e = doc.element(node).expect("extract on live node");
    let rect = e.rect;
    let value = if e.value.is_empty() {
        None
    } else {
        Some(e.value.clone())
    };
    ActionCandidate {
        id,
        rect,
        rect_n: rect.normalized(vp.width, vp.height),
        hit: rect.center(),
        role: derive_role(doc, node),
        tag: e.tag.clone(),
        name: accessible_name(doc, node),
        aria: e.attr("aria-label").unwrap_or("").to_string(),
        placeholder: e.attr("placeholder").map(|v| v.to_string()),
        value,
        href: e.attr("href").map(|v| v.to_string()),
        state: extract_state(doc, node),
        ctx: extract_ctx(doc, node),
        style_hint: extract_style_hint(doc, node),
        occluded: is_occluded(doc, node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Rect, Viewport};

    fn doc() -> Document {
        Document::new(
            "https://example.com/",
            Viewport {
                width: 1024,
                height: 768,
            },
        )
    }

    fn rect() -> Rect {
        Rect {
            x: 10,
            y: 10,
            w: 100,
            h: 30,
        }
    }

    #[test]
    fn anchors_need_href_to_be_interactive() {
        let mut d = doc();
        let a = d.create_element("a");
        d.set_rect(a, rect());
        let body = d.body();
        d.append_child(body, a);
        assert!(!is_interactive(&d, a));
        d.set_attr(a, "href", "/next");
        assert!(is_interactive(&d, a));
        assert_eq!(derive_role(&d, a), "link");
    }

    #[test]
    fn aria_role_makes_divs_interactive() {
        let mut d = doc();
        let div = d.create_element("div");
        d.set_attr(div, "role", "menuitem");
        let body = d.body();
        d.append_child(body, div);
        assert!(is_interactive(&d, div));
        assert_eq!(derive_role(&d, div), "menuitem");
    }

    #[test]
    fn input_roles_follow_type() {
        let mut d = doc();
        let body = d.body();
        for (ty, role) in [
            ("submit", "button"),
            ("checkbox", "checkbox"),
            ("radio", "radio"),
            ("range", "slider"),
            ("search", "searchbox"),
            ("email", "textbox"),
        ] {
            let input = d.create_element("input");
            d.set_attr(input, "type", ty);
            d.append_child(body, input);
            assert_eq!(derive_role(&d, input), role, "type={}", ty);
        }
        let select = d.create_element("select");
        d.append_child(body, select);
        assert_eq!(derive_role(&d, select), "combobox");
        d.set_attr(select, "multiple", "");
        assert_eq!(derive_role(&d, select), "listbox");
    }

    #[test]
    fn visibility_filter_excludes_offscreen_and_hidden() {
        let mut d = doc();
        let body = d.body();
        let btn = d.create_element("button");
        d.set_rect(btn, rect());
        d.append_child(body, btn);
        assert!(is_visible(&d, btn));

        let off = d.create_element("button");
        d.set_rect(
            off,
            Rect {
                x: 2000,
                y: 0,
                w: 50,
                h: 20,
            },
        );
        d.append_child(body, off);
        assert!(!is_visible(&d, off));

        let zero = d.create_element("button");
        d.append_child(body, zero);
        assert!(!is_visible(&d, zero));
    }

    #[test]
    fn name_priority_prefers_aria_label() {
        let mut d = doc();
        let body = d.body();
        let input = d.create_element("input");
        d.set_attr(input, "placeholder", "Search…");
        d.set_attr(input, "title", "Find things");
        d.append_child(body, input);
        assert_eq!(accessible_name(&d, input), "Find things");
        d.set_attr(input, "aria-label", "Site search");
        assert_eq!(accessible_name(&d, input), "Site search");
    }

    #[test]
    fn name_falls_back_through_labelledby_and_label() {
        let mut d = doc();
        let body = d.body();

        let caption = d.create_element("span");
        d.set_attr(caption, "id", "cap");
        d.set_text(caption, "Billing address");
        d.append_child(body, caption);

        let input = d.create_element("input");
        d.set_attr(input, "aria-labelledby", "cap");
        d.append_child(body, input);
        assert_eq!(accessible_name(&d, input), "Billing address");

        let label = d.create_element("label");
        d.set_attr(label, "for", "email");
        d.set_text(label, "Email");
        d.append_child(body, label);
        let email = d.create_element("input");
        d.set_attr(email, "id", "email");
        d.append_child(body, email);
        assert_eq!(accessible_name(&d, email), "Email");
    }

    #[test]
    fn ctx_flags_reflect_ancestry() {
        let mut d = doc();
        let body = d.body();
        let dialog = d.create_element("div");
        d.set_attr(dialog, "role", "dialog");
        let form = d.create_element("form");
        d.set_attr(form, "id", "checkout");
        let btn = d.create_element("button");
        d.append_child(form, btn);
        d.append_child(dialog, form);
        d.append_child(body, dialog);

        let ctx = extract_ctx(&d, btn);
        assert!(ctx.in_modal);
        assert!(!ctx.in_nav);
        assert!(ctx.in_form);
        assert_eq!(ctx.form_id.as_deref(), Some("checkout"));
        assert_eq!(ctx.depth, 3);
    }

    #[test]
    fn occlusion_annotates_covered_elements() {
        let mut d = doc();
        let body = d.body();
        let btn = d.create_element("button");
        d.set_rect(btn, rect());
        d.append_child(body, btn);
        assert!(!is_occluded(&d, btn));

        let overlay = d.create_element("div");
        d.set_rect(
            overlay,
            Rect {
                x: 0,
                y: 0,
                w: 1024,
                h: 768,
            },
        );
        d.append_child(body, overlay);
        assert!(is_occluded(&d, btn));
    }

    #[test]
    fn descendant_at_hit_point_is_not_occlusion() {
        let mut d = doc();
        let body = d.body();
        let btn = d.create_element("button");
        d.set_rect(btn, rect());
        let icon = d.create_element("span");
        d.set_rect(
            icon,
            Rect {
                x: 40,
                y: 15,
                w: 40,
                h: 20,
            },
        );
        d.append_child(btn, icon);
        d.append_child(body, btn);
        assert!(!is_occluded(&d, btn));
    }

    #[test]
    fn style_hint_reads_classes_and_submit_type() {
        let mut d = doc();
        let body = d.body();
        let btn = d.create_element("button");
        d.set_attr(btn, "class", "btn btn-primary");
        d.append_child(body, btn);
        assert!(extract_style_hint(&d, btn).is_primary);

        let del = d.create_element("button");
        d.set_attr(del, "class", "btn-delete");
        d.append_child(body, del);
        assert!(extract_style_hint(&d, del).is_danger);

        let submit = d.create_element("input");
        d.set_attr(submit, "type", "submit");
        d.append_child(body, submit);
        assert!(extract_style_hint(&d, submit).is_primary);
    }

    #[test]
    fn disabled_state_reads_attr_and_aria() {
        let mut d = doc();
        let body = d.body();
        let btn = d.create_element("button");
        d.append_child(body, btn);
        assert!(!extract_state(&d, btn).disabled);
        d.set_attr(btn, "aria-disabled", "true");
        assert!(extract_state(&d, btn).disabled);
    }
}
