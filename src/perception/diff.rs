//! Snapshot-to-snapshot diffing. A delta entry carries `id` plus only the
//! fields that changed.

use crate::protocol::{ActionCandidate, CandidateDelta, CandidateUpdate};
use std::collections::HashMap;

/// Rect components within this many pixels are considered unchanged.
pub const RECT_TOLERANCE: i32 = 2;

pub fn diff_candidates(
    prev: &HashMap<String, ActionCandidate>,
    next: &HashMap<String, ActionCandidate>,
) -> CandidateDelta {
    let mut delta = CandidateDelta::default();

    let mut removed: Vec<String> = prev
        .keys()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();
    removed.sort();
    delta.removed = removed;

    let mut added_ids: Vec<&String> = next
        .keys()
        .filter(|id| !prev.contains_key(*id))
        .collect();
    added_ids.sort();
    delta.added = added_ids
        .into_iter()
        .map(|id| next[id].clone())
        .collect();

    let mut shared: Vec<&String> = next.keys().filter(|id| prev.contains_key(*id)).collect();
    shared.sort();
    for id in shared {
        let update = diff_one(&prev[id], &next[id]);
        if !update.is_empty() {
            delta.updated.push(update);
        }
    }

    delta
}

fn diff_one(old: &ActionCandidate, new: &ActionCandidate) -> CandidateUpdate {
    let mut update = CandidateUpdate::new(new.id.clone());

    if !new.rect.within_tolerance(&old.rect, RECT_TOLERANCE) {
        update.rect = Some(new.rect);
        update.rect_n = Some(new.rect_n);
        update.hit = Some(new.hit);
    }
    if new.state != old.state {
        update.state = Some(new.state);
    }
    if new.name != old.name {
        update.name = Some(new.name.clone());
    }
    if new.value != old.value {
        update.value = Some(new.value.clone().unwrap_or_default());
    }
    if new.occluded != old.occluded {
        update.occluded = Some(new.occluded);
    }
    if new.ctx.in_modal != old.ctx.in_modal || new.ctx.in_nav != old.ctx.in_nav {
        update.ctx = Some(new.ctx.clone());
    }

    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CandidateCtx, CandidateState, Rect, StyleHint};

    fn candidate(id: &str, rect: Rect) -> ActionCandidate {
        ActionCandidate {
            id: id.to_string(),
            rect,
            rect_n: rect.normalized(1000, 1000),
            hit: rect.center(),
            role: "button".to_string(),
            tag: "button".to_string(),
            name: "Go".to_string(),
            aria: String::new(),
            placeholder: None,
            value: None,
            href: None,
            state: CandidateState::default(),
            ctx: CandidateCtx::default(),
            style_hint: StyleHint::default(),
            occluded: false,
        }
    }

    fn map(cands: Vec<ActionCandidate>) -> HashMap<String, ActionCandidate> {
        cands.into_iter().map(|c| (c.id.clone(), c)).collect()
    }

    fn r(x: i32) -> Rect {
        Rect { x, y: 0, w: 50, h: 20 }
    }

    #[test]
    fn identical_sets_produce_empty_delta() {
        let a = map(vec![candidate("a_0", r(0)), candidate("a_1", r(100))]);
        assert!(diff_candidates(&a, &a).is_empty());
    }

    #[test]
    fn rect_moves_within_tolerance_are_suppressed() {
        let old = map(vec![candidate("a_0", r(10))]);
        let new = map(vec![candidate("a_0", r(12))]);
        assert!(diff_candidates(&old, &new).is_empty());

        let new = map(vec![candidate("a_0", r(13))]);
        let delta = diff_candidates(&old, &new);
        let update = &delta.updated[0];
        assert_eq!(update.rect, Some(r(13)));
        assert!(update.rect_n.is_some());
        assert_eq!(update.hit, Some(r(13).center()));
        assert!(update.state.is_none());
    }

    #[test]
    fn state_change_emits_full_state() {
        let old = map(vec![candidate("a_0", r(0))]);
        let mut changed = candidate("a_0", r(0));
        changed.state.disabled = true;
        let new = map(vec![changed]);
        let delta = diff_candidates(&old, &new);
        assert_eq!(
            delta.updated[0].state,
            Some(CandidateState {
                disabled: true,
                ..CandidateState::default()
            })
        );
        assert!(delta.updated[0].rect.is_none());
    }

    #[test]
    fn ctx_emitted_only_for_modal_or_nav_change() {
        let old = map(vec![candidate("a_0", r(0))]);
        let mut deeper = candidate("a_0", r(0));
        deeper.ctx.depth = 7;
        let delta = diff_candidates(&old, &map(vec![deeper]));
        assert!(delta.is_empty());

        let mut modal = candidate("a_0", r(0));
        modal.ctx.in_modal = true;
        let delta = diff_candidates(&old, &map(vec![modal]));
        assert!(delta.updated[0].ctx.as_ref().unwrap().in_modal);
    }

    #[test]
    fn added_and_removed_are_partitioned() {
        let old = map(vec![candidate("a_0", r(0)), candidate("a_1", r(50))]);
        let new = map(vec![candidate("a_1", r(50)), candidate("a_2", r(90))]);
        let delta = diff_candidates(&old, &new);
        assert_eq!(delta.removed, vec!["a_0".to_string()]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].id, "a_2");
        assert!(delta.updated.is_empty());
    }

    #[test]
    fn rect_n_matches_emitted_rect() {
        let old = map(vec![candidate("a_0", r(0))]);
        let moved = candidate("a_0", r(500));
        let delta = diff_candidates(&old, &map(vec![moved.clone()]));
        assert_eq!(delta.updated[0].rect_n, Some(moved.rect_n));
    }
}
