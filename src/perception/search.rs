//! Candidate search, shared by the in-page `query` command and the
//! gateway-side controller lookups.

use crate::protocol::{ActionCandidate, SearchFilters};

/// Match quality, best first. Used to pick a unique best match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    ExactName,
    ExactAria,
    PartialName,
    PartialAria,
    PartialId,
    RoleText,
}

/// Case-insensitive match of `q` against one candidate. `None` when the
/// candidate doesn't match at all. Empty queries match everything (filters
/// still apply).
pub fn match_tier(candidate: &ActionCandidate, q: &str) -> Option<MatchTier> {
    let q = q.trim().to_lowercase();
    if q.is_empty() {
        return Some(MatchTier::PartialName);
    }
    let name = candidate.name.to_lowercase();
    let aria = candidate.aria.to_lowercase();
    let id = candidate.id.to_lowercase();

    if name == q {
        return Some(MatchTier::ExactName);
    }
    if !aria.is_empty() && aria == q {
        return Some(MatchTier::ExactAria);
    }
    if name.contains(&q) {
        return Some(MatchTier::PartialName);
    }
    if !aria.is_empty() && aria.contains(&q) {
        return Some(MatchTier::PartialAria);
    }
    if id.contains(&q) {
        return Some(MatchTier::PartialId);
    }

    // "<role> <text>": role equality plus partial text match.
    if let Some((role_part, text_part)) = q.split_once(char::is_whitespace) {
        let text_part = text_part.trim();
        if !text_part.is_empty()
            && candidate.role.to_lowercase() == role_part
            && (name.contains(text_part) || aria.contains(text_part))
        {
            return Some(MatchTier::RoleText);
        }
    }

    None
}

pub fn matches_filters(candidate: &ActionCandidate, filters: &SearchFilters) -> bool {
    if let Some(role) = &filters.role {
        if candidate.role != *role {
            return false;
        }
    }
    if let Some(tag) = &filters.tag {
        if candidate.tag != *tag {
            return false;
        }
    }
    if let Some(visible) = filters.visible {
        if visible == candidate.occluded {
            return false;
        }
    }
    if let Some(enabled) = filters.enabled {
        if enabled == candidate.state.disabled {
            return false;
        }
    }
    true
}

/// Filtered, matching candidates in input order.
pub fn search<'a, I>(candidates: I, q: &str, filters: &SearchFilters) -> Vec<&'a ActionCandidate>
where
    I: IntoIterator<Item = &'a ActionCandidate>,
{
    candidates
        .into_iter()
        .filter(|c| matches_filters(c, filters))
        .filter(|c| match_tier(c, q).is_some())
        .collect()
}

/// First candidate by match-quality tier.
pub fn best_match<'a, I>(
    candidates: I,
    q: &str,
    filters: &SearchFilters,
) -> Option<&'a ActionCandidate>
where
    I: IntoIterator<Item = &'a ActionCandidate>,
{
    candidates
        .into_iter()
        .filter(|c| matches_filters(c, filters))
        .filter_map(|c| match_tier(c, q).map(|t| (t, c)))
        .min_by_key(|(t, _)| *t)
        .map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CandidateCtx, CandidateState, Hit, Rect, RectN, StyleHint};

    fn candidate(id: &str, role: &str, name: &str, aria: &str) -> ActionCandidate {
        ActionCandidate {
            id: id.to_string(),
            rect: Rect {
                x: 0,
                y: 0,
                w: 10,
                h: 10,
            },
            rect_n: RectN::default(),
            hit: Hit::default(),
            role: role.to_string(),
            tag: "button".to_string(),
            name: name.to_string(),
            aria: aria.to_string(),
            placeholder: None,
            value: None,
            href: None,
            state: CandidateState::default(),
            ctx: CandidateCtx::default(),
            style_hint: StyleHint::default(),
            occluded: false,
        }
    }

    #[test]
    fn exact_name_beats_partial() {
        let cands = vec![
            candidate("a_0", "button", "Sign in now", ""),
            candidate("a_1", "button", "Sign in", ""),
        ];
        let best = best_match(&cands, "sign in", &SearchFilters::default()).unwrap();
        assert_eq!(best.id, "a_1");
    }

    #[test]
    fn partial_matches_cover_name_aria_and_id() {
        let cands = vec![
            candidate("a_0", "button", "Continue", ""),
            candidate("a_1", "button", "", "continue checkout"),
            candidate("e_continue-btn", "button", "Next", ""),
        ];
        let hits = search(&cands, "continue", &SearchFilters::default());
        assert_eq!(hits.len(), 3);
        assert_eq!(
            match_tier(&cands[2], "continue"),
            Some(MatchTier::PartialId)
        );
    }

    #[test]
    fn role_text_pattern_requires_role_equality() {
        let cands = vec![
            candidate("a_0", "link", "Help center", ""),
            candidate("a_1", "button", "Help", ""),
        ];
        let hits = search(&cands, "link center", &SearchFilters::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a_0");
    }

    #[test]
    fn filters_apply_independently_of_text() {
        let mut disabled = candidate("a_0", "button", "Save", "");
        disabled.state.disabled = true;
        let mut hidden = candidate("a_1", "button", "Save", "");
        hidden.occluded = true;
        let normal = candidate("a_2", "button", "Save", "");
        let cands = vec![disabled, hidden, normal];

        let enabled_only = search(
            &cands,
            "save",
            &SearchFilters {
                enabled: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(enabled_only.len(), 2);

        let visible_enabled = search(
            &cands,
            "save",
            &SearchFilters {
                visible: Some(true),
                enabled: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(visible_enabled.len(), 1);
        assert_eq!(visible_enabled[0].id, "a_2");
    }

    #[test]
    fn empty_query_returns_all_filtered() {
        let cands = vec![
            candidate("a_0", "button", "A", ""),
            candidate("a_1", "link", "B", ""),
        ];
        let hits = search(
            &cands,
            "",
            &SearchFilters {
                role: Some("link".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a_1");
    }

    #[test]
    fn unmatched_query_returns_nothing() {
        let cands = vec![candidate("a_0", "button", "Save", "")];
        assert!(search(&cands, "zzz", &SearchFilters::default()).is_empty());
        assert!(best_match(&cands, "zzz", &SearchFilters::default()).is_none());
    }
}
