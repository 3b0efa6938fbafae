//! Gateway-side world state: one in-memory [`TabState`] per tab, maintained
//! by replaying agent telemetry. All handlers are synchronous and idempotent
//! in effect — replaying a delta is harmless.

use crate::protocol::{
    now_ms, ActionCandidate, AgentMessage, CandidateDelta, CandidateUpdate, SearchFilters,
    TabSummary, Viewport,
};
use std::collections::{HashMap, VecDeque};

/// Bounded per-tab delta history.
pub const DELTA_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct PointerState {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
}

#[derive(Debug, Clone)]
pub struct DeltaRecord {
    pub at: u64,
    pub delta: CandidateDelta,
}

#[derive(Debug, Clone)]
pub struct TabState {
    pub tab_id: u64,
    pub url: String,
    pub viewport: Viewport,
    pub user_agent: String,
    pub connected_at: u64,
    pub last_update: u64,
    pub candidates: HashMap<String, ActionCandidate>,
    pub delta_history: VecDeque<DeltaRecord>,
}

impl TabState {
    fn new(tab_id: u64) -> Self {
        let now = now_ms();
        Self {
            tab_id,
            url: String::new(),
            viewport: Viewport::default(),
            user_agent: String::new(),
            connected_at: now,
            last_update: now,
            candidates: HashMap::new(),
            delta_history: VecDeque::new(),
        }
    }

    pub fn summary(&self) -> TabSummary {
        TabSummary {
            tab_id: self.tab_id,
            url: self.url.clone(),
            candidate_count: self.candidates.len(),
            viewport: self.viewport,
            connected_at: self.connected_at,
            last_update: self.last_update,
        }
    }
}

#[derive(Default)]
pub struct WorldState {
    tabs: HashMap<u64, TabState>,
    /// One global last-value, not per tab. Semantically thin under
    /// multi-tab operation, preserved as-is.
    pointer: PointerState,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one telemetry message into the store.
    pub fn apply(&mut self, msg: &AgentMessage) {
        match msg {
            AgentMessage::Hello {
                tab_id,
                url,
                viewport,
                user_agent,
            } => self.hello(*tab_id, url, *viewport, user_agent),
            AgentMessage::Snapshot {
                tab_id,
                url,
                viewport,
                candidates,
            } => self.snapshot(*tab_id, url, *viewport, candidates.clone()),
            AgentMessage::Delta {
                tab_id,
                removed,
                added,
                updated,
            } => self.delta(
                *tab_id,
                CandidateDelta {
                    removed: removed.clone(),
                    added: added.clone(),
                    updated: updated.clone(),
                },
            ),
            AgentMessage::Pointer { x, y, buttons, .. } => {
                self.update_pointer(*x, *y, *buttons)
            }
            AgentMessage::Unload { tab_id } => self.disconnect(*tab_id),
            AgentMessage::Event { tab_id, .. } => {
                if let Some(tab) = self.tabs.get_mut(tab_id) {
                    tab.last_update = now_ms();
                }
            }
            AgentMessage::Heartbeat { .. } | AgentMessage::Ack(_) => {}
        }
    }

    /// Create or refresh a TabState, preserving accumulated state when the
    /// tab already exists.
    pub fn hello(&mut self, tab_id: u64, url: &str, viewport: Viewport, user_agent: &str) {
        let tab = self.tabs.entry(tab_id).or_insert_with(|| TabState::new(tab_id));
        tab.url = url.to_string();
        tab.viewport = viewport;
        tab.user_agent = user_agent.to_string();
        tab.last_update = now_ms();
    }

    /// Full replacement of the tab's candidate map; clears delta history.
    pub fn snapshot(
        &mut self,
        tab_id: u64,
        url: &str,
        viewport: Viewport,
        candidates: Vec<ActionCandidate>,
    ) {
        let tab = self.tabs.entry(tab_id).or_insert_with(|| TabState::new(tab_id));
        tab.url = url.to_string();
        tab.viewport = viewport;
        tab.last_update = now_ms();
        tab.candidates = candidates
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        tab.delta_history.clear();
    }

    /// Apply `(prev ∪ added) \ removed`, then merge each update by id.
    pub fn delta(&mut self, tab_id: u64, delta: CandidateDelta) {
        let Some(tab) = self.tabs.get_mut(&tab_id) else {
            tracing::warn!("Delta for unknown tab {}, dropping", tab_id);
            return;
        };
        for id in &delta.removed {
            tab.candidates.remove(id);
        }
        for candidate in &delta.added {
            tab.candidates.insert(candidate.id.clone(), candidate.clone());
        }
        for update in &delta.updated {
            match tab.candidates.get_mut(&update.id) {
                Some(candidate) => merge_update(candidate, update),
                None => {
                    tracing::debug!(
                        "Update for unknown candidate {} in tab {}",
                        update.id,
                        tab_id
                    );
                }
            }
        }
        tab.last_update = now_ms();
        tab.delta_history.push_back(DeltaRecord {
            at: now_ms(),
            delta,
        });
        while tab.delta_history.len() > DELTA_HISTORY_LIMIT {
            tab.delta_history.pop_front();
        }
    }

    /// Erase the TabState entirely.
    pub fn disconnect(&mut self, tab_id: u64) {
        self.tabs.remove(&tab_id);
    }

    pub fn update_pointer(&mut self, x: i32, y: i32, buttons: u8) {
        self.pointer = PointerState { x, y, buttons };
    }

    pub fn pointer(&self) -> &PointerState {
        &self.pointer
    }

    pub fn tab(&self, tab_id: u64) -> Option<&TabState> {
        self.tabs.get(&tab_id)
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn tab_summaries(&self) -> Vec<TabSummary> {
        let mut out: Vec<TabSummary> = self.tabs.values().map(|t| t.summary()).collect();
        out.sort_by_key(|t| t.tab_id);
        out
    }

    /// Candidate lookup with the shared search semantics, in id order.
    pub fn search(
        &self,
        tab_id: u64,
        q: &str,
        filters: &SearchFilters,
    ) -> Option<Vec<ActionCandidate>> {
        let tab = self.tabs.get(&tab_id)?;
        let mut matches: Vec<&ActionCandidate> =
            crate::perception::search(tab.candidates.values(), q, filters);
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Some(matches.into_iter().cloned().collect())
    }

    /// Name of a candidate, for policy's action-name checks.
    pub fn candidate_name(&self, tab_id: u64, candidate_id: &str) -> Option<String> {
        self.tabs
            .get(&tab_id)?
            .candidates
            .get(candidate_id)
            .map(|c| c.name.clone())
    }

    pub fn tab_url(&self, tab_id: u64) -> Option<String> {
        self.tabs.get(&tab_id).map(|t| t.url.clone())
    }
}

fn merge_update(candidate: &mut ActionCandidate, update: &CandidateUpdate) {
    if let Some(rect) = update.rect {
        candidate.rect = rect;
    }
    if let Some(rect_n) = update.rect_n {
        candidate.rect_n = rect_n;
    }
    if let Some(hit) = update.hit {
        candidate.hit = hit;
    }
    if let Some(state) = update.state {
        candidate.state = state;
    }
    if let Some(name) = &update.name {
        candidate.name = name.clone();
    }
    if let Some(value) = &update.value {
        candidate.value = if value.is_empty() {
            None
        } else {
            Some(value.clone())
        };
    }
    if let Some(occluded) = update.occluded {
        candidate.occluded = occluded;
    }
    if let Some(ctx) = &update.ctx {
        candidate.ctx = ctx.clone();
    }
}
