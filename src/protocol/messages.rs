//! Message shapes for the three protocol edges: agent → gateway telemetry,
//! gateway → agent commands, and the controller request/response surface.

use serde::{Deserialize, Serialize};

// ── Geometry ────────────────────────────────────────────────────

/// Integer pixel rectangle in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Integer center, the default click point.
    pub fn center(&self) -> Hit {
        Hit {
            cx: (self.x as f64 + self.w as f64 / 2.0).round() as i32,
            cy: (self.y as f64 + self.h as f64 / 2.0).round() as i32,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    /// True when every component is within `tol` pixels of `other`.
    pub fn within_tolerance(&self, other: &Rect, tol: i32) -> bool {
        (self.x - other.x).abs() <= tol
            && (self.y - other.y).abs() <= tol
            && (self.w - other.w).abs() <= tol
            && (self.h - other.h).abs() <= tol
    }

    /// True when the rect lies entirely outside a `(width, height)` viewport.
    pub fn outside_viewport(&self, width: u32, height: u32) -> bool {
        self.x + self.w <= 0
            || self.y + self.h <= 0
            || self.x >= width as i32
            || self.y >= height as i32
    }

    /// Viewport-normalized copy, components clamped to [0, 1].
    pub fn normalized(&self, width: u32, height: u32) -> RectN {
        let vw = (width.max(1)) as f64;
        let vh = (height.max(1)) as f64;
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        RectN {
            x: clamp(self.x as f64 / vw),
            y: clamp(self.y as f64 / vh),
            w: clamp(self.w as f64 / vw),
            h: clamp(self.h as f64 / vh),
        }
    }
}

/// Viewport-normalized rectangle, floats in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectN {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Default click point: the integer center of the candidate rect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hit {
    pub cx: i32,
    pub cy: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

// ── Action candidates ───────────────────────────────────────────

/// Boolean interaction state, from DOM properties and aria attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateState {
    pub disabled: bool,
    pub expanded: bool,
    pub checked: bool,
    pub selected: bool,
    pub focused: bool,
}

/// Structural ancestry flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateCtx {
    pub in_modal: bool,
    pub in_nav: bool,
    pub in_form: bool,
    /// Element ancestors up to document body.
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
}

/// Heuristic visual classification from class names, data attributes, and
/// computed style.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleHint {
    pub is_primary: bool,
    pub is_danger: bool,
    pub cursor_pointer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
}

/// One currently-interactive page element, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCandidate {
    /// Stable identity, scoped to a tab. Survives attribute churn.
    pub id: String,
    pub rect: Rect,
    #[serde(default)]
    pub rect_n: RectN,
    #[serde(default)]
    pub hit: Hit,
    pub role: String,
    #[serde(default)]
    pub tag: String,
    /// Accessible name (aria-label → labelledby → label → title →
    /// placeholder → truncated text).
    #[serde(default)]
    pub name: String,
    /// Raw aria-label, or empty.
    #[serde(default)]
    pub aria: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default)]
    pub state: CandidateState,
    #[serde(default)]
    pub ctx: CandidateCtx,
    #[serde(default)]
    pub style_hint: StyleHint,
    /// True when the element at the hit point is neither the candidate nor
    /// an ancestor/descendant.
    #[serde(default)]
    pub occluded: bool,
}

/// Per-candidate delta entry: `id` plus only the changed fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rect_n: Option<RectN>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit: Option<Hit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CandidateState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occluded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<CandidateCtx>,
}

impl CandidateUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// True when no field besides `id` is set.
    pub fn is_empty(&self) -> bool {
        self.rect.is_none()
            && self.state.is_none()
            && self.name.is_none()
            && self.value.is_none()
            && self.occluded.is_none()
            && self.ctx.is_none()
    }
}

/// Incremental update to a tab's candidate set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<ActionCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<CandidateUpdate>,
}

impl CandidateDelta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.updated.is_empty()
    }
}

// ── Agent → gateway telemetry ───────────────────────────────────

/// Modal / menu lifecycle events emitted by the overlay watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageEventKind {
    ModalOpened,
    ModalClosed,
    MenuOpened,
    MenuClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        tab_id: u64,
        url: String,
        viewport: Viewport,
        #[serde(default)]
        user_agent: String,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot {
        tab_id: u64,
        url: String,
        viewport: Viewport,
        candidates: Vec<ActionCandidate>,
    },
    #[serde(rename_all = "camelCase")]
    Delta {
        tab_id: u64,
        #[serde(default)]
        removed: Vec<String>,
        #[serde(default)]
        added: Vec<ActionCandidate>,
        #[serde(default)]
        updated: Vec<CandidateUpdate>,
    },
    #[serde(rename_all = "camelCase")]
    Pointer {
        tab_id: u64,
        x: i32,
        y: i32,
        buttons: u8,
    },
    #[serde(rename_all = "camelCase")]
    Event { tab_id: u64, name: PageEventKind },
    Heartbeat { timestamp: u64 },
    Ack(CommandAck),
    /// Explicit tab teardown; erases the gateway's TabState.
    #[serde(rename_all = "camelCase")]
    Unload { tab_id: u64 },
}

impl AgentMessage {
    /// Tab the message refers to; `None` for link-level messages.
    pub fn tab_id(&self) -> Option<u64> {
        match self {
            AgentMessage::Hello { tab_id, .. }
            | AgentMessage::Snapshot { tab_id, .. }
            | AgentMessage::Delta { tab_id, .. }
            | AgentMessage::Pointer { tab_id, .. }
            | AgentMessage::Event { tab_id, .. }
            | AgentMessage::Unload { tab_id } => Some(*tab_id),
            AgentMessage::Heartbeat { .. } | AgentMessage::Ack(_) => None,
        }
    }

    /// Set the tab id on tab-scoped telemetry (transport enrichment).
    pub fn set_tab_id(&mut self, id: u64) {
        match self {
            AgentMessage::Hello { tab_id, .. }
            | AgentMessage::Snapshot { tab_id, .. }
            | AgentMessage::Delta { tab_id, .. }
            | AgentMessage::Pointer { tab_id, .. }
            | AgentMessage::Event { tab_id, .. }
            | AgentMessage::Unload { tab_id } => *tab_id = id,
            AgentMessage::Heartbeat { .. } | AgentMessage::Ack(_) => {}
        }
    }
}

// ── Command acknowledgments ─────────────────────────────────────

/// Post-execution geometry and hit-test checks, in lieu of a bare boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub id: String,
    pub still_visible: bool,
    pub hit_test_ok: bool,
    pub rect_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_rect: Option<Rect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AckStatus {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Fail { reason: String },
    Verify { verification: Verification },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: String,
    #[serde(flatten)]
    pub status: AckStatus,
}

impl CommandAck {
    pub fn ok(command_id: impl Into<String>, result: Option<serde_json::Value>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Ok { result },
        }
    }

    pub fn fail(command_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Fail {
                reason: reason.into(),
            },
        }
    }

    pub fn verify(command_id: impl Into<String>, verification: Verification) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Verify { verification },
        }
    }
}

// ── Gateway → agent commands ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeMode {
    #[default]
    Append,
    Replace,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MouseCurve {
    #[default]
    Linear,
    EaseInOut,
    Smoothstep,
}

/// A `select` value: one entry, or several for multi-selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectValue {
    One(String),
    Many(Vec<String>),
}

impl SelectValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            SelectValue::One(v) => vec![v.as_str()],
            SelectValue::Many(vs) => vs.iter().map(|v| v.as_str()).collect(),
        }
    }
}

/// Search filters shared by in-page `query` and gateway-side lookups.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

fn default_click_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Click {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        id: String,
        #[serde(default)]
        button: u8,
        #[serde(default)]
        modifiers: Vec<String>,
        #[serde(default = "default_click_count")]
        click_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Type {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        id: String,
        text: String,
        #[serde(default)]
        mode: TypeMode,
        #[serde(default)]
        clear_first: bool,
        #[serde(default)]
        delay: u64,
    },
    #[serde(rename_all = "camelCase")]
    Hover {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Scroll {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        dx: i32,
        dy: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Focus {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Select {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        id: String,
        value: SelectValue,
    },
    #[serde(rename_all = "camelCase")]
    MoveMouse {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        x: i32,
        y: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        steps: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        curve: Option<MouseCurve>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Query {
        #[serde(default)]
        command_id: String,
        tab_id: u64,
        search: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filters: Option<SearchFilters>,
    },
}

impl Command {
    pub fn command_id(&self) -> &str {
        match self {
            Command::Click { command_id, .. }
            | Command::Type { command_id, .. }
            | Command::Hover { command_id, .. }
            | Command::Scroll { command_id, .. }
            | Command::Focus { command_id, .. }
            | Command::Select { command_id, .. }
            | Command::MoveMouse { command_id, .. }
            | Command::Query { command_id, .. } => command_id,
        }
    }

    pub fn set_command_id(&mut self, id: String) {
        match self {
            Command::Click { command_id, .. }
            | Command::Type { command_id, .. }
            | Command::Hover { command_id, .. }
            | Command::Scroll { command_id, .. }
            | Command::Focus { command_id, .. }
            | Command::Select { command_id, .. }
            | Command::MoveMouse { command_id, .. }
            | Command::Query { command_id, .. } => *command_id = id,
        }
    }

    pub fn tab_id(&self) -> u64 {
        match self {
            Command::Click { tab_id, .. }
            | Command::Type { tab_id, .. }
            | Command::Hover { tab_id, .. }
            | Command::Scroll { tab_id, .. }
            | Command::Focus { tab_id, .. }
            | Command::Select { tab_id, .. }
            | Command::MoveMouse { tab_id, .. }
            | Command::Query { tab_id, .. } => *tab_id,
        }
    }

    /// Wire name of the command variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Click { .. } => "click",
            Command::Type { .. } => "type",
            Command::Hover { .. } => "hover",
            Command::Scroll { .. } => "scroll",
            Command::Focus { .. } => "focus",
            Command::Select { .. } => "select",
            Command::MoveMouse { .. } => "move_mouse",
            Command::Query { .. } => "query",
        }
    }

    /// Candidate id the command targets, when it targets one.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Command::Click { id, .. }
            | Command::Type { id, .. }
            | Command::Hover { id, .. }
            | Command::Focus { id, .. }
            | Command::Select { id, .. } => Some(id),
            Command::Scroll { .. } | Command::MoveMouse { .. } | Command::Query { .. } => None,
        }
    }
}

/// Control message sent gateway → agent alongside commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentControl {
    RequestSnapshot,
}

// ── Controller surface ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerRequest {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        tab_id: Option<u64>,
    },
    ListTabs,
    #[serde(rename_all = "camelCase")]
    Query {
        tab_id: u64,
        #[serde(default)]
        search: String,
        #[serde(default)]
        filters: Option<SearchFilters>,
    },
    Act { command: Command },
    Navigate { url: String },
    CdpStatus,
    CdpType { text: String },
    CdpKey { key: String },
    CdpEval { expression: String },
}

/// Per-tab summary reported by `list_tabs` and the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
    pub tab_id: u64,
    pub url: String,
    pub candidate_count: usize,
    pub viewport: Viewport,
    pub connected_at: u64,
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayResponse {
    Tabs {
        tabs: Vec<TabSummary>,
    },
    #[serde(rename_all = "camelCase")]
    Candidates {
        tab_id: u64,
        matches: Vec<ActionCandidate>,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed {
        tab_id: Option<u64>,
    },
    NavigateResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CdpStatus {
        connected: bool,
        debug_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_url: Option<String>,
    },
    CdpTypeResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CdpKeyResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CdpEvalResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
    Ack(CommandAck),
}
