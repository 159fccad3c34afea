//! Workspace state shared between the session and its presentation layer.
//!
//! [`WorkspaceStore`] owns the whole [`WorkspaceState`] behind a
//! `tokio::sync::watch` channel: readers take snapshots or subscribe to every
//! change, and every action mutates the state in one atomic step. Boot and
//! server transitions are additionally reported to transition observers.

use crate::error::{PlaygroundError, Result};
use crate::events::{Observers, Subscription};
use crate::exercise::ExerciseConfig;
use crate::lifecycle::state::{BootEvent, BootState, ServerEvent, ServerState};
use crate::sandbox::StreamKind;
use crate::sync::FilesMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

pub const DEFAULT_SCROLLBACK: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub top: u32,
    pub left: u32,
}

/// Open tabs, the active tab, unsaved marks and per-file scroll offsets.
///
/// `active` is always one of `open`, and `open` never holds a path twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorState {
    active: Option<String>,
    open: Vec<String>,
    dirty: BTreeSet<String>,
    scroll: HashMap<String, ScrollPosition>,
}

impl EditorState {
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn open_files(&self) -> &[String] {
        &self.open
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.dirty.contains(path)
    }

    pub fn dirty_files(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn scroll(&self, path: &str) -> ScrollPosition {
        self.scroll.get(path).copied().unwrap_or_default()
    }

    /// Open `path` as a tab if needed and make it active.
    pub fn open(&mut self, path: &str) {
        if !self.open.iter().any(|p| p == path) {
            self.open.push(path.to_string());
        }
        self.active = Some(path.to_string());
    }

    /// Close a tab. Closing the active tab activates its right neighbour, or
    /// the left one when it was last.
    pub fn close(&mut self, path: &str) {
        let Some(index) = self.open.iter().position(|p| p == path) else {
            return;
        };
        self.open.remove(index);
        self.scroll.remove(path);

        if self.active.as_deref() == Some(path) {
            self.active = self
                .open
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|i| self.open.get(i)))
                .cloned();
        }
    }

    pub fn mark_dirty(&mut self, path: &str) {
        self.dirty.insert(path.to_string());
    }

    pub fn mark_clean(&mut self, path: &str) {
        self.dirty.remove(path);
    }

    pub fn set_scroll(&mut self, path: &str, position: ScrollPosition) {
        self.scroll.insert(path.to_string(), position);
    }

    fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalLine {
    pub id: u64,
    pub text: String,
    pub stream: StreamKind,
    pub timestamp: DateTime<Utc>,
}

/// Line-oriented process log. Line ids keep increasing across clears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalState {
    lines: Vec<TerminalLine>,
    running: bool,
    next_id: u64,
    scrollback: usize,
}

impl TerminalState {
    pub fn new(scrollback: usize) -> Self {
        Self {
            lines: Vec::new(),
            running: false,
            next_id: 1,
            scrollback: scrollback.max(1),
        }
    }

    pub fn lines(&self) -> &[TerminalLine] {
        &self.lines
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Append one line and return its id. The oldest lines fall off once
    /// the scrollback is exceeded.
    pub fn push(&mut self, stream: StreamKind, text: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.lines.push(TerminalLine {
            id,
            text: text.into(),
            stream,
            timestamp: Utc::now(),
        });
        if self.lines.len() > self.scrollback {
            let excess = self.lines.len() - self.scrollback;
            self.lines.drain(..excess);
        }
        id
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl Default for TerminalState {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Panel {
    FileTree,
    Terminal,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelState {
    pub file_tree: bool,
    pub terminal: bool,
    pub preview: bool,
}

impl Default for PanelState {
    fn default() -> Self {
        Self {
            file_tree: true,
            terminal: true,
            preview: true,
        }
    }
}

impl PanelState {
    pub fn is_visible(&self, panel: Panel) -> bool {
        match panel {
            Panel::FileTree => self.file_tree,
            Panel::Terminal => self.terminal,
            Panel::Preview => self.preview,
        }
    }

    pub fn toggle(&mut self, panel: Panel) -> bool {
        let flag = match panel {
            Panel::FileTree => &mut self.file_tree,
            Panel::Terminal => &mut self.terminal,
            Panel::Preview => &mut self.preview,
        };
        *flag = !*flag;
        *flag
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    pub config: Option<Arc<ExerciseConfig>>,
    pub files: FilesMap,
    pub boot: BootState,
    pub server: ServerState,
    pub editor: EditorState,
    pub terminal: TerminalState,
    pub panels: PanelState,
    pub showing_solution: bool,
    /// The working copy while the solution is shown.
    stashed: Option<FilesMap>,
}

/// A boot or server state change, as seen by transition observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Boot { from: BootState, to: BootState },
    Server { from: ServerState, to: ServerState },
}

/// Paths that differ between two files maps, split by whether they still
/// exist afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesDiff {
    pub written: Vec<String>,
    pub removed: Vec<String>,
}

impl FilesDiff {
    fn between(before: &FilesMap, after: &FilesMap) -> Self {
        let written = after
            .iter()
            .filter(|(path, content)| before.get(*path) != Some(*content))
            .map(|(path, _)| path.clone())
            .collect();
        let removed = before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .cloned()
            .collect();
        Self { written, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

pub struct WorkspaceStore {
    state: watch::Sender<WorkspaceState>,
    transitions: Observers<Transition>,
}

impl WorkspaceStore {
    pub fn new(scrollback: usize) -> Self {
        let (state, _) = watch::channel(WorkspaceState {
            terminal: TerminalState::new(scrollback),
            ..WorkspaceState::default()
        });
        Self {
            state,
            transitions: Observers::new(),
        }
    }

    // -- Read accessors -----------------------------------------------------

    pub fn snapshot(&self) -> WorkspaceState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<WorkspaceState> {
        self.state.subscribe()
    }

    pub fn on_transition<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.transitions.subscribe(callback)
    }

    pub fn config(&self) -> Option<Arc<ExerciseConfig>> {
        self.state.borrow().config.clone()
    }

    pub fn files(&self) -> FilesMap {
        self.state.borrow().files.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.borrow().files.get(path).cloned()
    }

    pub fn boot_state(&self) -> BootState {
        self.state.borrow().boot.clone()
    }

    pub fn server_state(&self) -> ServerState {
        self.state.borrow().server.clone()
    }

    pub fn editor(&self) -> EditorState {
        self.state.borrow().editor.clone()
    }

    pub fn terminal_lines(&self) -> Vec<TerminalLine> {
        self.state.borrow().terminal.lines.clone()
    }

    pub fn panels(&self) -> PanelState {
        self.state.borrow().panels
    }

    pub fn showing_solution(&self) -> bool {
        self.state.borrow().showing_solution
    }

    // -- Actions ------------------------------------------------------------

    /// Install a new exercise: files are seeded from it, the editor opens its
    /// focus file, the terminal is cleared and both states return to idle.
    pub fn load_config(&self, config: ExerciseConfig) -> Result<()> {
        let files = config.files_map()?;
        let focus = config.initial_focus();
        let config = Arc::new(config);

        let mut transitions = Vec::new();
        self.state.send_modify(|state| {
            transitions.extend(reset_states(state));
            state.config = Some(config);
            state.files = files;
            state.editor = EditorState::default();
            if let Some(focus) = &focus {
                state.editor.open(focus);
            }
            state.showing_solution = false;
            state.stashed = None;
        });
        self.notify(transitions);
        Ok(())
    }

    pub fn set_files(&self, files: FilesMap) {
        self.state.send_modify(|state| state.files = files);
    }

    /// Edit one file and mark it dirty. Read-only files are rejected.
    pub fn update_file(&self, path: &str, content: &str) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state
                .config
                .as_ref()
                .is_some_and(|config| config.is_read_only(path))
            {
                outcome = Err(PlaygroundError::ReadOnlyFile(path.to_string()));
                return false;
            }
            state.files.insert(path.to_string(), content.to_string());
            state.editor.mark_dirty(path);
            true
        });
        outcome
    }

    /// Reflect a change the sandbox made on its own. Nothing is marked dirty.
    /// `None` removes the file and closes its tab.
    pub fn apply_external(&self, path: &str, content: Option<String>) {
        self.state.send_if_modified(|state| match content {
            Some(content) => {
                if state.files.get(path) == Some(&content) {
                    return false;
                }
                state.files.insert(path.to_string(), content);
                true
            }
            None => {
                let removed = state.files.remove(path).is_some();
                state.editor.close(path);
                state.editor.mark_clean(path);
                removed
            }
        });
    }

    /// Apply a boot event. Returns the new state, or `None` when the event
    /// is illegal in the current state (nothing changes then).
    pub fn apply_boot(&self, event: BootEvent) -> Option<BootState> {
        self.apply_boot_if(event, || true)
    }

    /// [`Self::apply_boot`] gated by `guard`, evaluated atomically with the
    /// transition.
    pub fn apply_boot_if(&self, event: BootEvent, guard: impl FnOnce() -> bool) -> Option<BootState> {
        let mut result = None;
        self.state.send_if_modified(|state| {
            let Some(next) = state.boot.transition(event) else {
                return false;
            };
            if !guard() {
                return false;
            }
            let from = std::mem::replace(&mut state.boot, next.clone());
            result = Some((from, next));
            true
        });

        let (from, to) = result?;
        tracing::debug!(from = %from, to = %to, "Boot state");
        self.transitions.emit(&Transition::Boot {
            from,
            to: to.clone(),
        });
        Some(to)
    }

    pub fn apply_server(&self, event: ServerEvent) -> Option<ServerState> {
        self.apply_server_if(event, || true)
    }

    pub fn apply_server_if(
        &self,
        event: ServerEvent,
        guard: impl FnOnce() -> bool,
    ) -> Option<ServerState> {
        let mut result = None;
        self.state.send_if_modified(|state| {
            let Some(next) = state.server.transition(&state.boot, event) else {
                return false;
            };
            if !guard() {
                return false;
            }
            let from = std::mem::replace(&mut state.server, next.clone());
            result = Some((from, next));
            true
        });

        let (from, to) = result?;
        tracing::debug!(from = %from, to = %to, "Server state");
        self.transitions.emit(&Transition::Server {
            from,
            to: to.clone(),
        });
        Some(to)
    }

    /// Overwrite the boot state without consulting the transition table.
    pub fn set_boot_state(&self, next: BootState) {
        let mut transitions = Vec::new();
        self.state.send_if_modified(|state| {
            if state.boot == next {
                return false;
            }
            let from = std::mem::replace(&mut state.boot, next.clone());
            transitions.push(Transition::Boot { from, to: next });
            true
        });
        self.notify(transitions);
    }

    /// Overwrite the server state without consulting the transition table.
    pub fn set_server_state(&self, next: ServerState) {
        let mut transitions = Vec::new();
        self.state.send_if_modified(|state| {
            if state.server == next {
                return false;
            }
            let from = std::mem::replace(&mut state.server, next.clone());
            transitions.push(Transition::Server { from, to: next });
            true
        });
        self.notify(transitions);
    }

    /// Open `path` in a tab and make it active. Only paths in the files map
    /// can be opened.
    pub fn open_file(&self, path: &str) -> Result<()> {
        let mut found = false;
        self.state.send_if_modified(|state| {
            found = state.files.contains_key(path);
            if found {
                state.editor.open(path);
            }
            found
        });
        if found {
            Ok(())
        } else {
            Err(PlaygroundError::FileNotFound(path.to_string()))
        }
    }

    /// Same as [`Self::open_file`]; selecting a file opens its tab.
    pub fn select_file(&self, path: &str) -> Result<()> {
        self.open_file(path)
    }

    pub fn close_file(&self, path: &str) {
        self.state.send_modify(|state| state.editor.close(path));
    }

    pub fn mark_dirty(&self, path: &str) {
        self.state.send_modify(|state| state.editor.mark_dirty(path));
    }

    pub fn mark_clean(&self, path: &str) {
        self.state.send_modify(|state| state.editor.mark_clean(path));
    }

    /// Clear the dirty mark only if `content` is still the latest content of
    /// `path`.
    pub fn mark_synced(&self, path: &str, content: &str) -> bool {
        self.state.send_if_modified(|state| {
            if state.files.get(path).map(String::as_str) != Some(content) {
                return false;
            }
            state.editor.dirty.remove(path)
        })
    }

    pub fn clear_dirty(&self) {
        self.state.send_modify(|state| state.editor.clear_dirty());
    }

    pub fn set_scroll(&self, path: &str, position: ScrollPosition) {
        self.state
            .send_modify(|state| state.editor.set_scroll(path, position));
    }

    pub fn append_terminal(&self, stream: StreamKind, text: impl Into<String>) -> u64 {
        let text = text.into();
        let mut id = 0;
        self.state
            .send_modify(|state| id = state.terminal.push(stream, text));
        id
    }

    pub fn clear_terminal(&self) {
        self.state.send_modify(|state| state.terminal.clear());
    }

    pub fn set_running(&self, running: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.terminal.running != running;
            state.terminal.running = running;
            changed
        });
    }

    pub fn toggle_panel(&self, panel: Panel) -> bool {
        let mut visible = false;
        self.state
            .send_modify(|state| visible = state.panels.toggle(panel));
        visible
    }

    /// Swap between the working copy and the solution. Returns the paths
    /// that changed, or `None` when the exercise has no solution.
    pub fn toggle_solution(&self) -> Result<Option<FilesDiff>> {
        let Some(config) = self.config() else {
            return Ok(None);
        };
        let Some(solution) = config.solution_map()? else {
            return Ok(None);
        };

        let mut diff = FilesDiff::default();
        self.state.send_modify(|state| {
            let next = if state.showing_solution {
                state.stashed.take().unwrap_or_default()
            } else {
                state.stashed = Some(state.files.clone());
                solution
            };
            diff = FilesDiff::between(&state.files, &next);
            state.files = next;
            state.showing_solution = !state.showing_solution;
            for path in &diff.removed {
                state.editor.close(path);
            }
        });
        tracing::debug!(
            showing_solution = self.showing_solution(),
            written = diff.written.len(),
            removed = diff.removed.len(),
            "Toggled solution"
        );
        Ok(Some(diff))
    }

    /// Both states to idle, terminal cleared. Files and editor are kept.
    pub fn reset(&self) {
        let mut transitions = Vec::new();
        self.state
            .send_modify(|state| transitions.extend(reset_states(state)));
        self.notify(transitions);
    }

    fn notify(&self, transitions: Vec<Transition>) {
        for transition in &transitions {
            self.transitions.emit(transition);
        }
    }
}

impl Default for WorkspaceStore {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

fn reset_states(state: &mut WorkspaceState) -> Vec<Transition> {
    let mut transitions = Vec::new();
    if state.boot != BootState::Idle {
        let from = std::mem::take(&mut state.boot);
        transitions.push(Transition::Boot {
            from,
            to: BootState::Idle,
        });
    }
    if state.server != ServerState::Idle {
        let from = std::mem::take(&mut state.server);
        transitions.push(Transition::Server {
            from,
            to: ServerState::Idle,
        });
    }
    state.terminal.clear();
    state.terminal.running = false;
    transitions
}
