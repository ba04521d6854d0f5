use crate::model::{format_elapsed, RunEvent, RunState};
use crate::prefs::Prefs;
use ratatui::style::{Color, Style};
use std::collections::BTreeSet;
use std::time::Instant;

/// Output kept per tab for scrolling. Exports read the full log from the run
/// handle through the controller.
const MAX_TAB_OUTPUT: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    Executable,
    SavesFolder,
    OutputFolder,
}

impl SettingsField {
    pub fn label(self) -> &'static str {
        match self {
            SettingsField::Executable => "Overviewer",
            SettingsField::SavesFolder => "Save folder",
            SettingsField::OutputFolder => "Output folder",
        }
    }
}

/// An in-progress edit of one settings field.
#[derive(Debug, Clone)]
pub struct FieldEdit {
    pub field: SettingsField,
    pub buffer: String,
}

/// One tab per map that has been started in this session.
#[derive(Debug)]
pub struct RunTab {
    pub map: String,
    /// Serial of the run this tab shows, named by the controller's `Started` event.
    pub serial: Option<u64>,
    pub awaiting_start: bool,
    /// Run events that beat `Started` to the UI; replayed once the serial is known.
    pub early_events: Vec<RunEvent>,
    pub start_error: Option<String>,
    pub state: RunState,
    pub output: String,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    /// Lines scrolled back from the bottom; 0 follows new output.
    pub scroll_back: usize,
}

impl RunTab {
    pub fn new(map: String) -> Self {
        Self {
            map,
            serial: None,
            awaiting_start: true,
            early_events: Vec::new(),
            start_error: None,
            state: RunState::Starting,
            output: String::new(),
            started_at: Instant::now(),
            finished_at: None,
            scroll_back: 0,
        }
    }

    /// Prepare for a fresh run of the same map.
    pub fn restart(&mut self) {
        self.serial = None;
        self.awaiting_start = true;
        self.early_events.clear();
        self.start_error = None;
        self.state = RunState::Starting;
        self.output.clear();
        self.started_at = Instant::now();
        self.finished_at = None;
        self.scroll_back = 0;
    }

    pub fn is_active(&self) -> bool {
        self.start_error.is_none() && !self.state.is_terminal()
    }

    /// Events from other runs of the same map (a stopped predecessor) are ignored.
    pub fn accepts(&self, serial: u64) -> bool {
        self.serial == Some(serial)
    }

    /// Adopt run `serial` and replay events that arrived before it was known.
    /// Returns the latest status message, if any.
    pub fn bind(&mut self, serial: u64, reused: bool) -> Option<String> {
        self.serial = Some(serial);
        self.awaiting_start = false;
        // A reused run was already past Starting; no Running event will follow.
        if reused && self.state == RunState::Starting {
            self.state = RunState::Running;
        }
        let mut info = None;
        for ev in std::mem::take(&mut self.early_events) {
            info = self.apply(ev).or(info);
        }
        info
    }

    /// Apply an event of this tab's run. Returns a status message for `Finished`.
    pub fn apply(&mut self, ev: RunEvent) -> Option<String> {
        match ev {
            RunEvent::Output { serial, chunk, .. } if self.accepts(serial) => {
                self.push_output(&chunk);
                // Keep the view anchored while scrolled back.
                if self.scroll_back > 0 {
                    self.scroll_back += chunk.matches('\n').count();
                }
                None
            }
            RunEvent::StateChanged { serial, state, .. } if self.accepts(serial) => {
                self.state = state;
                None
            }
            RunEvent::Finished { id, serial, state } if self.accepts(serial) => {
                let info = format!("{id}: {}", state.describe());
                self.state = state;
                self.finished_at = Some(Instant::now());
                Some(info)
            }
            _ => None,
        }
    }

    pub fn push_output(&mut self, chunk: &str) {
        // Carriage returns would garble the terminal.
        self.output.extend(chunk.chars().filter(|&c| c != '\r'));
        if self.output.len() > MAX_TAB_OUTPUT {
            let mut cut = self.output.len() - MAX_TAB_OUTPUT;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            // Drop whole lines where possible.
            if let Some(nl) = self.output[cut..].find('\n') {
                cut += nl + 1;
            }
            self.output.drain(..cut);
        }
    }

    pub fn line_count(&self) -> usize {
        self.output.lines().count()
    }

    pub fn scroll_by(&mut self, delta: isize) {
        let max = self.line_count().saturating_sub(1);
        self.scroll_back = if delta >= 0 {
            self.scroll_back.saturating_add(delta as usize).min(max)
        } else {
            self.scroll_back.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn status_text(&self) -> String {
        if let Some(msg) = &self.start_error {
            return format!("Could not start: {msg}");
        }
        let elapsed = self
            .finished_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at);
        match &self.state {
            RunState::Starting => "Starting…".into(),
            RunState::Running => format!("Rendering… {}", format_elapsed(elapsed)),
            other => format!("{} after {}", other.describe(), format_elapsed(elapsed)),
        }
    }

    pub fn status_style(&self) -> Style {
        if self.start_error.is_some() {
            return Style::default().fg(Color::Red);
        }
        match &self.state {
            RunState::Starting | RunState::Running => Style::default().fg(Color::Cyan),
            RunState::Cancelling => Style::default().fg(Color::Yellow),
            RunState::Completed(_) => Style::default().fg(Color::Green),
            s if s.is_cancelled() => Style::default().fg(Color::Yellow),
            RunState::Failed(_) => Style::default().fg(Color::Red),
        }
    }
}

/// Tab layout: 0 is Settings, `1..=runs.len()` are run tabs, the last is Help.
pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub settings: Prefs,
    pub maps: Vec<String>,
    pub map_cursor: usize,
    pub selected: BTreeSet<String>,
    pub editing: Option<FieldEdit>,
    pub runs: Vec<RunTab>,
}

impl UiState {
    pub fn new(settings: Prefs) -> Self {
        Self {
            tab: 0,
            info: String::new(),
            settings,
            maps: Vec::new(),
            map_cursor: 0,
            selected: BTreeSet::new(),
            editing: None,
            runs: Vec::new(),
        }
    }

    pub fn tab_count(&self) -> usize {
        self.runs.len() + 2
    }

    pub fn help_tab(&self) -> usize {
        self.runs.len() + 1
    }

    pub fn next_tab(&mut self) {
        self.tab = (self.tab + 1) % self.tab_count();
    }

    pub fn prev_tab(&mut self) {
        self.tab = (self.tab + self.tab_count() - 1) % self.tab_count();
    }

    /// Index into `runs` of the focused run tab.
    pub fn current_run(&self) -> Option<usize> {
        (1..=self.runs.len()).contains(&self.tab).then(|| self.tab - 1)
    }

    pub fn run_index(&self, map: &str) -> Option<usize> {
        self.runs.iter().position(|r| r.map == map)
    }

    pub fn focus_run(&mut self, idx: usize) {
        self.tab = idx + 1;
    }

    /// Existing tab for `map`, or a new one appended before Help.
    pub fn tab_for(&mut self, map: &str) -> usize {
        match self.run_index(map) {
            Some(idx) => idx,
            None => {
                self.runs.push(RunTab::new(map.to_owned()));
                self.runs.len() - 1
            }
        }
    }

    pub fn close_run(&mut self, idx: usize) -> RunTab {
        let tab = self.runs.remove(idx);
        if self.tab > self.runs.len() {
            self.tab = self.runs.len();
        }
        tab
    }

    pub fn active_runs(&self) -> usize {
        self.runs.iter().filter(|r| r.is_active()).count()
    }

    pub fn field_value(&self, field: SettingsField) -> &str {
        match field {
            SettingsField::Executable => &self.settings.executable,
            SettingsField::SavesFolder => &self.settings.saves_folder,
            SettingsField::OutputFolder => &self.settings.output_folder,
        }
    }

    pub fn begin_edit(&mut self, field: SettingsField) {
        self.editing = Some(FieldEdit {
            field,
            buffer: self.field_value(field).to_owned(),
        });
    }

    /// Store the edited value. Returns the field that changed, if any.
    pub fn commit_edit(&mut self) -> Option<SettingsField> {
        let edit = self.editing.take()?;
        let value = edit.buffer.trim().to_owned();
        let slot = match edit.field {
            SettingsField::Executable => &mut self.settings.executable,
            SettingsField::SavesFolder => &mut self.settings.saves_folder,
            SettingsField::OutputFolder => &mut self.settings.output_folder,
        };
        if *slot == value {
            return None;
        }
        *slot = value;
        Some(edit.field)
    }

    /// Replace the map list, keeping the cursor and selection where they still apply.
    pub fn set_maps(&mut self, maps: Vec<String>) {
        let current = self.maps.get(self.map_cursor).cloned();
        self.selected.retain(|m| maps.contains(m));
        self.map_cursor = current
            .and_then(|c| maps.iter().position(|m| *m == c))
            .unwrap_or(0);
        self.maps = maps;
    }

    pub fn move_cursor(&mut self, delta: isize) {
        if self.maps.is_empty() {
            return;
        }
        let last = self.maps.len() - 1;
        self.map_cursor = if delta >= 0 {
            (self.map_cursor + delta as usize).min(last)
        } else {
            self.map_cursor.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn toggle_selected(&mut self) {
        if let Some(map) = self.maps.get(self.map_cursor).cloned() {
            if !self.selected.remove(&map) {
                self.selected.insert(map);
            }
        }
    }

    pub fn toggle_all(&mut self) {
        if self.selected.len() == self.maps.len() {
            self.selected.clear();
        } else {
            self.selected = self.maps.iter().cloned().collect();
        }
    }

    /// Maps to start: the selection if there is one, else the highlighted map.
    pub fn maps_to_start(&self) -> Vec<String> {
        if self.selected.is_empty() {
            self.maps.get(self.map_cursor).cloned().into_iter().collect()
        } else {
            self.maps
                .iter()
                .filter(|m| self.selected.contains(*m))
                .cloned()
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_maps(maps: &[&str]) -> UiState {
        let mut s = UiState::new(Prefs::default());
        s.set_maps(maps.iter().map(|m| m.to_string()).collect());
        s
    }

    #[test]
    fn tabs_wrap_around_runs_and_help() {
        let mut s = state_with_maps(&[]);
        s.tab_for("world1");
        s.tab_for("world2");
        assert_eq!(s.tab_count(), 4);
        s.prev_tab();
        assert_eq!(s.tab, s.help_tab());
        s.next_tab();
        assert_eq!(s.tab, 0);
        s.next_tab();
        assert_eq!(s.current_run(), Some(0));
    }

    #[test]
    fn tab_for_reuses_existing_map() {
        let mut s = state_with_maps(&[]);
        assert_eq!(s.tab_for("world1"), 0);
        assert_eq!(s.tab_for("world2"), 1);
        assert_eq!(s.tab_for("world1"), 0);
        assert_eq!(s.runs.len(), 2);
    }

    #[test]
    fn closing_last_tab_keeps_focus_in_range() {
        let mut s = state_with_maps(&[]);
        s.tab_for("world1");
        s.focus_run(0);
        s.close_run(0);
        assert_eq!(s.tab, 0);
        assert!(s.current_run().is_none());
    }

    #[test]
    fn selection_or_cursor_decides_what_starts() {
        let mut s = state_with_maps(&["a", "b", "c"]);
        assert_eq!(s.maps_to_start(), vec!["a"]);
        s.move_cursor(2);
        s.toggle_selected();
        s.move_cursor(-2);
        s.toggle_selected();
        assert_eq!(s.maps_to_start(), vec!["a", "c"]);
        s.toggle_all();
        assert_eq!(s.selected.len(), 3);
        s.toggle_all();
        assert!(s.selected.is_empty());
    }

    #[test]
    fn refreshing_maps_keeps_cursor_on_same_map() {
        let mut s = state_with_maps(&["a", "b", "c"]);
        s.move_cursor(1);
        s.toggle_selected();
        s.set_maps(vec!["b".into(), "c".into()]);
        assert_eq!(s.maps[s.map_cursor], "b");
        assert!(s.selected.contains("b"));
        s.set_maps(vec!["x".into()]);
        assert_eq!(s.map_cursor, 0);
        assert!(s.selected.is_empty());
    }

    #[test]
    fn edit_commit_reports_changed_field() {
        let mut s = state_with_maps(&[]);
        s.begin_edit(SettingsField::SavesFolder);
        s.editing.as_mut().unwrap().buffer = "  /saves ".into();
        assert_eq!(s.commit_edit(), Some(SettingsField::SavesFolder));
        assert_eq!(s.settings.saves_folder, "/saves");
        s.begin_edit(SettingsField::SavesFolder);
        assert_eq!(s.commit_edit(), None);
    }

    #[test]
    fn tab_output_strips_carriage_returns_and_is_capped() {
        let mut tab = RunTab::new("w".into());
        tab.push_output("a\r\nb\n");
        assert_eq!(tab.output, "a\nb\n");
        let line = "x".repeat(1023) + "\n";
        for _ in 0..(MAX_TAB_OUTPUT / 1024 + 10) {
            tab.push_output(&line);
        }
        assert!(tab.output.len() <= MAX_TAB_OUTPUT);
        assert!(tab.output.starts_with('x'));
    }

    #[test]
    fn early_events_are_replayed_for_the_bound_run_only() {
        let mut tab = RunTab::new("w".into());
        // Output of a stopped predecessor and of the new run, both ahead of Started.
        for (serial, chunk) in [(3, "old\n"), (7, "new\n")] {
            tab.early_events.push(RunEvent::Output {
                id: "w".into(),
                serial,
                chunk: chunk.into(),
            });
        }
        tab.early_events.push(RunEvent::StateChanged {
            id: "w".into(),
            serial: 7,
            state: RunState::Running,
        });
        assert_eq!(tab.bind(7, false), None);
        assert!(tab.early_events.is_empty());
        assert_eq!(tab.output, "new\n");
        assert_eq!(tab.state, RunState::Running);
    }

    #[test]
    fn reused_run_is_shown_as_running() {
        let mut tab = RunTab::new("w".into());
        tab.bind(4, true);
        assert_eq!(tab.serial, Some(4));
        assert_eq!(tab.state, RunState::Running);
        assert!(tab.is_active());
    }

    #[test]
    fn stopped_runs_are_not_styled_as_failures() {
        use crate::model::FailureReason;

        let mut tab = RunTab::new("w".into());
        tab.state = RunState::Failed(FailureReason::Cancelled);
        assert_eq!(tab.status_style(), Style::default().fg(Color::Yellow));
        tab.state = RunState::Failed(FailureReason::ExitCode(1));
        assert_eq!(tab.status_style(), Style::default().fg(Color::Red));
    }

    #[test]
    fn scrolling_is_clamped() {
        let mut tab = RunTab::new("w".into());
        tab.push_output("1\n2\n3\n");
        tab.scroll_by(10);
        assert_eq!(tab.scroll_back, 2);
        tab.scroll_by(-5);
        assert_eq!(tab.scroll_back, 0);
    }
}
