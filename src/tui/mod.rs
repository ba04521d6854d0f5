mod export;
mod help;
mod state;
mod views;

use crate::cli::Cli;
use crate::model::{ExportTarget, RunEvent};
use crate::orchestrator::{self, UiCommand};
use crate::prefs::{self, Prefs};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Terminal,
};
use state::{RunTab, SettingsField, UiState};
use std::path::Path;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::warn;

const PAGE: isize = 20;

pub async fn run(args: Cli) -> Result<()> {
    let settings = crate::cli::resolve_settings(&args)?;

    // Unbounded channels: relay tasks never wait on the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, settings, event_rx, cmd_tx));

    let res = orchestrator::run_controller(args.registry(), event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    settings: Prefs,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::new(settings);
    reload_maps(&mut state);

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut redraw = true;

    let res: Result<()> = loop {
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if redraw || last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
            redraw = false;
        }

        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if handle_key(&mut state, k, &cmd_tx) {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
                // Redraw right away so typing feels immediate.
                redraw = true;
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();

    let active = state.active_runs();
    if active > 0 {
        eprintln!("Stopping {active} render(s)…");
    }
    if !args.no_save_prefs {
        if let Some(path) = args.prefs_path() {
            if let Err(e) = prefs::save(&path, &state.settings) {
                warn!(error = %e, "failed to save settings");
                eprintln!("warning: settings not saved: {e:#}");
            }
        }
    }
    res
}

fn reload_maps(state: &mut UiState) {
    let root = state.settings.saves_folder.trim().to_owned();
    match crate::maps::list_maps(Path::new(&root)) {
        Ok(maps) => {
            state.set_maps(maps);
            state.info = if root.is_empty() {
                "No save folder set".into()
            } else {
                format!("{} map(s) in {root}", state.maps.len())
            };
        }
        Err(e) => {
            state.set_maps(Vec::new());
            state.info = format!("Could not list maps: {e:#}");
        }
    }
}

/// Open (or reuse) the tab for `map` and ask the controller to render it.
fn start_map(state: &mut UiState, map: &str, cmd_tx: &UnboundedSender<UiCommand>) {
    if let Some(idx) = state.run_index(map).filter(|&i| state.runs[i].is_active()) {
        state.focus_run(idx);
        return;
    }
    let idx = state.tab_for(map);
    state.runs[idx].restart();
    let _ = cmd_tx.send(UiCommand::StartRun(state.settings.request(map)));
    state.focus_run(idx);
}

/// Ask the controller for the full log of the tab's run.
fn request_export(tab: &RunTab, target: ExportTarget, cmd_tx: &UnboundedSender<UiCommand>) -> String {
    match tab.serial {
        Some(serial) => {
            let _ = cmd_tx.send(UiCommand::ExportOutput {
                id: tab.map.clone(),
                serial,
                target,
            });
            "Collecting output…".into()
        }
        None => "Nothing to export yet".into(),
    }
}

/// Returns true when the UI should quit.
fn handle_key(state: &mut UiState, k: KeyEvent, cmd_tx: &UnboundedSender<UiCommand>) -> bool {
    if let (KeyModifiers::CONTROL, KeyCode::Char('c')) = (k.modifiers, k.code) {
        return true;
    }

    if let Some(edit) = state.editing.as_mut() {
        match k.code {
            KeyCode::Enter => {
                if let Some(field) = state.commit_edit() {
                    state.info = format!("{} updated", field.label());
                    if field == SettingsField::SavesFolder {
                        reload_maps(state);
                    }
                }
            }
            KeyCode::Esc => state.editing = None,
            KeyCode::Backspace => {
                edit.buffer.pop();
            }
            KeyCode::Char('u') if k.modifiers.contains(KeyModifiers::CONTROL) => {
                edit.buffer.clear();
            }
            KeyCode::Char(c) if !k.modifiers.contains(KeyModifiers::CONTROL) => {
                edit.buffer.push(c);
            }
            _ => {}
        }
        return false;
    }

    match k.code {
        KeyCode::Char('q') => return true,
        KeyCode::Tab => state.next_tab(),
        KeyCode::BackTab => state.prev_tab(),
        KeyCode::Char('?') => state.tab = state.help_tab(),
        _ if state.tab == 0 => handle_settings_key(state, k, cmd_tx),
        _ => {
            if let Some(idx) = state.current_run() {
                handle_run_key(state, idx, k, cmd_tx);
            }
        }
    }
    false
}

fn handle_settings_key(state: &mut UiState, k: KeyEvent, cmd_tx: &UnboundedSender<UiCommand>) {
    match k.code {
        KeyCode::Up | KeyCode::Char('k') => state.move_cursor(-1),
        KeyCode::Down | KeyCode::Char('j') => state.move_cursor(1),
        KeyCode::PageUp => state.move_cursor(-PAGE),
        KeyCode::PageDown => state.move_cursor(PAGE),
        KeyCode::Char(' ') => state.toggle_selected(),
        KeyCode::Char('a') => state.toggle_all(),
        KeyCode::Char('r') => reload_maps(state),
        KeyCode::Char('e') => state.begin_edit(SettingsField::Executable),
        KeyCode::Char('w') => state.begin_edit(SettingsField::SavesFolder),
        KeyCode::Char('o') => state.begin_edit(SettingsField::OutputFolder),
        KeyCode::Enter => {
            let maps = state.maps_to_start();
            if maps.is_empty() {
                state.info = "No map to render".into();
                return;
            }
            if state.settings.executable.trim().is_empty() {
                state.info = "Set the Overviewer executable first ([e])".into();
                return;
            }
            for map in &maps {
                start_map(state, map, cmd_tx);
            }
            state.selected.clear();
            if maps.len() > 1 {
                state.info = format!("Starting {} renders", maps.len());
            }
        }
        _ => {}
    }
}

fn handle_run_key(
    state: &mut UiState,
    idx: usize,
    k: KeyEvent,
    cmd_tx: &UnboundedSender<UiCommand>,
) {
    let tab = &mut state.runs[idx];
    match k.code {
        KeyCode::Up | KeyCode::Char('k') => tab.scroll_by(1),
        KeyCode::Down | KeyCode::Char('j') => tab.scroll_by(-1),
        KeyCode::PageUp => tab.scroll_by(PAGE),
        KeyCode::PageDown => tab.scroll_by(-PAGE),
        KeyCode::Home | KeyCode::Char('g') => tab.scroll_by(isize::MAX),
        KeyCode::End | KeyCode::Char('f') | KeyCode::Char('G') => tab.scroll_back = 0,
        KeyCode::Char('c') => {
            if tab.is_active() {
                let _ = cmd_tx.send(UiCommand::StopRun(tab.map.clone()));
            } else {
                state.info = format!("{} is not rendering", tab.map);
            }
        }
        KeyCode::Char('x') => {
            let closed = state.close_run(idx);
            if !closed.is_active() {
                state.info = format!("Closed {}", closed.map);
            }
            // Also detaches a finished run from the registry.
            let _ = cmd_tx.send(UiCommand::StopRun(closed.map));
        }
        KeyCode::Enter => {
            if tab.is_active() {
                state.info = format!("{} is still rendering", tab.map);
            } else {
                let map = tab.map.clone();
                start_map(state, &map, cmd_tx);
            }
        }
        KeyCode::Char('y') => state.info = request_export(tab, ExportTarget::Clipboard, cmd_tx),
        KeyCode::Char('s') => state.info = request_export(tab, ExportTarget::LogFile, cmd_tx),
        _ => {}
    }
}

fn apply_event(state: &mut UiState, ev: RunEvent) {
    match ev {
        RunEvent::Started { id, serial, reused } => {
            if let Some(tab) = state.runs.iter_mut().find(|r| r.map == id) {
                if tab.awaiting_start {
                    if let Some(info) = tab.bind(serial, reused) {
                        state.info = info;
                    }
                }
            }
            if reused {
                state.info = format!("{id} is already rendering");
            }
        }
        RunEvent::StartFailed { id, message } => {
            if let Some(tab) = state.runs.iter_mut().find(|r| r.map == id) {
                if tab.awaiting_start {
                    tab.awaiting_start = false;
                    tab.early_events.clear();
                    tab.start_error = Some(message.clone());
                    tab.finished_at = Some(Instant::now());
                }
            }
            state.info = format!("{id}: {message}");
        }
        ev @ (RunEvent::Output { .. } | RunEvent::StateChanged { .. } | RunEvent::Finished { .. }) => {
            let Some(idx) = ev.run_id().and_then(|id| state.run_index(id)) else {
                return;
            };
            let tab = &mut state.runs[idx];
            if tab.awaiting_start {
                // The relay can outrun the controller's Started event.
                tab.early_events.push(ev);
            } else if let Some(info) = tab.apply(ev) {
                state.info = info;
            }
        }
        RunEvent::OutputExport { id, serial, target, text } => {
            if !state.runs.iter().any(|r| r.map == id && r.accepts(serial)) {
                return;
            }
            state.info = match target {
                ExportTarget::Clipboard => match export::copy_to_clipboard(&text) {
                    Ok(()) => "Output copied to clipboard".into(),
                    Err(e) => format!("Copy failed: {e:#}"),
                },
                ExportTarget::LogFile => {
                    match export::save_output_log(&id, &text, &state.settings.output_folder) {
                        Ok(path) => format!("Saved: {}", path.display()),
                        Err(e) => format!("Save failed: {e:#}"),
                    }
                }
            };
        }
        RunEvent::Info(info) => state.info = info.to_message(),
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)].as_ref())
        .split(area);

    let mut titles = vec![Line::from("Settings")];
    titles.extend(
        state
            .runs
            .iter()
            .map(|r| Line::from(Span::styled(r.map.clone(), r.status_style()))),
    );
    titles.push(Line::from("Help"));

    let tabs = Tabs::new(titles)
        .select(state.tab)
        .block(Block::default().borders(Borders::ALL).title("overviewer-tui"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.current_run() {
        _ if state.tab == 0 => views::draw_settings(chunks[1], f, state),
        Some(idx) => views::draw_run(chunks[1], f, &state.runs[idx]),
        None => help::draw_help(chunks[1], f),
    }

    let footer = if state.editing.is_some() {
        "enter apply · esc cancel".to_owned()
    } else if state.info.is_empty() {
        "? help · q quit".to_owned()
    } else {
        state.info.clone()
    };
    f.render_widget(
        Paragraph::new(Line::from(Span::styled(footer, Style::default().fg(Color::Gray)))),
        chunks[2],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureReason, RunState};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ready_state() -> UiState {
        let mut s = UiState::new(Prefs {
            saves_folder: "/saves".into(),
            output_folder: "/out".into(),
            executable: "/bin/overviewer".into(),
        });
        s.set_maps(vec!["world1".into(), "world2".into()]);
        s
    }

    #[test]
    fn enter_starts_highlighted_map_in_its_own_tab() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!handle_key(&mut s, key(KeyCode::Enter), &tx));
        match rx.try_recv().unwrap() {
            UiCommand::StartRun(req) => {
                assert_eq!(req.map, "world1");
                assert_eq!(req.output_root, Path::new("/out"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.current_run(), Some(0));
        assert!(s.runs[0].awaiting_start);
    }

    #[test]
    fn enter_on_active_tab_only_focuses_it() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        rx.try_recv().unwrap();
        s.tab = 0;
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(s.current_run(), Some(0));
    }

    #[test]
    fn missing_executable_blocks_start() {
        let mut s = ready_state();
        s.settings.executable.clear();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        assert!(rx.try_recv().is_err());
        assert!(s.runs.is_empty());
    }

    #[test]
    fn tab_binds_to_started_serial_and_ignores_others() {
        let mut s = ready_state();
        let idx = s.tab_for("world1");
        // The relay's first events can reach the UI before the controller's reply.
        apply_event(
            &mut s,
            RunEvent::StateChanged { id: "world1".into(), serial: 7, state: RunState::Running },
        );
        apply_event(
            &mut s,
            RunEvent::Output { id: "world1".into(), serial: 3, chunk: "stale\n".into() },
        );
        apply_event(
            &mut s,
            RunEvent::Output { id: "world1".into(), serial: 7, chunk: "rendering...\n".into() },
        );
        assert!(s.runs[idx].output.is_empty());
        apply_event(&mut s, RunEvent::Started { id: "world1".into(), serial: 7, reused: false });
        assert_eq!(s.runs[idx].serial, Some(7));

        // A stopped predecessor of the same map finishing late.
        apply_event(
            &mut s,
            RunEvent::Finished {
                id: "world1".into(),
                serial: 3,
                state: RunState::Failed(FailureReason::Cancelled),
            },
        );
        let tab = &s.runs[idx];
        assert_eq!(tab.state, RunState::Running);
        assert_eq!(tab.output, "rendering...\n");

        apply_event(
            &mut s,
            RunEvent::Finished { id: "world1".into(), serial: 7, state: RunState::Completed(0) },
        );
        assert_eq!(s.runs[idx].state, RunState::Completed(0));
        assert_eq!(s.info, "world1: Completed");
    }

    #[test]
    fn reused_start_binds_the_tab_to_the_running_run() {
        let mut s = ready_state();
        let idx = s.tab_for("world1");
        apply_event(&mut s, RunEvent::Started { id: "world1".into(), serial: 2, reused: true });
        apply_event(
            &mut s,
            RunEvent::Output { id: "world1".into(), serial: 2, chunk: "tick\n".into() },
        );
        let tab = &s.runs[idx];
        assert_eq!(tab.state, RunState::Running);
        assert_eq!(tab.output, "tick\n");
    }

    #[test]
    fn start_failure_is_shown_on_the_tab() {
        let mut s = ready_state();
        let idx = s.tab_for("world3");
        apply_event(
            &mut s,
            RunEvent::StartFailed { id: "world3".into(), message: "no such file".into() },
        );
        let tab = &s.runs[idx];
        assert!(!tab.is_active());
        assert!(tab.status_text().contains("no such file"));
    }

    #[test]
    fn closing_active_tab_stops_the_run() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        rx.try_recv().unwrap();
        handle_key(&mut s, key(KeyCode::Char('x')), &tx);
        assert!(matches!(rx.try_recv().unwrap(), UiCommand::StopRun(id) if id == "world1"));
        assert!(s.runs.is_empty());
        assert_eq!(s.tab, 0);
    }

    #[test]
    fn stop_key_stops_the_run_and_keeps_the_tab() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        rx.try_recv().unwrap();
        apply_event(&mut s, RunEvent::Started { id: "world1".into(), serial: 11, reused: false });

        handle_key(&mut s, key(KeyCode::Char('c')), &tx);
        assert!(matches!(rx.try_recv().unwrap(), UiCommand::StopRun(id) if id == "world1"));
        assert_eq!(s.current_run(), Some(0));

        apply_event(
            &mut s,
            RunEvent::Finished {
                id: "world1".into(),
                serial: 11,
                state: RunState::Failed(FailureReason::Cancelled),
            },
        );
        assert!(s.runs[0].status_text().starts_with("Stopped by user"));

        // Nothing left to stop.
        handle_key(&mut s, key(KeyCode::Char('c')), &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closing_finished_tab_still_detaches_the_run() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let idx = s.tab_for("world2");
        s.runs[idx].bind(4, false);
        s.runs[idx].state = RunState::Completed(0);
        s.focus_run(idx);

        handle_key(&mut s, key(KeyCode::Char('x')), &tx);
        assert!(matches!(rx.try_recv().unwrap(), UiCommand::StopRun(id) if id == "world2"));
        assert_eq!(s.info, "Closed world2");
        assert!(s.runs.is_empty());
    }

    #[test]
    fn save_writes_the_full_log_from_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = ready_state();
        s.settings.output_folder = dir.path().display().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let idx = s.tab_for("world1");
        s.runs[idx].bind(5, false);
        s.runs[idx].push_output("tail only\n");
        s.focus_run(idx);

        handle_key(&mut s, key(KeyCode::Char('s')), &tx);
        match rx.try_recv().unwrap() {
            UiCommand::ExportOutput { id, serial, target } => {
                assert_eq!(id, "world1");
                assert_eq!(serial, 5);
                assert_eq!(target, ExportTarget::LogFile);
            }
            other => panic!("unexpected {other:?}"),
        }

        // A reply for another run of the map is dropped.
        apply_event(
            &mut s,
            RunEvent::OutputExport {
                id: "world1".into(),
                serial: 6,
                target: ExportTarget::LogFile,
                text: "other\n".into(),
            },
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        apply_event(
            &mut s,
            RunEvent::OutputExport {
                id: "world1".into(),
                serial: 5,
                target: ExportTarget::LogFile,
                text: "head\ntail only\n".into(),
            },
        );
        assert!(s.info.starts_with("Saved: "), "{}", s.info);
        let saved = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(saved.path()).unwrap(), "head\ntail only\n");
    }

    #[test]
    fn export_before_start_sends_nothing() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let idx = s.tab_for("world1");
        s.focus_run(idx);
        handle_key(&mut s, key(KeyCode::Char('y')), &tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(s.info, "Nothing to export yet");
    }

    #[test]
    fn finished_tab_can_be_rerun() {
        let mut s = ready_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let idx = s.tab_for("world1");
        s.runs[idx].serial = Some(1);
        s.runs[idx].awaiting_start = false;
        s.runs[idx].state = RunState::Failed(FailureReason::ExitCode(1));
        s.runs[idx].push_output("old\n");
        s.focus_run(idx);

        handle_key(&mut s, key(KeyCode::Enter), &tx);
        assert!(matches!(rx.try_recv().unwrap(), UiCommand::StartRun(req) if req.map == "world1"));
        assert!(s.runs[idx].output.is_empty());
        assert_eq!(s.runs[idx].serial, None);
    }

    #[test]
    fn editing_captures_keys_until_enter() {
        let mut s = ready_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Char('o')), &tx);
        handle_key(&mut s, KeyEvent::new(KeyCode::Char('u'), KeyModifiers::CONTROL), &tx);
        for c in "/maps".chars() {
            handle_key(&mut s, key(KeyCode::Char(c)), &tx);
        }
        // 'q' is text while editing.
        assert!(!handle_key(&mut s, key(KeyCode::Char('q')), &tx));
        handle_key(&mut s, key(KeyCode::Backspace), &tx);
        handle_key(&mut s, key(KeyCode::Enter), &tx);
        assert_eq!(s.settings.output_folder, "/maps");
        assert!(s.editing.is_none());
    }

    #[test]
    fn escape_discards_edit() {
        let mut s = ready_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle_key(&mut s, key(KeyCode::Char('e')), &tx);
        handle_key(&mut s, key(KeyCode::Char('z')), &tx);
        handle_key(&mut s, key(KeyCode::Esc), &tx);
        assert_eq!(s.settings.executable, "/bin/overviewer");
    }

    #[test]
    fn q_and_ctrl_c_quit() {
        let mut s = ready_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(handle_key(&mut s, key(KeyCode::Char('q')), &tx));
        s.begin_edit(SettingsField::Executable);
        assert!(handle_key(
            &mut s,
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
            &tx
        ));
    }
}
