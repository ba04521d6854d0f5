use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &str, action: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(action.to_owned()),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line("q / Ctrl-C", "Quit (stops running renders)"),
        key_line("tab", "Next tab"),
        key_line("shift-tab", "Previous tab"),
        key_line("?", "Show this help"),
        Line::from(""),
        Line::from("Settings tab:"),
        key_line("↑/↓ or j/k", "Highlight map"),
        key_line("space", "Select / unselect map"),
        key_line("a", "Select all / none"),
        key_line("enter", "Render selected maps (or the highlighted one)"),
        key_line("r", "Reload map list"),
        key_line("e", "Edit Overviewer executable"),
        key_line("w", "Edit save (worlds) folder"),
        key_line("o", "Edit output folder"),
        Line::from(""),
        Line::from("Render tab:"),
        key_line("↑/↓ or j/k", "Scroll output"),
        key_line("pgup/pgdn", "Scroll a page"),
        key_line("end or f", "Follow new output"),
        key_line("c", "Stop the render, keep the tab"),
        key_line("x", "Stop the render and close the tab"),
        key_line("enter", "Render again (once finished)"),
        key_line("y", "Copy output to clipboard"),
        key_line("s", "Save the full output log to the output folder"),
        Line::from(""),
        Line::from("While editing a field:"),
        key_line("enter", "Apply"),
        key_line("esc", "Cancel"),
        Line::from(""),
        Line::from("Overviewer:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled(
                "https://overviewer.org",
                Style::default().fg(Color::Cyan),
            ),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
