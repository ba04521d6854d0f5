use super::state::{RunTab, SettingsField, UiState};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame,
};

const FIELDS: [(SettingsField, char); 3] = [
    (SettingsField::Executable, 'e'),
    (SettingsField::SavesFolder, 'w'),
    (SettingsField::OutputFolder, 'o'),
];

pub fn draw_settings(area: Rect, f: &mut Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(3)].as_ref())
        .split(area);

    let mut lines = Vec::with_capacity(FIELDS.len());
    for (field, key) in FIELDS {
        let label = Span::styled(
            format!("{:<14}", format!("{}:", field.label())),
            Style::default().fg(Color::Gray),
        );
        let hint = Span::styled(format!("[{key}] "), Style::default().fg(Color::Magenta));
        let value = match &state.editing {
            Some(edit) if edit.field == field => Span::styled(
                format!("{}▏", edit.buffer),
                Style::default().fg(Color::Yellow),
            ),
            _ => {
                let v = state.field_value(field);
                if v.is_empty() {
                    Span::styled("(not set)", Style::default().fg(Color::DarkGray))
                } else {
                    Span::raw(v.to_owned())
                }
            }
        };
        lines.push(Line::from(vec![hint, label, value]));
    }
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Settings")),
        chunks[0],
    );

    let title = if state.selected.is_empty() {
        format!("Maps ({})", state.maps.len())
    } else {
        format!("Maps ({}, {} selected)", state.maps.len(), state.selected.len())
    };
    let block = Block::default().borders(Borders::ALL).title(title);

    if state.maps.is_empty() {
        let msg = if state.settings.saves_folder.trim().is_empty() {
            "Set the save folder with [w] to list maps."
        } else {
            "No maps found in the save folder. [r] reloads."
        };
        f.render_widget(
            Paragraph::new(Line::from(Span::styled(
                msg,
                Style::default().fg(Color::DarkGray),
            )))
            .block(block),
            chunks[1],
        );
        return;
    }

    let items: Vec<ListItem> = state
        .maps
        .iter()
        .map(|map| {
            let mark = if state.selected.contains(map) { "[x]" } else { "[ ]" };
            let mut spans = vec![Span::raw(format!("{mark} {map}"))];
            if let Some(tab) = state.run_index(map).map(|i| &state.runs[i]) {
                spans.push(Span::raw("  "));
                spans.push(Span::styled(tab.state.describe(), tab.status_style()));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    let mut list_state = ListState::default().with_selected(Some(state.map_cursor));
    f.render_stateful_widget(list, chunks[1], &mut list_state);
}

/// Slice of `text` that fits `height` rows, `scroll_back` lines above the bottom.
pub fn visible_lines(text: &str, height: usize, scroll_back: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let end = lines.len().saturating_sub(scroll_back);
    let start = end.saturating_sub(height);
    lines[start..end].to_vec()
}

pub fn draw_run(area: Rect, f: &mut Frame, tab: &RunTab) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(3)].as_ref())
        .split(area);

    let status = Paragraph::new(Line::from(vec![
        Span::styled(tab.status_text(), tab.status_style()),
    ]))
    .block(Block::default().borders(Borders::ALL).title(tab.map.as_str()));
    f.render_widget(status, chunks[0]);

    let height = chunks[1].height.saturating_sub(2) as usize;
    let lines: Vec<Line> = visible_lines(&tab.output, height, tab.scroll_back)
        .into_iter()
        .map(|l| Line::from(l.to_owned()))
        .collect();
    let title = if tab.scroll_back == 0 {
        "Output".to_owned()
    } else {
        format!("Output (scrolled back {} lines, End to follow)", tab.scroll_back)
    };
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        chunks[1],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_lines_follow_bottom() {
        let text = "1\n2\n3\n4\n5\n";
        assert_eq!(visible_lines(text, 2, 0), vec!["4", "5"]);
        assert_eq!(visible_lines(text, 2, 1), vec!["3", "4"]);
        assert_eq!(visible_lines(text, 10, 0).len(), 5);
        assert!(visible_lines(text, 2, 10).is_empty());
        assert!(visible_lines("", 5, 0).is_empty());
    }
}
