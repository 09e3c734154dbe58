// 🖥️ Terminal Review - Correct an extracted receipt before saving it
// Shop panel + items table, cell editing, live validation and advisories

use crate::review::{ReviewSession, SessionError, Stage, Verdict};
use crate::schema::{FieldSpec, ITEM_FIELDS, SHOP_FIELDS};
use crate::store::{ReceiptStore, StoredReceipt};
use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap},
    Frame, Terminal,
};
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Shop,
    Items,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Navigate,
    Editing { path: String, buffer: String },
}

/// What the event loop should do after a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Save,
    Quit,
}

pub enum Outcome {
    Persisted(StoredReceipt),
    /// Left without saving; the session keeps the draft
    Abandoned(ReviewSession),
}

pub struct App {
    pub session: ReviewSession,
    pub pane: Pane,
    pub shop_row: usize,
    pub items_state: TableState,
    pub item_col: usize,
    pub mode: Mode,
    pub message: Option<String>,
}

impl App {
    pub fn new(session: ReviewSession) -> Self {
        let mut items_state = TableState::default();
        if session.item_count() > 0 {
            items_state.select(Some(0));
        }

        App {
            session,
            pane: Pane::Shop,
            shop_row: 0,
            items_state,
            item_col: 0,
            mode: Mode::Navigate,
            message: None,
        }
    }

    fn selected_item(&self) -> Option<usize> {
        self.items_state
            .selected()
            .filter(|i| *i < self.session.item_count())
    }

    /// Field path under the cursor
    pub fn current_path(&self) -> Option<String> {
        match self.pane {
            Pane::Shop => Some(format!("shop.{}", SHOP_FIELDS[self.shop_row].name)),
            Pane::Items => self
                .selected_item()
                .map(|row| format!("items[{}].{}", row, ITEM_FIELDS[self.item_col].name)),
        }
    }

    fn is_valid(&self) -> bool {
        self.session.verdict().map(Verdict::is_valid).unwrap_or(false)
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Flow {
        match &mut self.mode {
            Mode::Editing { path, buffer } => {
                match key.code {
                    KeyCode::Enter => {
                        let path = path.clone();
                        let text = buffer.clone();
                        self.mode = Mode::Navigate;
                        self.commit_edit(&path, &text);
                    }
                    KeyCode::Esc => {
                        self.mode = Mode::Navigate;
                        self.message = Some("Edit cancelled".to_string());
                    }
                    KeyCode::Backspace => {
                        buffer.pop();
                    }
                    KeyCode::Char(c) => buffer.push(c),
                    _ => {}
                }
                Flow::Continue
            }
            Mode::Navigate => self.handle_navigation(key),
        }
    }

    fn handle_navigation(&mut self, key: KeyEvent) -> Flow {
        match key.code {
            KeyCode::Char('q') => return Flow::Quit,
            KeyCode::Char('s') => {
                if self.is_valid() {
                    return Flow::Save;
                }
                let problems = self.session.verdict().map(|v| v.errors().len()).unwrap_or(0);
                self.message = Some(format!("Cannot save: {} validation problem(s)", problems));
            }
            KeyCode::Enter => self.start_edit(),
            KeyCode::Tab | KeyCode::BackTab => {
                self.pane = match self.pane {
                    Pane::Shop => Pane::Items,
                    Pane::Items => Pane::Shop,
                };
            }
            KeyCode::Down | KeyCode::Char('j') => self.move_row(1),
            KeyCode::Up | KeyCode::Char('k') => self.move_row(-1),
            KeyCode::Right | KeyCode::Char('l') if self.pane == Pane::Items => {
                self.item_col = (self.item_col + 1) % ITEM_FIELDS.len();
            }
            KeyCode::Left | KeyCode::Char('h') if self.pane == Pane::Items => {
                self.item_col = (self.item_col + ITEM_FIELDS.len() - 1) % ITEM_FIELDS.len();
            }
            KeyCode::Char('a') => self.add_item(),
            KeyCode::Char('d') if self.pane == Pane::Items => self.delete_item(),
            _ => {}
        }
        Flow::Continue
    }

    fn move_row(&mut self, delta: isize) {
        match self.pane {
            Pane::Shop => {
                self.shop_row = wrap(self.shop_row, delta, SHOP_FIELDS.len());
            }
            Pane::Items => {
                let len = self.session.item_count();
                if len == 0 {
                    return;
                }
                let current = self.items_state.selected().unwrap_or(0);
                self.items_state.select(Some(wrap(current, delta, len)));
            }
        }
    }

    fn start_edit(&mut self) {
        match self.current_path() {
            Some(path) => {
                let buffer = self.session.draft_text(&path).unwrap_or_default();
                self.message = None;
                self.mode = Mode::Editing { path, buffer };
            }
            None => self.message = Some("No item selected, press 'a' to add one".to_string()),
        }
    }

    fn commit_edit(&mut self, path: &str, text: &str) {
        self.message = match self.session.edit(path, text) {
            Ok(verdict) if verdict.is_valid() => Some(format!("{} updated", path)),
            Ok(verdict) => Some(format!(
                "{} updated, {} problem(s) left",
                path,
                verdict.errors().len()
            )),
            Err(e) => Some(e.to_string()),
        };
    }

    fn add_item(&mut self) {
        match self.session.add_item() {
            Ok(index) => {
                self.pane = Pane::Items;
                self.items_state.select(Some(index));
                self.item_col = 0;
                self.message = Some(format!("Added item {}", index + 1));
            }
            Err(e) => self.message = Some(e.to_string()),
        }
    }

    fn delete_item(&mut self) {
        let index = match self.selected_item() {
            Some(index) => index,
            None => return,
        };

        match self.session.remove_item(index) {
            Ok(()) => {
                let len = self.session.item_count();
                self.items_state
                    .select(if len == 0 { None } else { Some(index.min(len - 1)) });
                self.message = Some(format!("Removed item {}", index + 1));
            }
            Err(e) => self.message = Some(e.to_string()),
        }
    }
}

fn wrap(current: usize, delta: isize, len: usize) -> usize {
    let len = len as isize;
    ((current as isize + delta).rem_euclid(len)) as usize
}

// ============================================================================
// EVENT LOOP
// ============================================================================

/// Run the review screen until the receipt is saved or the user quits
pub fn run_review(session: ReviewSession, store: &ReceiptStore) -> Result<Outcome> {
    let mut app = App::new(session);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app, store);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    match res? {
        Some(stored) => Ok(Outcome::Persisted(stored)),
        None => Ok(Outcome::Abandoned(app.session)),
    }
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    store: &ReceiptStore,
) -> Result<Option<StoredReceipt>> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        let key = match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => key,
            _ => continue,
        };

        match app.handle_key(key) {
            Flow::Continue => {}
            Flow::Quit => return Ok(None),
            Flow::Save => match app.session.persist(store) {
                Ok(stored) => return Ok(Some(stored.clone())),
                Err(SessionError::Invalid(errors)) => {
                    app.message = Some(format!("Cannot save: {} validation problem(s)", errors.len()));
                }
                Err(e) => app.message = Some(format!("Save failed: {}", e)),
            },
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(8),    // Shop + items
            Constraint::Length(8), // Problems & advisories
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    let content = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(38), Constraint::Min(0)])
        .split(chunks[1]);
    render_shop(f, content[0], app);
    render_items(f, content[1], app);

    render_findings(f, chunks[2], app);
    render_status_bar(f, chunks[3], app);
}

fn pane_border(app: &App, pane: Pane) -> Style {
    if app.pane == pane {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::White)
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let source = app
        .session
        .image()
        .map(|i| i.source_name.clone())
        .unwrap_or_else(|| "(no image)".to_string());

    let (status, color) = match (app.session.stage(), app.session.verdict()) {
        (Stage::Persisted, _) => ("SAVED".to_string(), Color::Green),
        (_, Some(Verdict::Valid(_))) => ("VALID".to_string(), Color::Green),
        (_, Some(Verdict::Invalid(errors))) => (format!("INVALID ({})", errors.len()), Color::Red),
        (_, None) => ("NOT VALIDATED".to_string(), Color::DarkGray),
    };

    let mut spans = vec![
        Span::styled(" Receipt review ", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" │ "),
        Span::styled(source, Style::default().fg(Color::Cyan)),
        Span::raw(" │ "),
        Span::styled(status, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ];

    if let Some(report) = app.session.report() {
        let color = if report.is_balanced() {
            Color::Green
        } else if report.result.is_major() {
            Color::Red
        } else {
            Color::Yellow
        };
        spans.push(Span::raw(" │ "));
        spans.push(Span::styled(
            format!("items {:.2} / total {:.2}", report.items_total, report.shop_total),
            Style::default().fg(color),
        ));
    }

    let header = Paragraph::new(vec![Line::from(spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn has_error(app: &App, path: &str) -> bool {
    app.session
        .verdict()
        .map(|v| v.errors().iter().any(|e| e.field == path))
        .unwrap_or(false)
}

fn render_shop(f: &mut Frame, area: Rect, app: &App) {
    let rows = SHOP_FIELDS.iter().enumerate().map(|(i, spec)| {
        let path = format!("shop.{}", spec.name);
        let value = app.session.draft_text(&path).unwrap_or_default();

        let mut style = Style::default();
        if has_error(app, &path) {
            style = style.fg(Color::Red);
        }
        if app.pane == Pane::Shop && app.shop_row == i {
            style = style.bg(Color::DarkGray).add_modifier(Modifier::BOLD);
        }

        Row::new(vec![
            Cell::from(field_label(spec)),
            Cell::from(truncate(&value, 22)),
        ])
        .style(style)
    });

    let table = Table::new(rows, [Constraint::Length(10), Constraint::Min(0)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(pane_border(app, Pane::Shop))
            .title(" Shop "),
    );

    f.render_widget(table, area);
}

fn field_label(spec: &FieldSpec) -> String {
    if spec.required {
        format!("{}*", spec.name)
    } else {
        spec.name.to_string()
    }
}

fn render_items(f: &mut Frame, area: Rect, app: &mut App) {
    let header_cells = ITEM_FIELDS.iter().enumerate().map(|(col, spec)| {
        let mut style = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);
        if app.pane == Pane::Items && app.item_col == col {
            style = style.add_modifier(Modifier::UNDERLINED);
        }
        Cell::from(field_label(spec)).style(style)
    });
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let selected = app.selected_item();
    let rows: Vec<Row> = (0..app.session.item_count())
        .map(|row| {
            let cells = ITEM_FIELDS.iter().enumerate().map(|(col, spec)| {
                let path = format!("items[{}].{}", row, spec.name);
                let value = app.session.draft_text(&path).unwrap_or_default();

                let mut style = Style::default();
                if has_error(app, &path) {
                    style = style.fg(Color::Red);
                }
                if app.pane == Pane::Items && selected == Some(row) && app.item_col == col {
                    style = style.add_modifier(Modifier::REVERSED);
                }
                Cell::from(truncate(&value, 28)).style(style)
            });
            Row::new(cells).height(1)
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Min(20),
            Constraint::Length(8),
            Constraint::Length(7),
            Constraint::Length(7),
            Constraint::Length(5),
            Constraint::Length(22),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(pane_border(app, Pane::Items))
            .title(format!(" Items ({}) ", app.session.item_count())),
    )
    .highlight_style(Style::default().add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.items_state);
}

fn render_findings(f: &mut Frame, area: Rect, app: &App) {
    let mut lines: Vec<Line> = Vec::new();

    if let Some(error) = app.session.last_error() {
        lines.push(Line::from(Span::styled(
            format!("✗ {}", error),
            Style::default().fg(Color::Red),
        )));
    }

    if let Some(verdict) = app.session.verdict() {
        for error in verdict.errors() {
            lines.push(Line::from(Span::styled(
                format!("✗ {}: {}", error.field, error.message),
                Style::default().fg(Color::Red),
            )));
        }
    }

    if let Some(report) = app.session.report() {
        for advisory in &report.advisories {
            lines.push(Line::from(Span::styled(
                format!("⚠ {}", advisory),
                Style::default().fg(Color::Yellow),
            )));
        }
    }

    if lines.is_empty() {
        lines.push(Line::from(Span::styled(
            "✓ No problems found",
            Style::default().fg(Color::Green),
        )));
    }

    let findings = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Problems & advisories "));

    f.render_widget(findings, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let spans = match &app.mode {
        Mode::Editing { path, buffer } => vec![
            Span::styled(format!(" {} ", path), Style::default().fg(Color::Cyan)),
            Span::raw("= "),
            Span::styled(format!("{}▏", buffer), Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("   "),
            Span::styled("Enter", Style::default().fg(Color::Yellow)),
            Span::raw(" Apply | "),
            Span::styled("Esc", Style::default().fg(Color::Yellow)),
            Span::raw(" Cancel"),
        ],
        Mode::Navigate => {
            let mut spans = Vec::new();
            if let Some(message) = &app.message {
                spans.push(Span::styled(format!(" {} ", message), Style::default().fg(Color::Cyan)));
                spans.push(Span::raw("| "));
            }
            for (key, label) in [
                ("Enter", " Edit | "),
                ("Tab", " Pane | "),
                ("↑↓←→", " Move | "),
                ("a", " Add | "),
                ("d", " Delete | "),
                ("s", " Save | "),
            ] {
                spans.push(Span::styled(key, Style::default().fg(Color::Yellow)));
                spans.push(Span::raw(label));
            }
            spans.push(Span::styled("q", Style::default().fg(Color::Red)));
            spans.push(Span::raw(" Quit"));
            spans
        }
    };

    let status_bar = Paragraph::new(vec![Line::from(spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
    }

    fn app() -> App {
        let candidate = serde_json::from_str(include_str!("../fixtures/sample-receipt.json")).unwrap();
        App::new(ReviewSession::from_draft("alice", candidate, None))
    }

    #[test]
    fn test_edit_shop_field() {
        let mut app = app();
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.current_path().as_deref(), Some("shop.total"));

        app.handle_key(key(KeyCode::Enter));
        assert_eq!(
            app.mode,
            Mode::Editing {
                path: "shop.total".to_string(),
                buffer: "6.5".to_string()
            }
        );

        for _ in 0..3 {
            app.handle_key(key(KeyCode::Backspace));
        }
        type_text(&mut app, "8");
        app.handle_key(key(KeyCode::Enter));

        assert_eq!(app.mode, Mode::Navigate);
        assert!(app.session.report().unwrap().is_balanced());
    }

    #[test]
    fn test_escape_cancels_edit() {
        let mut app = app();
        app.handle_key(key(KeyCode::Enter));
        type_text(&mut app, " Express");
        app.handle_key(key(KeyCode::Esc));

        assert_eq!(app.mode, Mode::Navigate);
        assert_eq!(app.session.draft_text("shop.name").unwrap(), "My Supermarket");
    }

    #[test]
    fn test_save_refused_while_invalid() {
        let mut app = app();
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), Flow::Save);

        // Clear the shop name: required field
        app.handle_key(key(KeyCode::Enter));
        for _ in 0.."My Supermarket".len() {
            app.handle_key(key(KeyCode::Backspace));
        }
        app.handle_key(key(KeyCode::Enter));

        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), Flow::Continue);
        assert!(app.message.as_deref().unwrap().starts_with("Cannot save"));
        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), Flow::Quit);
    }

    #[test]
    fn test_item_navigation_add_delete() {
        let mut app = app();
        app.handle_key(key(KeyCode::Tab));
        assert_eq!(app.current_path().as_deref(), Some("items[0].name"));

        app.handle_key(key(KeyCode::Right));
        app.handle_key(key(KeyCode::Up));
        assert_eq!(app.current_path().as_deref(), Some("items[2].price"));

        app.handle_key(key(KeyCode::Left));
        app.handle_key(key(KeyCode::Left));
        assert_eq!(app.current_path().as_deref(), Some("items[2].category"));

        app.handle_key(key(KeyCode::Char('a')));
        assert_eq!(app.session.item_count(), 4);
        assert_eq!(app.current_path().as_deref(), Some("items[3].name"));

        app.handle_key(key(KeyCode::Char('d')));
        assert_eq!(app.session.item_count(), 3);
        assert_eq!(app.items_state.selected(), Some(2));
    }

    #[test]
    fn test_delete_last_item_clears_selection() {
        let mut app = app();
        app.handle_key(key(KeyCode::Tab));
        for _ in 0..3 {
            app.handle_key(key(KeyCode::Char('d')));
        }

        assert_eq!(app.session.item_count(), 0);
        assert_eq!(app.items_state.selected(), None);
        assert_eq!(app.current_path(), None);

        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.mode, Mode::Navigate);
        assert!(app.message.is_some());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Milk", 10), "Milk");
        assert_eq!(truncate("Bio Vollmilch 3,8%", 8), "Bio Vol…");
    }
}
