use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};
use std::{io, path::PathBuf, time::Duration};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use autosync::display::{file_icon, format_file_size, format_time, sender_label};
use autosync::models::{ConnectionState, Origin};
use autosync::sync::download::DownloadProgress;
use autosync::sync::{MessageLog, RenderSink, RenderedMessage};

pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

/// Something the user asked for that the main loop has to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    Send(String),
    Upload(Vec<PathBuf>),
    /// 1-based display position of a file entry
    Download(usize),
    Quit,
}

pub struct ChatUI {
    log: MessageLog,
    input: Input,
    server: String,
    connection_state: ConnectionState,
    notification: Option<Notification>,
    download: Option<DownloadIndicator>,
    help_dialog: bool,
}

struct Notification {
    text: String,
    is_error: bool,
    created: chrono::DateTime<chrono::Utc>,
}

struct DownloadIndicator {
    name: String,
    progress: DownloadProgress,
}

impl ChatUI {
    pub fn new(server: &str) -> Self {
        ChatUI {
            log: MessageLog::new(),
            input: Input::default(),
            server: server.to_string(),
            connection_state: ConnectionState::Connecting,
            notification: None,
            download: None,
            help_dialog: false,
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn notify(&mut self, text: impl Into<String>) {
        self.set_notification(text.into(), false);
    }

    pub fn notify_error(&mut self, text: impl Into<String>) {
        self.set_notification(text.into(), true);
    }

    fn set_notification(&mut self, text: String, is_error: bool) {
        debug!("UI notification: {}", text);
        self.notification = Some(Notification {
            text,
            is_error,
            created: chrono::Utc::now(),
        });
    }

    pub fn clean_notifications(&mut self, timeout_secs: i64) {
        let expired = self
            .notification
            .as_ref()
            .map(|n| chrono::Utc::now().signed_duration_since(n.created).num_seconds() >= timeout_secs)
            .unwrap_or(false);
        if expired {
            self.notification = None;
        }
    }

    pub fn start_download(&mut self, name: &str) {
        self.download = Some(DownloadIndicator {
            name: name.to_string(),
            progress: DownloadProgress { received: 0, total: None },
        });
    }

    pub fn update_download(&mut self, progress: DownloadProgress) {
        if let Some(indicator) = self.download.as_mut() {
            indicator.progress = progress;
        }
    }

    /// Back to idle, whether the download finished or failed.
    pub fn finish_download(&mut self) {
        self.download = None;
    }

    pub fn is_downloading(&self) -> bool {
        self.download.is_some()
    }

    /// Clear the input after a successful send, unless the user already typed
    /// something else while the request was in flight.
    pub fn clear_input_if(&mut self, sent: &str) {
        if self.input.value().trim() == sent.trim() {
            self.input.reset();
        }
    }

    pub fn handle_input(&mut self) -> Result<Option<UiAction>> {
        if !event::poll(Duration::from_millis(10))? {
            return Ok(None);
        }

        let event = event::read()?;
        let key = match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => key,
            _ => return Ok(None),
        };

        if self.help_dialog {
            // Any key closes the help dialog
            self.help_dialog = false;
            return Ok(None);
        }

        match key.code {
            KeyCode::Esc => Ok(Some(UiAction::Quit)),
            KeyCode::F(1) => {
                self.help_dialog = true;
                Ok(None)
            }
            KeyCode::Enter => {
                let line = self.input.value().to_string();
                match parse_command(&line) {
                    Ok(Command::Action(action)) => {
                        // Commands are cleared right away; text is cleared once the send succeeds
                        if !matches!(action, UiAction::Send(_)) {
                            self.input.reset();
                        }
                        Ok(Some(action))
                    }
                    Ok(Command::Help) => {
                        self.input.reset();
                        self.help_dialog = true;
                        Ok(None)
                    }
                    Ok(Command::Nothing) => Ok(None),
                    Err(usage) => {
                        self.notify_error(usage);
                        Ok(None)
                    }
                }
            }
            _ => {
                self.input.handle_event(&event);
                Ok(None)
            }
        }
    }

    pub fn draw<B: Backend>(&self, frame: &mut Frame<B>) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(5),    // Messages area
                Constraint::Length(1), // Notification / download line
                Constraint::Length(3), // Input box
                Constraint::Length(1), // Help line
            ])
            .split(size);

        draw_messages(frame, self, chunks[0]);
        draw_status_line(frame, self, chunks[1]);

        let input_widget = Paragraph::new(self.input.value())
            .block(Block::default().title("Message").borders(Borders::ALL).border_style(Style::default().fg(Color::Yellow)));
        frame.render_widget(input_widget, chunks[2]);

        let help = Paragraph::new(Line::from(vec![Span::styled(
            "ESC quit | Enter send | /upload <path>... | /download <n> | /help",
            Style::default().fg(Color::Gray),
        )]));
        frame.render_widget(help, chunks[3]);

        frame.set_cursor(chunks[2].x + self.input.cursor() as u16 + 1, chunks[2].y + 1);

        if self.help_dialog {
            draw_help_dialog(frame, size);
        }
    }
}

impl RenderSink for ChatUI {
    fn clear(&mut self) {
        self.log.clear();
    }

    fn upsert(&mut self, entry: RenderedMessage) {
        self.log.upsert(entry);
    }
}

enum Command {
    Action(UiAction),
    Help,
    Nothing,
}

// Enter on the input line. Errors are usage hints for the notification line.
fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Command::Nothing);
    }
    if !trimmed.starts_with('/') {
        return Ok(Command::Action(UiAction::Send(trimmed.to_string())));
    }
    // "//" escapes a message that starts with a slash
    if let Some(text) = trimmed.strip_prefix("//") {
        return Ok(Command::Action(UiAction::Send(format!("/{}", text))));
    }

    let words = split_words(trimmed)?;
    let mut parts = words.iter().map(String::as_str);
    let command = parts.next().unwrap_or_default();
    match command {
        "/upload" => {
            let paths: Vec<PathBuf> = parts.filter(|p| !p.is_empty()).map(PathBuf::from).collect();
            if paths.is_empty() {
                Err("Usage: /upload <path> [<path>...]".to_string())
            } else {
                Ok(Command::Action(UiAction::Upload(paths)))
            }
        }
        "/download" => match parts.next().map(|n| n.trim_start_matches('#').parse::<usize>()) {
            Some(Ok(position)) if position > 0 => Ok(Command::Action(UiAction::Download(position))),
            _ => Err("Usage: /download <n> (the #n shown next to a file)".to_string()),
        },
        "/help" => Ok(Command::Help),
        "/quit" => Ok(Command::Action(UiAction::Quit)),
        other => Err(format!("Unknown command {}; try /help", other)),
    }
}

// Whitespace separated words; double or single quotes group a word with spaces in it.
fn split_words(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err("Unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn entry_line(position: usize, entry: &RenderedMessage) -> String {
    let message = &entry.message;
    let prefix = format!(
        "[{}] {}: ",
        format_time(&message.timestamp),
        sender_label(entry.origin, &message.sender_endpoint)
    );

    match message.file_reference() {
        Some(file) => format!(
            "{}#{} {} {} ({})",
            prefix,
            position,
            file_icon(&message.content),
            message.content,
            format_file_size(file.size)
        ),
        None => format!("{}{}", prefix, message.content),
    }
}

fn draw_messages<B: Backend>(f: &mut Frame<B>, ui: &ChatUI, area: Rect) {
    let wrap_width = area.width.saturating_sub(2).max(1) as usize;

    let items: Vec<ListItem> = ui
        .log
        .entries()
        .iter()
        .enumerate()
        .flat_map(|(i, entry)| {
            let style = match entry.origin {
                Origin::Sent => Style::default().fg(Color::Cyan),
                Origin::Received => Style::default(),
            };
            let line = entry_line(i + 1, entry);
            wrap(&line, wrap_width)
                .into_iter()
                .map(|l| l.into_owned())
                .collect::<Vec<_>>()
                .into_iter()
                .map(move |l| ListItem::new(Text::from(l)).style(style))
        })
        .collect();

    let (indicator, color) = match ui.connection_state {
        ConnectionState::Open => ("●", Color::Green),
        ConnectionState::Connecting => ("◌", Color::Yellow),
        ConnectionState::Closed => ("○", Color::Red),
    };
    let title = Line::from(vec![
        Span::styled(format!("{} {} ", indicator, ui.connection_state.label()), Style::default().fg(color)),
        Span::raw(format!("| {} ", ui.server)),
    ]);

    // Keep the newest entry in view
    let mut list_state = ListState::default();
    if !items.is_empty() {
        list_state.select(Some(items.len() - 1));
    }

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default());
    f.render_stateful_widget(list, area, &mut list_state);
}

fn draw_status_line<B: Backend>(f: &mut Frame<B>, ui: &ChatUI, area: Rect) {
    let line = if let Some(download) = &ui.download {
        let progress = match download.progress.fraction() {
            Some(fraction) => format!("{:.0}%", fraction * 100.0),
            None => format_file_size(download.progress.received),
        };
        Line::from(Span::styled(
            format!("⬇ Downloading {}... {}", download.name, progress),
            Style::default().fg(Color::Yellow),
        ))
    } else if let Some(notification) = &ui.notification {
        let color = if notification.is_error { Color::Red } else { Color::Green };
        Line::from(Span::styled(notification.text.clone(), Style::default().fg(color)))
    } else {
        Line::from("")
    };

    f.render_widget(Paragraph::new(line), area);
}

fn draw_help_dialog<B: Backend>(f: &mut Frame<B>, area: Rect) {
    let popup_width = 64.min(area.width.saturating_sub(4));
    let popup_height = 14.min(area.height.saturating_sub(4));
    let popup_x = (area.width - popup_width) / 2;
    let popup_y = (area.height - popup_height) / 2;
    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    let popup_block = Block::default()
        .title("Commands")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });

    let shortcuts = [
        ("Enter", "Send the typed message"),
        ("/upload", "Upload files: /upload a.pdf \"my notes.txt\""),
        ("/download", "Save file #n to the download folder"),
        ("//text", "Send a message starting with /"),
        ("/help, F1", "Show this dialog"),
        ("ESC", "Quit"),
        ("", ""),
        ("Press any key to close this dialog", ""),
    ];

    let items: Vec<ListItem> = shortcuts
        .iter()
        .map(|(key, desc)| {
            if desc.is_empty() {
                ListItem::new(key.to_string())
            } else {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{:<12}", key), Style::default().fg(Color::Green)),
                    Span::raw(desc.to_string()),
                ]))
            }
        })
        .collect();

    f.render_widget(List::new(items), inner_area);
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
