use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tesira_ttp::{
    BlockKind, ClientConfig, ConnectionStatus, ControlBlock, EventReceiver, IoChannel, LevelControlBlock, Message,
    SourceSelectorBlock, TesiraClient, TransportKind, VolumeControl,
};

const MESSAGE_HISTORY: usize = 200;

struct App {
    client: TesiraClient,
    level: Arc<LevelControlBlock>,
    selector: Option<Arc<SourceSelectorBlock>>,
    selected_channel: usize,
    status_message: String,
    messages: EventReceiver<Message>,
    statuses: EventReceiver<ConnectionStatus>,
    history: VecDeque<String>,
}

impl App {
    fn new(client: TesiraClient, level_tag: &str, selector_tag: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let level = client.register_block(BlockKind::LevelControl, level_tag)?;
        level.subscribe();
        let level = level.as_level().cloned().ok_or("level block has the wrong kind")?;

        let selector = match selector_tag {
            Some(tag) => {
                let block = client.register_block(BlockKind::SourceSelector, tag)?;
                block.subscribe();
                block.as_source_selector().cloned()
            }
            None => None,
        };

        let messages = client.subscribe_messages();
        let statuses = client.subscribe_status();

        Ok(Self {
            client,
            level,
            selector,
            selected_channel: 0,
            status_message: "Connecting...".to_string(),
            messages,
            statuses,
            history: VecDeque::with_capacity(MESSAGE_HISTORY),
        })
    }

    fn select_next(&mut self) {
        let count = self.level.channels().len();
        if count > 0 {
            self.selected_channel = (self.selected_channel + 1) % count;
        }
    }

    fn select_previous(&mut self) {
        let count = self.level.channels().len();
        if count > 0 {
            if self.selected_channel == 0 {
                self.selected_channel = count - 1;
            } else {
                self.selected_channel -= 1;
            }
        }
    }

    fn current_channel(&self) -> Option<Arc<IoChannel>> {
        self.level.channels().get(self.selected_channel).cloned()
    }

    fn adjust_level(&mut self, delta: f64) {
        if let Some(channel) = self.current_channel() {
            let new_level = (channel.level() + delta).clamp(channel.min_level(), channel.max_level());
            self.status_message = match channel.set_level(new_level) {
                Ok(()) => format!("{}: {:.1} dB", channel.name(), new_level),
                Err(e) => format!("Failed to set level: {}", e),
            };
        } else {
            self.status_message = "No channels yet".to_string();
        }
    }

    fn toggle_mute(&mut self) {
        if let Some(channel) = self.current_channel() {
            self.status_message = match channel.toggle_mute() {
                Ok(()) => format!("{}: mute {}", channel.name(), if channel.muted() { "OFF" } else { "ON" }),
                Err(e) => format!("Failed to set mute: {}", e),
            };
        }
    }

    fn cycle_source(&mut self) {
        let Some(selector) = &self.selector else {
            self.status_message = "No source selector".to_string();
            return;
        };
        let sources = selector.number_of_sources();
        if sources == 0 {
            self.status_message = "Source selector not initialized".to_string();
            return;
        }
        let next = (selector.source_selection() + 1) % (sources + 1);
        self.status_message = match selector.set_source_selection(next) {
            Ok(()) => format!("Source: {}", next),
            Err(e) => format!("Failed to select source: {}", e),
        };
    }

    fn drain_events(&mut self) {
        while let Ok(Some(status)) = self.statuses.try_recv() {
            self.status_message = match status {
                ConnectionStatus::Connected => "Connected! j/k select, +/- level, m mute, s source, p preset, q quit".to_string(),
                ConnectionStatus::AttemptingConnection => "Connecting...".to_string(),
                ConnectionStatus::Disconnected => "Disconnected, retrying".to_string(),
            };
        }
        while let Ok(Some(message)) = self.messages.try_recv() {
            if self.history.len() == MESSAGE_HISTORY {
                self.history.pop_front();
            }
            self.history.push_back(describe(&message));
        }
    }
}

fn describe(message: &Message) -> String {
    match message {
        Message::Acknowledged { command } => format!("+OK  {}", command),
        Message::AcknowledgedWithPayload { command, payload } => format!("+OK  {} {}", command, payload),
        Message::ErrorResponse { command, message } => format!("-ERR {} {}", command, message),
        Message::Notification { publish_token, payload } => format!("!    {} {}", publish_token, payload),
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    let inner_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(outer_chunks[0]);

    render_channels(f, app, inner_chunks[0]);
    render_messages(f, app, inner_chunks[1]);
    render_status(f, app, outer_chunks[1]);
}

fn render_channels(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(format!(" {} ({:?}) ", app.level.core().name(), app.client.status()))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let channels = app.level.channels();
    if channels.is_empty() {
        let text = Paragraph::new("Waiting for the block to report its channels...")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    }

    let mut items: Vec<ListItem> = channels
        .iter()
        .map(|channel| {
            let muted = channel.muted();
            ListItem::new(vec![
                Line::from(vec![
                    Span::styled(format!("{}: ", channel.name()), Style::default().fg(Color::Yellow)),
                    Span::styled(
                        format!("{:.1} dB", channel.level()),
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    ),
                    Span::raw(format!(" ({}%) ", channel.volume_percent())),
                    Span::styled(
                        if muted { "MUTED" } else { "on" },
                        if muted {
                            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
                        } else {
                            Style::default().fg(Color::Green)
                        },
                    ),
                ]),
                Line::from(Span::styled(
                    format!("  range {:.1} .. {:.1} dB", channel.min_level(), channel.max_level()),
                    Style::default().fg(Color::Gray),
                )),
            ])
        })
        .collect();

    if let Some(selector) = &app.selector {
        items.push(ListItem::new(vec![
            Line::from(""),
            Line::from(vec![
                Span::styled("Source: ", Style::default().fg(Color::Yellow)),
                Span::raw(format!(
                    "{} of {}",
                    selector.source_selection(),
                    selector.number_of_sources()
                )),
            ]),
        ]));
    }

    let mut state = ListState::default();
    state.select(Some(app.selected_channel));

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn render_messages(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Device traffic ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .history
        .iter()
        .skip(app.history.len().saturating_sub(height))
        .map(|line| Line::from(line.as_str()))
        .collect();

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(address), Some(level_tag)) = (args.next(), args.next()) else {
        eprintln!("usage: mixer <address> <level block tag> [source selector tag]");
        return Ok(());
    };
    let selector_tag = args.next();

    let mut config = ClientConfig::new(address);
    if std::env::var("TESIRA_SSH").is_ok() {
        config = config.with_transport(TransportKind::Ssh);
    }
    if let (Ok(username), Ok(password)) = (std::env::var("TESIRA_USERNAME"), std::env::var("TESIRA_PASSWORD")) {
        config = config.with_credentials(username, password);
    }
    let client = TesiraClient::new(config)?;
    let mut app = App::new(client, &level_tag, selector_tag.as_deref())?;
    app.client.connect();

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    app.client.shutdown().await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        app.drain_events();
        terminal.draw(|f| ui(f, app))?;

        // Handle input events (non-blocking)
        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') => return Ok(()),
                        KeyCode::Char('j') | KeyCode::Down => app.select_next(),
                        KeyCode::Char('k') | KeyCode::Up => app.select_previous(),
                        KeyCode::Char('+') | KeyCode::Char('=') => app.adjust_level(1.0),
                        KeyCode::Char('-') | KeyCode::Char('_') => app.adjust_level(-1.0),
                        KeyCode::Char('m') => app.toggle_mute(),
                        KeyCode::Char('s') => app.cycle_source(),
                        KeyCode::Char('p') => {
                            if let Err(e) = app.client.recall_preset(1001) {
                                app.status_message = format!("Failed to recall preset: {}", e);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        // Let the session tasks run between frames
        tokio::task::yield_now().await;
    }
}
