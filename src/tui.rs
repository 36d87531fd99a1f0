use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};
use std::{
    fmt,
    sync::{Arc, Mutex},
    thread,
};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::BidsError;
use crate::executor::CancelToken;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Resolve,
    Plan,
    Execute,
    Finalize,
    Validate,
}

impl Phase {
    const ALL: [Phase; 6] = [
        Phase::Scan,
        Phase::Resolve,
        Phase::Plan,
        Phase::Execute,
        Phase::Finalize,
        Phase::Validate,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Scan => "Scan",
            Phase::Resolve => "Resolve",
            Phase::Plan => "Plan",
            Phase::Execute => "Execute",
            Phase::Finalize => "Finalize",
            Phase::Validate => "Validate",
        }
    }

    fn index(self) -> usize {
        match self {
            Phase::Scan => 0,
            Phase::Resolve => 1,
            Phase::Plan => 2,
            Phase::Execute => 3,
            Phase::Finalize => 4,
            Phase::Validate => 5,
        }
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    entries: Option<(usize, usize)>,
    failed: usize,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    active: bool,
    cancelling: bool,
}

pub struct Tui {
    kind: ProgressSinkKind,
    target: String,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                state.phase = phase;
                state.status = payload.to_string();
                if phase == Phase::Execute {
                    if let Some(progress) = parse_entry_progress(payload) {
                        state.entries = Some(progress);
                    }
                    if payload.contains(" Failed ") {
                        state.failed = state.failed.saturating_add(1);
                    }
                }
            } else {
                state.status = message.clone();
            }

            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            push_bounded(&mut state.logs, format!("[{}] {message}", timestamp()), LOGS_MAX);
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Scan,
                entries: None,
                failed: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                started: Instant::now(),
                active: false,
                cancelling: false,
            })),
            log_scroll: 0,
        }
    }

    pub fn run<F, R>(&mut self, cancel: &CancelToken, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, BidsError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let result = loop {
            if let Ok(state) = self.state.lock() {
                let elapsed = state.started.elapsed();
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick, elapsed))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                break result;
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        cancel.cancel();
                        if let Ok(mut state) = self.state.lock() {
                            state.cancelling = true;
                            state.status = "cancelling after the entries in flight".to_string();
                        }
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        self.set_active(false);
        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        handle.join().ok();
        result.map_err(miette::Report::new)
    }

    pub fn confirm_drift(&mut self, drift: usize) -> miette::Result<bool> {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;

        let confirmed = loop {
            terminal
                .draw(|frame| {
                    let block = Block::default().borders(Borders::ALL).title("Confirm");
                    let text = Paragraph::new(vec![
                        Line::from(format!(
                            "{drift} converted entries no longer match their source."
                        )),
                        Line::from("Re-convert them and record new manifest versions?"),
                        Line::from("Press y to confirm, n to cancel."),
                    ])
                    .alignment(Alignment::Center)
                    .block(block);
                    frame.render_widget(text, frame.area());
                })
                .into_diagnostic()?;

            if event::poll(Duration::from_millis(100)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    match key.code {
                        KeyCode::Char('y') | KeyCode::Char('Y') => break true,
                        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => break false,
                        _ => {}
                    }
                }
            }
        };

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        Ok(confirmed)
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::F(1) | KeyCode::Char('?') => self.set_view(View::Help),
            KeyCode::F(4) => self.set_view(View::Logs),
            KeyCode::F(3) | KeyCode::Enter => self.set_view(View::Operational),
            KeyCode::PageUp => self.scroll_logs(5),
            KeyCode::PageDown => self.scroll_logs(-5),
            KeyCode::Char('q') | KeyCode::Esc => return self.is_active(),
            _ => {}
        }
        false
    }

    fn set_view(&self, view: View) {
        if let Ok(mut state) = self.state.lock() {
            state.view = view;
        }
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|state| state.active).unwrap_or(false)
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
                state.phase = Phase::Scan;
                state.entries = None;
                state.failed = 0;
                state.cancelling = false;
            }
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let max = self.state.lock().map(|state| state.logs.len()).unwrap_or(0);
        let max_scroll = max.saturating_sub(1) as i16;
        let next = (self.log_scroll as i16 + delta).clamp(0, max_scroll);
        self.log_scroll = next as u16;
    }
}

fn draw_ui(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    state: &AppState,
    tick: usize,
    elapsed: Duration,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui, tick), chunks[0]);
    match state.view {
        View::Operational => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
                .split(chunks[1]);
            frame.render_widget(draw_status_panel(state, elapsed), main[0]);
            frame.render_widget(draw_phase_panel(state), main[1]);
        }
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
        View::Help => frame.render_widget(draw_help(), chunks[1]),
    }
    frame.render_widget(draw_footer(state), chunks[2]);
}

fn draw_header(tui: &Tui, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match tui.kind {
        ProgressSinkKind::Convert => "Convert",
        ProgressSinkKind::Plan => "Plan",
        ProgressSinkKind::Validate => "Validate",
    };
    let header_line = Line::from(vec![
        Span::styled(
            "UKB2BIDS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let target_line = Line::from(Span::styled(
        tui.target.clone(),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, target_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState, elapsed: Duration) -> Paragraph<'static> {
    let progress = progress_percent(state);
    let phase_color = if state.cancelling {
        Color::Yellow
    } else if state.active {
        Color::Cyan
    } else {
        Color::Green
    };
    let entries = state
        .entries
        .map(|(finished, total)| format!("{finished}/{total}"))
        .unwrap_or_else(|| "--".to_string());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<8} ", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(progress)),
            Span::raw(format!(" {progress:>3}%")),
        ]),
        Line::from(vec![
            Span::styled("Entries: ", Style::default().fg(Color::Gray)),
            Span::raw(entries),
            Span::styled("   Failed: ", Style::default().fg(Color::Gray)),
            Span::styled(
                state.failed.to_string(),
                Style::default().fg(if state.failed > 0 {
                    Color::Red
                } else {
                    Color::Gray
                }),
            ),
        ]),
        Line::from(vec![
            Span::styled("Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{:.1}s", elapsed.as_secs_f64())),
        ]),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev().take(3) {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_phase_panel(state: &AppState) -> Paragraph<'static> {
    let mut lines = vec![Line::from(Span::styled(
        "PHASES",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    ))];
    for phase in Phase::ALL {
        let (mark, color) = match phase.index().cmp(&state.phase.index()) {
            std::cmp::Ordering::Less => ("[v]", Color::Green),
            std::cmp::Ordering::Equal if state.active => ("[>]", Color::Cyan),
            std::cmp::Ordering::Equal => ("[v]", Color::Green),
            std::cmp::Ordering::Greater => ("[ ]", Color::Gray),
        };
        lines.push(Line::from(Span::styled(
            format!("{mark} {phase}"),
            Style::default().fg(color),
        )));
    }
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let total = state.logs.len();
    let visible = 12usize;
    let start = total.saturating_sub(scroll as usize + visible);
    let mut lines = Vec::with_capacity(visible + 1);
    lines.push(Line::from(Span::styled(
        "LOGS (PgUp/PgDown)",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )));
    for line in state.logs.iter().skip(start).take(visible) {
        lines.push(Line::from(line.clone()));
    }
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_help() -> Paragraph<'static> {
    let lines = vec![
        Line::from("F1/? help   F3/Enter status   F4 logs"),
        Line::from("q/Esc cancel: entries already started finish, the rest are skipped"),
    ];
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true })
}

fn draw_footer(state: &AppState) -> Paragraph<'static> {
    let hint = if state.cancelling {
        "cancelling..."
    } else {
        "q cancel  F4 logs  F1 help"
    };
    Paragraph::new(Line::from(Span::styled(
        hint,
        Style::default().fg(Color::DarkGray),
    )))
    .block(Block::default().borders(Borders::TOP))
}

fn progress_percent(state: &AppState) -> u8 {
    match (state.phase, state.entries) {
        (Phase::Execute, Some((finished, total))) if total > 0 => {
            let base = Phase::Execute.index() as f64 / Phase::ALL.len() as f64;
            let span = 1.0 / Phase::ALL.len() as f64;
            ((base + span * finished as f64 / total as f64) * 100.0) as u8
        }
        (phase, _) if !state.active && phase == Phase::Validate => 100,
        (phase, _) => (phase.index() as f64 / Phase::ALL.len() as f64 * 100.0) as u8,
    }
}

fn progress_bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100)) / 10;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(10 - filled))
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = Phase::ALL
        .into_iter()
        .find(|phase| phase.label() == name.trim())?;
    Some((phase, payload.trim()))
}

fn parse_entry_progress(payload: &str) -> Option<(usize, usize)> {
    let (finished, total) = payload.split_whitespace().next()?.split_once('/')?;
    Some((finished.parse().ok()?, total.parse().ok()?))
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, cap: usize) {
    if buffer.len() >= cap {
        buffer.drain(..=buffer.len() - cap);
    }
    buffer.push_back(item);
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phase_events() {
        let (phase, payload) = parse_phase("phase=Execute; 3/10 Transferred sub-1/anat/x.zip")
            .unwrap();
        assert_eq!(phase, Phase::Execute);
        assert_eq!(parse_entry_progress(payload), Some((3, 10)));
        assert!(parse_phase("phase=Unknown; x").is_none());
        assert!(parse_phase("plain message").is_none());
    }
}
