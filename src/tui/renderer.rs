//! TUI rendering logic using ratatui.
//!
//! Handles layout, formatting and color coding of the live display.

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame,
};

use super::state::{BandwidthState, ErrorInfo, TuiState};
use crate::speedtest::progress::TestPhase;

/// Get color for speed value based on thresholds.
///
/// - Green: >= 100 Mbps (fast)
/// - Yellow: 25-100 Mbps (moderate)
/// - Red: < 25 Mbps (slow)
pub fn speed_color(speed_mbps: f64) -> Color {
    if speed_mbps >= 100.0 {
        Color::Green
    } else if speed_mbps >= 25.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}

/// Format speed value with 2 decimal places.
pub fn format_speed(speed_mbps: f64) -> String {
    format!("{:.2} Mbps", speed_mbps)
}

/// Format latency value with 2 decimal places.
pub fn format_latency(latency_ms: f64) -> String {
    format!("{:.2} ms", latency_ms)
}

/// Gauge percentage for a `0.0..=1.0` fraction.
fn percent(progress: f64) -> u16 {
    (progress.clamp(0.0, 1.0) * 100.0).round() as u16
}

/// Minimal mode threshold in columns.
const MINIMAL_MODE_THRESHOLD: u16 = 60;

pub fn is_minimal_mode(width: u16) -> bool {
    width < MINIMAL_MODE_THRESHOLD
}

/// Render the TUI to the terminal, picking the compact layout on narrow
/// terminals.
pub fn render_frame(frame: &mut Frame, state: &TuiState) {
    if is_minimal_mode(frame.area().width) {
        render_minimal_frame(frame, state);
    } else {
        render_normal_frame(frame, state);
    }
}

fn render_normal_frame(frame: &mut Frame, state: &TuiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // Server
            Constraint::Length(2), // Current phase
            Constraint::Min(8),    // Progress/results
            Constraint::Length(1), // Status bar
        ])
        .split(frame.area());

    render_server(frame, chunks[0], state);
    render_phase_indicator(frame, chunks[1], state);
    render_progress_or_results(frame, chunks[2], state);
    render_status_bar(frame, chunks[3], state);
}

fn render_minimal_frame(frame: &mut Frame, state: &TuiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Phase + progress
            Constraint::Length(1), // Live value
            Constraint::Min(1),    // Results or error
        ])
        .split(frame.area());

    render_minimal_phase(frame, chunks[0], state);
    render_minimal_live(frame, chunks[1], state);
    render_minimal_results(frame, chunks[2], state);
}

fn label(text: &str) -> Span<'_> {
    Span::styled(
        text,
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
    )
}

pub fn render_server(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(Color::DarkGray));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let server = state.server.as_deref().unwrap_or("-");
    let line = Line::from(vec![
        label("Server: "),
        Span::styled(server.to_string(), Style::default().fg(Color::Cyan)),
    ]);

    frame.render_widget(Paragraph::new(line), inner);
}

pub fn render_phase_indicator(
    frame: &mut Frame,
    area: Rect,
    state: &TuiState,
) {
    let (phase_text, style) = if state.error.is_some() {
        (
            "✗ Stopped",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )
    } else {
        let text = match state.phase {
            TestPhase::Initializing => "◐ Initializing...",
            TestPhase::Ping => "▶ Ping Test",
            TestPhase::Download => "▶ Download Test",
            TestPhase::Upload => "▶ Upload Test",
            TestPhase::Complete => "✓ Complete",
        };
        let color = match state.phase {
            TestPhase::Complete => Color::Green,
            _ => Color::Yellow,
        };
        (text, Style::default().fg(color).add_modifier(Modifier::BOLD))
    };

    let block = Block::default().borders(Borders::BOTTOM);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    frame.render_widget(Paragraph::new(phase_text).style(style), inner);
}

/// Render progress bars or final results depending on phase.
pub fn render_progress_or_results(
    frame: &mut Frame,
    area: Rect,
    state: &TuiState,
) {
    if let Some(ref error) = state.error {
        render_error(frame, area, error, state);
        return;
    }

    match state.phase {
        TestPhase::Initializing => {
            let paragraph = Paragraph::new("Preparing...")
                .style(Style::default().fg(Color::Yellow));
            frame.render_widget(paragraph, area);
        }
        TestPhase::Ping => render_ping_progress(frame, area, state),
        TestPhase::Download => {
            render_bandwidth_progress(frame, area, state, &state.download)
        }
        TestPhase::Upload => {
            render_bandwidth_progress(frame, area, state, &state.upload)
        }
        TestPhase::Complete => {
            frame.render_widget(Paragraph::new(result_lines(state)), area)
        }
    }
}

pub fn render_status_bar(frame: &mut Frame, area: Rect, state: &TuiState) {
    let status_text = if state.finished {
        "Press any key to exit."
    } else {
        "Press q or Esc to abort."
    };

    let paragraph =
        Paragraph::new(status_text).style(Style::default().fg(Color::DarkGray));
    frame.render_widget(paragraph, area);
}

fn gauge(progress: f64) -> Gauge<'static> {
    let percent = percent(progress);
    Gauge::default()
        .block(Block::default().borders(Borders::NONE))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(percent)
        .label(format!("{}%", percent))
}

fn render_ping_progress(frame: &mut Frame, area: Rect, state: &TuiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(1)])
        .split(area);

    frame.render_widget(gauge(state.ping.progress), chunks[0]);

    let text = match (state.ping.current_ping_ms, state.ping.current_jitter_ms) {
        (Some(ping), Some(jitter)) => format!(
            "Ping: {}  Jitter: {}",
            format_latency(ping),
            format_latency(jitter)
        ),
        (Some(ping), None) => format!("Ping: {}", format_latency(ping)),
        _ => "Measuring...".to_string(),
    };

    let paragraph =
        Paragraph::new(text).style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, chunks[1]);
}

fn render_bandwidth_progress(
    frame: &mut Frame,
    area: Rect,
    state: &TuiState,
    bandwidth: &BandwidthState,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Progress bar
            Constraint::Length(2), // Current speed
            Constraint::Min(1),    // Earlier phases
        ])
        .split(area);

    frame.render_widget(gauge(bandwidth.progress), chunks[0]);

    let (speed_text, color) = match bandwidth.current_speed_mbps {
        Some(speed) => (
            format!(
                "Current: {}  Peak: {}",
                format_speed(speed),
                format_speed(bandwidth.peak_speed_mbps)
            ),
            speed_color(speed),
        ),
        None => ("Measuring...".to_string(), Color::White),
    };

    let paragraph = Paragraph::new(speed_text).style(Style::default().fg(color));
    frame.render_widget(paragraph, chunks[1]);

    let completed: Vec<Line> = result_lines(state)
        .into_iter()
        .map(|line| {
            let mut spans = vec![Span::styled(
                "✓ ",
                Style::default().fg(Color::Green),
            )];
            spans.extend(line.spans);
            Line::from(spans)
        })
        .collect();

    frame.render_widget(Paragraph::new(completed), chunks[2]);
}

/// One line per completed phase.
fn result_lines(state: &TuiState) -> Vec<Line<'static>> {
    let mut lines = Vec::new();

    if let Some(ping) = state.ping.final_ping_ms {
        let mut spans = vec![
            label("Ping: "),
            Span::styled(format_latency(ping), Style::default().fg(Color::Cyan)),
        ];

        if let Some(jitter) = state.ping.current_jitter_ms {
            spans.push(Span::raw("  "));
            spans.push(label("Jitter: "));
            spans.push(Span::styled(
                format_latency(jitter),
                Style::default().fg(Color::Cyan),
            ));
        }

        lines.push(Line::from(spans));
    }

    for (name, bandwidth) in
        [("Download: ", &state.download), ("Upload: ", &state.upload)]
    {
        if let Some(speed) = bandwidth.final_speed_mbps {
            lines.push(Line::from(vec![
                label(name),
                Span::styled(
                    format_speed(speed),
                    Style::default().fg(speed_color(speed)),
                ),
            ]));
        }
    }

    lines
}

/// Render the error with whatever was measured before it.
fn render_error(
    frame: &mut Frame,
    area: Rect,
    error: &ErrorInfo,
    state: &TuiState,
) {
    let mut lines: Vec<Line> = error
        .message
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            Line::from(Span::styled(
                line.to_string(),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ))
        })
        .collect();

    if let Some(ref suggestion) = error.suggestion {
        lines.push(Line::from(Span::styled(
            format!("Suggestion: {}", suggestion),
            Style::default().fg(Color::Yellow),
        )));
    }

    lines.push(Line::default());
    lines.extend(result_lines(state));

    frame.render_widget(Paragraph::new(lines), area);
}

fn render_minimal_phase(frame: &mut Frame, area: Rect, state: &TuiState) {
    let pct = percent(state.phase_progress());
    let text = match state.phase {
        TestPhase::Initializing => "◐ Init".to_string(),
        TestPhase::Ping => format!("▶ Ping {}%", pct),
        TestPhase::Download => format!("▶ Download {}%", pct),
        TestPhase::Upload => format!("▶ Upload {}%", pct),
        TestPhase::Complete => "✓ Done".to_string(),
    };

    let style = if state.phase == TestPhase::Complete {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::Yellow)
    };

    frame.render_widget(Paragraph::new(text).style(style), area);
}

fn render_minimal_live(frame: &mut Frame, area: Rect, state: &TuiState) {
    let (text, color) = match state.phase {
        TestPhase::Ping => (
            state.ping.current_ping_ms.map(format_latency).unwrap_or_default(),
            Color::White,
        ),
        TestPhase::Download | TestPhase::Upload => {
            let bandwidth = if state.phase == TestPhase::Download {
                &state.download
            } else {
                &state.upload
            };
            match bandwidth.current_speed_mbps {
                Some(speed) => (format_speed(speed), speed_color(speed)),
                None => (String::new(), Color::White),
            }
        }
        _ => (String::new(), Color::White),
    };

    frame.render_widget(
        Paragraph::new(text).style(Style::default().fg(color)),
        area,
    );
}

fn render_minimal_results(frame: &mut Frame, area: Rect, state: &TuiState) {
    if let Some(ref error) = state.error {
        let first = error.message.lines().next().unwrap_or_default();
        let paragraph = Paragraph::new(first.to_string())
            .style(Style::default().fg(Color::Red));
        frame.render_widget(paragraph, area);
        return;
    }

    frame.render_widget(Paragraph::new(result_lines(state)), area);
}
