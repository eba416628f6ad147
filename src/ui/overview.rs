use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use crossterm::{
    cursor::Show,
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, List, ListItem, Paragraph, Row, Table, Tabs},
    Terminal,
};

use crate::aggregate::{Channel, Summary};
use crate::classify::{classify, MetricKind};
use crate::metrics::ThroughputSample;
use crate::monitor::{request_speed_test, Trigger, TriggerRefusal};
use crate::source::{PingStatus, ProbeStatus};
use crate::state::LiveState;
use crate::ui::history::{band_style, history_table};

const MAX_EVENTS: usize = 100;

fn chart_points(window: &[ThroughputSample], channel: Channel) -> Vec<(f64, f64)> {
    window.iter().enumerate().map(|(i, s)| (i as f64, channel.value(s))).collect()
}

fn summary_row(channel: Channel, s: &Summary) -> Row<'static> {
    Row::new(vec![
        channel.label().to_string(),
        format!("{:.2}", s.current),
        format!("{:.2}", s.mean),
        format!("{:.2}", s.median),
        format!("{:.2}", s.max),
    ])
}

fn ping_item(p: &PingStatus) -> ListItem<'static> {
    let text = match (&p.status, p.latency_ms) {
        (ProbeStatus::Success, Some(ms)) => format!("{:<16}{ms:.0} ms", p.address),
        (ProbeStatus::Failed(reason), _) => format!("{:<16}failed: {reason}", p.address),
        (ProbeStatus::Success, None) => format!("{:<16}-", p.address),
    };
    ListItem::new(text).style(band_style(classify(MetricKind::Ping, p.latency_ms)))
}

/// Leaves raw mode and the alternate screen when dropped, so an early `?`
/// return still hands back a usable terminal.
struct TerminalRestore<W: Write> {
    out: W,
}

impl<W: Write> Drop for TerminalRestore<W> {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.out, LeaveAlternateScreen, Show);
    }
}

fn refusal_message(r: TriggerRefusal) -> &'static str {
    match r {
        TriggerRefusal::LinkBusy => "Speed test refused: link is busy",
        TriggerRefusal::AlreadyRunning => "Speed test already running",
        TriggerRefusal::AlreadyQueued => "Speed test already queued",
    }
}

pub fn run_tui(
    state: Arc<LiveState>,
    events: Receiver<String>,
    triggers: Sender<Trigger>,
    endpoints: Vec<String>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    enable_raw_mode()?;
    let _restore = TerminalRestore { out: std::io::stdout() };
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut logs: Vec<String> = Vec::new();
    let mut active_tab: usize = 0; // 0: Live, 1: History
    let capacity = state.window_capacity();

    while !stop.load(Ordering::Relaxed) {
        while let Ok(ev) = events.try_recv() {
            logs.push(ev);
            if logs.len() > MAX_EVENTS {
                logs.remove(0);
            }
        }

        let window = state.window();
        let rx = state.summary(Channel::Rx);
        let tx = state.summary(Channel::Tx);
        let pings = state.pings_for(&endpoints);
        let history = state.history();
        let testing = state.speed_test_running();

        terminal.draw(|f| {
            let outer = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(1), // Tabs header
                    Constraint::Min(0),    // Main
                    Constraint::Length(1), // Footer
                ].as_ref())
                .split(f.size());

            let titles = ["Live", "History"].iter().map(|t| (*t).to_string());
            f.render_widget(Tabs::new(titles).select(active_tab), outer[0]);

            if active_tab == 0 {
                let rows = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([
                        Constraint::Min(10),   // Chart
                        Constraint::Length(5), // Aggregates + pings
                        Constraint::Length(6), // Events
                    ].as_ref())
                    .split(outer[1]);

                let rx_points = chart_points(&window, Channel::Rx);
                let tx_points = chart_points(&window, Channel::Tx);
                let top = rx.max.max(tx.max).max(1.0) * 1.1;
                let datasets = vec![
                    Dataset::default()
                        .name("RX")
                        .marker(Marker::Braille)
                        .graph_type(GraphType::Line)
                        .style(Style::default().fg(Color::LightBlue))
                        .data(&rx_points),
                    Dataset::default()
                        .name("TX")
                        .marker(Marker::Braille)
                        .graph_type(GraphType::Line)
                        .style(Style::default().fg(Color::LightMagenta))
                        .data(&tx_points),
                ];
                let first = window.first().map_or("", |s| s.time.as_str()).to_string();
                let last = window.last().map_or("", |s| s.time.as_str()).to_string();
                let chart = Chart::new(datasets)
                    .block(Block::default().title("Throughput (Mb/s)").borders(Borders::ALL))
                    .x_axis(
                        Axis::default()
                            .bounds([0.0, capacity.saturating_sub(1).max(1) as f64])
                            .labels(vec![Span::raw(first), Span::raw(last)]),
                    )
                    .y_axis(
                        Axis::default()
                            .bounds([0.0, top])
                            .labels(vec![Span::raw("0"), Span::raw(format!("{top:.1}"))]),
                    );
                f.render_widget(chart, rows[0]);

                let mid = Layout::default()
                    .direction(Direction::Horizontal)
                    .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
                    .split(rows[1]);

                let stats = Table::new(
                    vec![summary_row(Channel::Rx, &rx), summary_row(Channel::Tx, &tx)],
                    [Constraint::Length(4), Constraint::Length(9), Constraint::Length(9), Constraint::Length(9), Constraint::Length(9)],
                )
                .header(Row::new(vec!["", "current", "mean", "median", "max"]))
                .block(Block::default().title("Aggregates (Mb/s)").borders(Borders::ALL));
                f.render_widget(stats, mid[0]);

                let ping_items: Vec<ListItem> = pings.iter().map(ping_item).collect();
                let ping_list = List::new(ping_items).block(Block::default().title("Ping").borders(Borders::ALL));
                f.render_widget(ping_list, mid[1]);

                let viewport = rows[2].height.saturating_sub(2) as usize;
                let start = logs.len().saturating_sub(viewport);
                let log_items: Vec<ListItem> = logs.iter().skip(start).map(|l| ListItem::new(l.clone())).collect();
                let log_list = List::new(log_items).block(Block::default().title("Events").borders(Borders::ALL));
                f.render_widget(log_list, rows[2]);
            } else {
                let title = format!("Speed tests ({})", history.len());
                let table = history_table(&history).block(Block::default().title(title).borders(Borders::ALL));
                f.render_widget(table, outer[1]);
            }

            let status = if testing { "speed test running | " } else { "" };
            let footer = Paragraph::new(Line::from(format!(
                "{status}Tab: switch view | s: run speed test | q: quit"
            )));
            f.render_widget(footer, outer[2]);
        })?;

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if key.code == KeyCode::Char('q')
                    || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
                {
                    stop.store(true, Ordering::Relaxed);
                } else if key.code == KeyCode::Tab {
                    active_tab = (active_tab + 1) % 2;
                } else if key.code == KeyCode::Char('s') {
                    if let Err(r) = request_speed_test(&state, &triggers) {
                        logs.push(refusal_message(r).to_string());
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_points_are_indexed_in_window_order() {
        let window = vec![
            ThroughputSample { time: "a".into(), rx_mbps: 1.0, tx_mbps: 0.5 },
            ThroughputSample { time: "b".into(), rx_mbps: 3.0, tx_mbps: 0.25 },
        ];
        assert_eq!(chart_points(&window, Channel::Rx), vec![(0.0, 1.0), (1.0, 3.0)]);
        assert_eq!(chart_points(&window, Channel::Tx), vec![(0.0, 0.5), (1.0, 0.25)]);
    }

    #[test]
    fn early_error_still_restores_terminal() {
        let mut out = Vec::new();
        let result: Result<()> = (|| {
            let _restore = TerminalRestore { out: &mut out };
            Err(anyhow::anyhow!("draw failed"))
        })();
        assert!(result.is_err());
        let written = String::from_utf8_lossy(&out);
        assert!(written.contains("\x1b[?1049l"), "alternate screen not left: {written:?}");
        assert!(written.contains("\x1b[?25h"), "cursor not shown: {written:?}");
    }
}
