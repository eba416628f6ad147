use chrono::{Local, TimeZone};
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Cell, Row, Table};

use crate::classify::{classify, Band, MetricKind};
use crate::history::SpeedTestRecord;

pub const HEADERS: [&str; 6] = ["Download", "Upload", "Latency", "Jitter", "Loss", "When"];

pub fn band_style(band: Band) -> Style {
    match band {
        Band::Good => Style::default().fg(Color::LightGreen),
        Band::Okay => Style::default().fg(Color::LightYellow),
        Band::Bad => Style::default().fg(Color::LightRed),
        Band::None => Style::default(),
    }
}

// Zero means "not measured" in a record; show a dash like a missing value.
fn measured(v: f64) -> Option<f64> {
    (v != 0.0 && v.is_finite()).then_some(v)
}

pub fn fmt_mbps(v: f64) -> String {
    measured(v).map_or_else(|| "-".into(), |v| format!("{v:.2} Mb/s"))
}

pub fn fmt_ms(v: f64) -> String {
    measured(v).map_or_else(|| "-".into(), |v| format!("{v:.2} ms"))
}

pub fn fmt_timestamp(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".into(),
    }
}

/// One record as display cells, each paired with its rating.
pub fn record_cells(r: &SpeedTestRecord) -> [(String, Band); 6] {
    let rate = |kind, v: f64| classify(kind, measured(v));
    [
        (fmt_mbps(r.download_mbps), rate(MetricKind::DownloadSpeed, r.download_mbps)),
        (fmt_mbps(r.upload_mbps), rate(MetricKind::UploadSpeed, r.upload_mbps)),
        (fmt_ms(r.latency_ms), rate(MetricKind::Latency, r.latency_ms)),
        (fmt_ms(r.jitter_ms), rate(MetricKind::Jitter, r.jitter_ms)),
        (format!("{:.2}%", r.packet_loss_percent), Band::None),
        (fmt_timestamp(r.timestamp), Band::None),
    ]
}

pub fn history_table(records: &[SpeedTestRecord]) -> Table<'static> {
    let header = Row::new(HEADERS.map(Cell::from)).style(Style::default().add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = records
        .iter()
        .map(|r| Row::new(record_cells(r).map(|(text, band)| Cell::from(text).style(band_style(band)))))
        .collect();
    let widths = [
        Constraint::Length(14),
        Constraint::Length(14),
        Constraint::Length(11),
        Constraint::Length(11),
        Constraint::Length(8),
        Constraint::Min(16),
    ];
    Table::new(rows, widths).header(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmeasured_values_render_as_dash() {
        assert_eq!(fmt_mbps(0.0), "-");
        assert_eq!(fmt_ms(0.0), "-");
        assert_eq!(fmt_mbps(512.345), "512.35 Mb/s");
        assert_eq!(fmt_ms(9.5), "9.50 ms");
    }

    #[test]
    fn cells_carry_bands() {
        let r = SpeedTestRecord {
            download_mbps: 650.0,
            upload_mbps: 6.0,
            latency_ms: 120.0,
            jitter_ms: 0.0,
            packet_loss_percent: 0.0,
            timestamp: 0,
        };
        let cells = record_cells(&r);
        assert_eq!(cells[0].1, Band::Good);
        assert_eq!(cells[1].1, Band::Okay);
        assert_eq!(cells[2].1, Band::Bad);
        assert_eq!(cells[3], ("-".to_string(), Band::None));
        assert_eq!(cells[4].0, "0.00%");
    }

    #[test]
    fn timestamp_formats_as_local_minutes() {
        let s = fmt_timestamp(1_700_000_000_000);
        assert_eq!(s.len(), "2023-11-14 22:13".len());
        assert!(s.starts_with("2023-11-1"));
    }
}
