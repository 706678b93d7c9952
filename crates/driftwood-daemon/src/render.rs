//! Status display rows.

use chrono::{DateTime, Utc};
use driftwood_ipc::StatusUpdate;
use tracing::{debug, info};

/// Whether the stats loop keeps running after a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderControl {
    /// Keep polling.
    Continue,
    /// Stop the daemon.
    Stop,
}

/// Consumer of periodic status rows.
pub trait StatusRenderer: Send {
    /// Render one round of rows. Rows only carry errors that are still recent.
    fn render(&mut self, rows: &[StatusUpdate], now: DateTime<Utc>) -> RenderControl;
}

/// Writes one debug log line per download.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl StatusRenderer for LogRenderer {
    fn render(&mut self, rows: &[StatusUpdate], _now: DateTime<Utc>) -> RenderControl {
        for row in rows {
            let status = &row.status;
            debug!(
                content_id = %row.content_id.short(),
                name = %row.name,
                state = status.state.as_str(),
                progress = %format_percent(status.fraction_done),
                peers = status.peers,
                seeds = status.seeds,
                down = %format_rate(status.download_bps),
                up = %format_rate(status.upload_bps),
                eta = %format_eta(status.eta_seconds),
                error = status.last_error.as_ref().map_or("", |err| err.message.as_str()),
                "download status"
            );
        }
        RenderControl::Continue
    }
}

/// Logs like [`LogRenderer`] and stops once every download is complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct UntilDoneRenderer {
    inner: LogRenderer,
}

impl StatusRenderer for UntilDoneRenderer {
    fn render(&mut self, rows: &[StatusUpdate], now: DateTime<Utc>) -> RenderControl {
        self.inner.render(rows, now);
        if !rows.is_empty() && rows.iter().all(|row| row.status.is_complete()) {
            info!(downloads = rows.len(), "all downloads complete");
            return RenderControl::Stop;
        }
        RenderControl::Continue
    }
}

fn format_percent(fraction: f64) -> String {
    format!("{:.1}%", (fraction * 100.0).clamp(0.0, 100.0))
}

fn format_rate(bytes_per_second: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "kB/s", "MB/s", "GB/s"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes_per_second as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_second} B/s")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_eta(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(seconds) if seconds < 60 => format!("{seconds}s"),
        Some(seconds) if seconds < 3600 => format!("{}m{:02}s", seconds / 60, seconds % 60),
        Some(seconds) => format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60),
    }
}
