//! Load progress reporting.
//!
//! Reports observable progress while `lires load` (or any command that needs
//! the library) pulls the record stream. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

use lires_client_core::stream::LoadProgress;

/// Records between two intermediate progress lines.
const REPORT_EVERY: u64 = 500;

/// A single progress event for a library load.
#[derive(Clone, Debug)]
pub enum LoadProgressEvent {
    /// Response headers arrived; `total` is the declared record count.
    Started { total: Option<u64> },
    /// A record was ingested.
    Loading(LoadProgress),
    /// The stream ended and the index is initialized.
    Finished(LoadProgress),
}

/// Reports load progress. Implementations write to stderr (human or JSON).
pub trait LoadProgressReporter: Send + Sync {
    fn report(&self, event: LoadProgressEvent);
}

fn is_milestone(progress: &LoadProgress) -> bool {
    progress.current == 1 || progress.current % REPORT_EVERY == 0
}

/// Human-friendly progress on stderr: "load  1,234 / 5,000 records  (24%)".
pub struct StderrProgress;

impl LoadProgressReporter for StderrProgress {
    fn report(&self, event: LoadProgressEvent) {
        let line = match &event {
            LoadProgressEvent::Started { total: Some(total) } => {
                format!("load  expecting {} records\n", format_number(*total))
            }
            LoadProgressEvent::Started { total: None } => "load  streaming...\n".to_string(),
            LoadProgressEvent::Loading(p) if !is_milestone(p) => return,
            LoadProgressEvent::Loading(p) => format!("load  {}\n", describe(p)),
            LoadProgressEvent::Finished(p) => format!("load  done, {} records\n", format_number(p.current)),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn describe(p: &LoadProgress) -> String {
    match p.total {
        Some(total) => format!(
            "{} / {} records  ({:.0}%)",
            format_number(p.current),
            format_number(total),
            p.fraction() * 100.0
        ),
        None => format!("{} records", format_number(p.current)),
    }
}

/// Machine-readable progress: one JSON object per line on stderr. The
/// declared total is `-1` when unknown.
pub struct JsonProgress;

impl LoadProgressReporter for JsonProgress {
    fn report(&self, event: LoadProgressEvent) {
        let obj = match &event {
            LoadProgressEvent::Started { total } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "total": total.map_or(-1, |t| t as i64),
            }),
            LoadProgressEvent::Loading(p) if !is_milestone(p) => return,
            LoadProgressEvent::Loading(p) | LoadProgressEvent::Finished(p) => serde_json::json!({
                "event": "progress",
                "phase": if p.finished { "finished" } else { "loading" },
                "n": p.current,
                "total": p.total.map_or(-1, |t| t as i64),
                "fraction": p.fraction(),
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl LoadProgressReporter for NoProgress {
    fn report(&self, _event: LoadProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn LoadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
