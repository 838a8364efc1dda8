use crate::config::TraceConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEFAULT_TRACE_REL_PATH: &str = "state/dispatch-trace.jsonl";

/// Dispatch trace storage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStorageMode {
    None,
    Rolling,
    Full,
}

impl TraceStorageMode {
    /// Unrecognized values yield `Option::None`; empty means disabled.
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "rolling" => Some(Self::Rolling),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// One persisted dispatch or call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTraceEvent {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Owns the trace file for the lifetime of the background writer.
///
/// The parent directory is created and the file opened once; rolling mode
/// tracks the line count in memory and only rewrites the file when it grows
/// past `max_entries`.
struct TraceWriter {
    mode: TraceStorageMode,
    max_entries: usize,
    path: PathBuf,
    file: File,
    lines: usize,
}

impl TraceWriter {
    fn open(mode: TraceStorageMode, max_entries: usize, path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let lines = match mode {
            TraceStorageMode::Rolling => count_lines(&path)?,
            _ => 0,
        };
        let file = open_append(&path)?;
        Ok(Self {
            mode,
            max_entries: max_entries.max(1),
            path,
            file,
            lines,
        })
    }

    /// Append a batch, sync once, then compact if rolling.
    fn write_batch(&mut self, events: &[DispatchTraceEvent]) -> Result<()> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes())?;
        self.file.sync_data()?;
        self.lines += events.len();

        if self.mode == TraceStorageMode::Rolling && self.lines > self.max_entries {
            self.compact()?;
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)?;
        let kept: Vec<&str> = raw.lines().filter(|line| !line.trim().is_empty()).collect();
        let tail = &kept[kept.len().saturating_sub(self.max_entries)..];

        let tmp = self.path.with_extension(format!("compact.{}", std::process::id()));
        {
            let mut out = open_truncate(&tmp)?;
            for line in tail {
                writeln!(out, "{line}")?;
            }
            out.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.file = open_append(&self.path)?;
        self.lines = tail.len();
        Ok(())
    }
}

fn count_lines(path: &Path) -> Result<usize> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.lines().filter(|line| !line.trim().is_empty()).count()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn open_append(path: &Path) -> Result<File> {
    private_options()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn open_truncate(path: &Path) -> Result<File> {
    Ok(private_options().write(true).truncate(true).open(path)?)
}

/// Resolve trace storage mode from config.
pub fn storage_mode_from_config(config: &TraceConfig) -> TraceStorageMode {
    TraceStorageMode::parse(&config.mode).unwrap_or_else(|| {
        tracing::warn!(mode = %config.mode, "Unknown trace.mode; falling back to none");
        TraceStorageMode::None
    })
}

/// Resolve trace path from config. Relative paths are joined to `base_dir`.
pub fn resolve_trace_path(config: &TraceConfig, base_dir: &Path) -> PathBuf {
    let raw = config.path.trim();
    if raw.is_empty() {
        return base_dir.join(DEFAULT_TRACE_REL_PATH);
    }

    let configured = PathBuf::from(raw);
    if configured.is_absolute() {
        configured
    } else {
        base_dir.join(configured)
    }
}

/// Non-blocking handle to a background trace writer.
///
/// Recording only queues the event; file I/O happens on a blocking task so the
/// dispatch path never waits on disk. Dropping every handle lets the writer
/// flush what is queued and exit.
#[derive(Debug, Clone)]
pub struct DispatchTrace {
    tx: mpsc::UnboundedSender<DispatchTraceEvent>,
    path: PathBuf,
}

impl DispatchTrace {
    /// Start a writer for `config`. `None` when tracing is disabled.
    /// Must be called within a Tokio runtime.
    pub fn start(config: &TraceConfig, base_dir: &Path) -> Option<(Self, JoinHandle<()>)> {
        let mode = storage_mode_from_config(config);
        if mode == TraceStorageMode::None {
            return None;
        }

        let path = resolve_trace_path(config, base_dir);
        let mut writer = match TraceWriter::open(mode, config.max_entries, path.clone()) {
            Ok(writer) => writer,
            Err(err) => {
                tracing::warn!("Dispatch trace disabled: {err:#}");
                return None;
            }
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchTraceEvent>();
        let handle = tokio::task::spawn_blocking(move || {
            let mut batch = Vec::new();
            while let Some(event) = rx.blocking_recv() {
                batch.push(event);
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
                if let Err(err) = writer.write_batch(&batch) {
                    tracing::warn!(
                        dropped = batch.len(),
                        "Failed to write dispatch trace events: {err:#}"
                    );
                }
                batch.clear();
            }
        });

        Some((Self { tx, path }, handle))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one trace record.
    pub fn record(
        &self,
        event_type: &str,
        operation: Option<&str>,
        success: Option<bool>,
        message: Option<&str>,
        payload: Value,
    ) {
        let event = DispatchTraceEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            operation: operation.map(str::to_string),
            success,
            message: message.map(str::to_string),
            payload,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("dispatch trace writer stopped; dropping event");
        }
    }
}

/// Load recent trace events, newest first. Malformed lines are skipped.
pub fn load_events(
    path: &Path,
    limit: usize,
    event_filter: Option<&str>,
) -> Result<Vec<DispatchTraceEvent>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let filter = event_filter.map(str::trim).filter(|f| !f.is_empty());

    Ok(raw
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<DispatchTraceEvent>(line) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!("Skipping malformed dispatch trace line: {err}");
                None
            }
        })
        .filter(|event| filter.map_or(true, |f| event.event_type.eq_ignore_ascii_case(f)))
        .take(limit)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_config(mode: &str) -> TraceConfig {
        TraceConfig {
            mode: mode.to_string(),
            path: "state/dispatch-trace.jsonl".to_string(),
            max_entries: 3,
        }
    }

    fn event(i: usize) -> DispatchTraceEvent {
        DispatchTraceEvent {
            id: format!("id-{i}"),
            timestamp: Utc::now().to_rfc3339(),
            event_type: if i % 2 == 0 { "call_matched" } else { "call_timeout" }.into(),
            operation: Some("op".into()),
            success: None,
            message: Some(format!("event-{i}")),
            payload: serde_json::json!({ "i": i }),
        }
    }

    #[test]
    fn resolve_trace_path_relative_joins_base_dir() {
        let cfg = trace_config("rolling");
        let base = tempfile::tempdir().unwrap();
        let path = resolve_trace_path(&cfg, base.path());
        assert_eq!(path, base.path().join("state/dispatch-trace.jsonl"));
    }

    #[test]
    fn storage_mode_parses_known_values() {
        assert_eq!(
            storage_mode_from_config(&trace_config("none")),
            TraceStorageMode::None
        );
        assert_eq!(
            storage_mode_from_config(&trace_config("Rolling")),
            TraceStorageMode::Rolling
        );
        assert_eq!(
            storage_mode_from_config(&trace_config("full")),
            TraceStorageMode::Full
        );
        assert_eq!(
            storage_mode_from_config(&trace_config("verbose")),
            TraceStorageMode::None
        );
    }

    #[test]
    fn rolling_mode_keeps_latest_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let mut writer = TraceWriter::open(TraceStorageMode::Rolling, 2, path.clone()).unwrap();

        for i in 0..5 {
            writer.write_batch(&[event(i)]).unwrap();
        }
        assert_eq!(writer.lines, 2);

        let events = load_events(&path, 10, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message.as_deref(), Some("event-4"));
        assert_eq!(events[1].message.as_deref(), Some("event-3"));
    }

    #[test]
    fn load_events_filters_by_type_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let mut writer = TraceWriter::open(TraceStorageMode::Full, 100, path.clone()).unwrap();
        let batch: Vec<_> = (0..6).map(event).collect();
        writer.write_batch(&batch).unwrap();

        let timeouts = load_events(&path, 2, Some("CALL_TIMEOUT")).unwrap();
        assert_eq!(timeouts.len(), 2);
        assert_eq!(timeouts[0].id, "id-5");
        assert_eq!(timeouts[1].id, "id-3");
    }

    #[test]
    fn rolling_writer_counts_existing_lines_on_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/state/trace.jsonl");
        {
            let mut writer =
                TraceWriter::open(TraceStorageMode::Rolling, 3, path.clone()).unwrap();
            writer.write_batch(&[event(0), event(1)]).unwrap();
        }

        let mut writer = TraceWriter::open(TraceStorageMode::Rolling, 3, path.clone()).unwrap();
        assert_eq!(writer.lines, 2);
        writer.write_batch(&[event(2), event(3)]).unwrap();

        let ids: Vec<String> = load_events(&path, 10, None)
            .unwrap()
            .into_iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(ids, vec!["id-3", "id-2", "id-1"]);
    }

    #[cfg(unix)]
    #[test]
    fn trace_file_is_private_after_compaction() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let mut writer = TraceWriter::open(TraceStorageMode::Rolling, 1, path.clone()).unwrap();
        writer.write_batch(&[event(0), event(1)]).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_events_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let good = serde_json::to_string(&event(0)).unwrap();
        fs::write(&path, format!("{good}\nnot json\n\n")).unwrap();

        let events = load_events(&path, 10, None).unwrap();
        assert_eq!(events.len(), 1);
        assert!(load_events(&tmp.path().join("absent.jsonl"), 10, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn disabled_mode_does_not_start_a_writer() {
        let base = tempfile::tempdir().unwrap();
        assert!(DispatchTrace::start(&trace_config("none"), base.path()).is_none());
    }

    #[tokio::test]
    async fn background_writer_flushes_when_handles_drop() {
        let base = tempfile::tempdir().unwrap();
        let (trace, writer) =
            DispatchTrace::start(&trace_config("full"), base.path()).expect("enabled");
        let path = trace.path().to_path_buf();

        trace.record("call_matched", Some("login"), Some(true), None, Value::Null);
        trace.record("broadcast_unsolicited", None, Some(true), Some("ack"), Value::Null);
        drop(trace);
        writer.await.unwrap();

        let events = load_events(&path, 10, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "broadcast_unsolicited");
        assert_eq!(events[1].operation.as_deref(), Some("login"));
    }
}
