//! JSONL session traces: one event per line, enough to replay what the
//! model said and how its tool calls went.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SessionStart {
        timestamp: DateTime<Utc>,
        session: String,
        model: String,
    },
    UserMessage {
        timestamp: DateTime<Utc>,
        content: String,
    },
    ModelResponse {
        timestamp: DateTime<Utc>,
        iteration: usize,
        content: String,
        tool_calls: usize,
    },
    ToolCall {
        timestamp: DateTime<Utc>,
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        timestamp: DateTime<Utc>,
        call_id: String,
        name: String,
        success: bool,
        output: String,
    },
    Diagnostic {
        timestamp: DateTime<Utc>,
        message: String,
    },
    SessionEnd {
        timestamp: DateTime<Utc>,
        iterations: usize,
        status: String,
    },
}

impl TraceEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TraceEvent::SessionStart { timestamp, .. }
            | TraceEvent::UserMessage { timestamp, .. }
            | TraceEvent::ModelResponse { timestamp, .. }
            | TraceEvent::ToolCall { timestamp, .. }
            | TraceEvent::ToolResult { timestamp, .. }
            | TraceEvent::Diagnostic { timestamp, .. }
            | TraceEvent::SessionEnd { timestamp, .. } => *timestamp,
        }
    }
}

/// Append-only JSONL trace file.
pub struct TraceWriter {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating trace dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening trace file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event. Trace failures are logged, never propagated into the loop.
    pub fn record(&self, event: &TraceEvent) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let result = serde_json::to_string(event)
            .map_err(anyhow::Error::from)
            .and_then(|line| {
                writeln!(out, "{line}")?;
                out.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to write trace event to {}: {e}", self.path.display());
        }
    }
}

/// Read every event of a trace file. Lines that do not parse are skipped.
pub fn read_trace(path: &Path) -> Result<Vec<TraceEvent>> {
    let file = File::open(path).with_context(|| format!("opening trace {}", path.display()))?;
    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading trace {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping malformed trace line {}: {e}", n + 1),
        }
    }
    Ok(events)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub sessions: usize,
    pub user_messages: usize,
    pub model_turns: usize,
    /// Non-empty assistant responses, in order.
    pub responses: Vec<String>,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub diagnostics: usize,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let mut summary = Self::default();
        for event in events {
            match event {
                TraceEvent::SessionStart { .. } => summary.sessions += 1,
                TraceEvent::UserMessage { .. } => summary.user_messages += 1,
                TraceEvent::ModelResponse { content, .. } => {
                    summary.model_turns += 1;
                    if !content.trim().is_empty() {
                        summary.responses.push(content.clone());
                    }
                }
                TraceEvent::ToolCall { .. } => summary.tool_calls += 1,
                TraceEvent::ToolResult { success, .. } => {
                    if !success {
                        summary.tool_errors += 1;
                    }
                }
                TraceEvent::Diagnostic { .. } => summary.diagnostics += 1,
                TraceEvent::SessionEnd { .. } => {}
            }
        }
        summary
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::from_events(&read_trace(path)?))
    }
}
