#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON diagnostics and the append-only change journal shared
//! across the operations engine.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// One diagnostic line emitted by an engine component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record (e.g. `engine`, `plugin-manager`).
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary JSON payload for structured fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attaches structured details taken from a JSON object.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let Some(map) = details.as_object() {
            self.details = map.clone();
        }
        self
    }
}

/// Thread-safe JSON-lines logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as a JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path (useful for tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One durable entry in the operational change journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component that performed the change.
    pub actor: String,
    /// Verb describing the change (e.g. `state-transition`, `trigger-registered`).
    pub action: String,
    /// Entity the change applies to.
    pub subject: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl ChangeEntry {
    /// Creates an entry stamped now.
    #[must_use]
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            subject: subject.into(),
            detail: serde_json::Value::Null,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Append-only journal of operational changes.
///
/// Entries are never rewritten; the journal is the durable audit trail for
/// engine state transitions, trigger registration, and plugin lifecycle.
#[derive(Debug)]
pub struct ChangeJournal {
    logger: JsonLogger,
}

impl ChangeJournal {
    /// Creates or opens a journal at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            logger: JsonLogger::new(path)?,
        })
    }

    /// Appends a change entry.
    pub fn record(&self, entry: &ChangeEntry) -> Result<()> {
        let mut writer = self.logger.writer.lock();
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Reads every entry back, oldest first. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<ChangeEntry>> {
        let file = File::open(self.logger.path())?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Ok(entry) = serde_json::from_str::<ChangeEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.logger.path()
    }
}
