use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{ChangeEntry, ChangeJournal, JsonLogger, LogLevel, LogRecord};

/// Builder for the engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    journal_path: Option<PathBuf>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            journal_path: None,
        }
    }

    /// Sets the diagnostics log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the change journal path.
    #[must_use]
    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?),
            None => None,
        };
        let journal = match self.journal_path {
            Some(path) => Some(ChangeJournal::new(path)?),
            None => None,
        };
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                component: self.component,
                logger,
                journal,
            }),
        })
    }
}

/// Shared handle over the engine's diagnostics log and change journal.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    component: String,
    logger: Option<JsonLogger>,
    journal: Option<ChangeJournal>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("component", &self.inner.component)
            .finish()
    }
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(component)
    }

    /// Writes a structured diagnostics line.
    pub fn log(&self, level: LogLevel, message: &str, details: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            logger.log(&LogRecord::new(&self.inner.component, level, message).with_details(details))?;
        }
        Ok(())
    }

    /// Appends a change journal entry.
    pub fn change(&self, action: &str, subject: &str, detail: Value) -> Result<()> {
        if let Some(journal) = &self.inner.journal {
            journal.record(
                &ChangeEntry::new(&self.inner.component, action, subject).with_detail(detail),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_both_sinks() {
        let dir = tempdir().unwrap();
        let telemetry = EngineTelemetry::builder("engine")
            .log_path(dir.path().join("engine.log.jsonl"))
            .journal_path(dir.path().join("changes.jsonl"))
            .build()
            .unwrap();

        telemetry
            .log(LogLevel::Info, "autonomy.cycle.completed", json!({ "kind": "daily" }))
            .unwrap();
        telemetry
            .change("state-transition", "running", json!({ "from": "stopped" }))
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("engine.log.jsonl")).unwrap();
        assert!(log.contains("autonomy.cycle.completed"));
        let journal = std::fs::read_to_string(dir.path().join("changes.jsonl")).unwrap();
        assert!(journal.contains("state-transition"));
    }

    #[test]
    fn sinkless_telemetry_is_a_no_op() {
        let telemetry = EngineTelemetry::builder("engine").build().unwrap();
        telemetry
            .log(LogLevel::Debug, "noop", json!({}))
            .unwrap();
        telemetry.change("noop", "noop", json!({})).unwrap();
    }
}
