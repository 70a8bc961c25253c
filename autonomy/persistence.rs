use std::{
    fs,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use crate::state::{CycleReport, EngineError, StateSnapshot};

/// Number of cycle reports kept inside the persisted snapshot.
pub const PERSISTED_HISTORY_LIMIT: usize = 10;

/// Durable storage rooted at `<root>/.eaos/autonomy/`.
///
/// Writes are serialized by an internal lock and applied atomically (temp
/// file plus rename), so concurrent savers cannot interleave partial
/// documents. Read failures degrade to fresh state rather than failing
/// engine initialization.
#[derive(Debug)]
pub struct StateStore {
    autonomy_dir: PathBuf,
    logs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Creates a store for the given root directory.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let autonomy_dir = root.as_ref().join(".eaos").join("autonomy");
        let logs_dir = autonomy_dir.join("logs");
        Self {
            autonomy_dir,
            logs_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Idempotently creates the autonomy directory and its logs directory.
    pub fn ensure_dirs(&self) -> Result<(), EngineError> {
        fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    /// Path of the canonical state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.autonomy_dir.join("state.json")
    }

    /// Path of the append-only change journal.
    #[must_use]
    pub fn changes_path(&self) -> PathBuf {
        self.logs_dir.join("changes.jsonl")
    }

    /// Path of the engine diagnostics log.
    #[must_use]
    pub fn engine_log_path(&self) -> PathBuf {
        self.logs_dir.join("engine.log.jsonl")
    }

    /// Reads the persisted snapshot, or returns fresh state when the file
    /// is missing or malformed. Never fails engine initialization.
    #[must_use]
    pub fn load_state(&self) -> StateSnapshot {
        let path = self.state_path();
        match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "state file malformed; starting fresh"
                    );
                    StateSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateSnapshot::default(),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "state file unreadable; starting fresh"
                );
                StateSnapshot::default()
            }
        }
    }

    /// Atomically writes the full snapshot.
    ///
    /// The persisted projection carries at most
    /// [`PERSISTED_HISTORY_LIMIT`] cycle reports; older entries are
    /// dropped from the document, not from the in-memory history.
    pub fn save_state(&self, snapshot: &StateSnapshot) -> Result<(), EngineError> {
        let mut snapshot = snapshot.clone();
        if snapshot.cycle_history.len() > PERSISTED_HISTORY_LIMIT {
            let skip = snapshot.cycle_history.len() - PERSISTED_HISTORY_LIMIT;
            snapshot.cycle_history.drain(..skip);
        }
        let encoded = serde_json::to_vec_pretty(&snapshot)?;

        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.autonomy_dir)?;
        let tmp = self.autonomy_dir.join("state.json.tmp");
        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, self.state_path())?;
        Ok(())
    }

    /// Writes one per-cycle report file and refreshes the last-report copy.
    pub fn write_cycle_report(&self, report: &CycleReport) -> Result<PathBuf, EngineError> {
        let encoded = serde_json::to_vec_pretty(report)?;
        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.logs_dir)?;
        let path = self
            .logs_dir
            .join(format!("cycle_{}_{}.json", report.kind.as_str(), report.id));
        fs::write(&path, &encoded)?;
        fs::write(self.autonomy_dir.join("last_cycle_report.json"), &encoded)?;
        Ok(path)
    }

    /// Reads the most recent report copy, when present and parseable.
    #[must_use]
    pub fn read_last_report(&self) -> Option<CycleReport> {
        let raw = fs::read(self.autonomy_dir.join("last_cycle_report.json")).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CycleKind, RuntimeState};
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn missing_state_yields_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let snapshot = store.load_state();
        assert_eq!(snapshot.state, RuntimeState::Stopped);
        assert!(snapshot.cycle_history.is_empty());
    }

    #[test]
    fn malformed_state_yields_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_dirs().unwrap();
        fs::write(store.state_path(), "{ definitely not json").unwrap();
        let snapshot = store.load_state();
        assert_eq!(snapshot.state, RuntimeState::Stopped);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let mut snapshot = StateSnapshot::default();
        snapshot.state = RuntimeState::Running;
        snapshot.last_cycle_run.set(CycleKind::Daily, Utc::now());
        store.save_state(&snapshot).unwrap();

        let loaded = store.load_state();
        assert_eq!(loaded.state, RuntimeState::Running);
        assert_eq!(loaded.last_cycle_run, snapshot.last_cycle_run);
        assert_eq!(loaded.hdm_level, snapshot.hdm_level);
    }

    #[test]
    fn persisted_history_is_capped() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let mut snapshot = StateSnapshot::default();
        for idx in 0..25 {
            let mut report = CycleReport::begin(format!("r{idx}"), CycleKind::Daily, Utc::now());
            report.finish(Utc::now());
            snapshot.cycle_history.push(report);
        }
        store.save_state(&snapshot).unwrap();

        let loaded = store.load_state();
        assert_eq!(loaded.cycle_history.len(), PERSISTED_HISTORY_LIMIT);
        assert_eq!(loaded.cycle_history[0].id, "r15");
        assert_eq!(loaded.cycle_history[9].id, "r24");
    }

    #[test]
    fn cycle_report_files_land_in_logs() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let mut report = CycleReport::begin("20260801-abc123", CycleKind::Weekly, Utc::now());
        report.finish(Utc::now());
        let path = store.write_cycle_report(&report).unwrap();
        assert!(path.ends_with("logs/cycle_weekly_20260801-abc123.json"));
        assert!(path.exists());

        let last = store.read_last_report().unwrap();
        assert_eq!(last.id, report.id);
    }
}
