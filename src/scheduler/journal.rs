use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobState;

/// Keeps the run journal of one scheduler run on disk, rewritten on every change.
pub struct Journal {
    run_dir: PathBuf,
    log: RunLog,
}

impl Journal {
    pub fn create(base_dir: &Path, started_at: DateTime<Utc>) -> io::Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join("runs").join(&run_id);
        fs::create_dir_all(&run_dir)?;
        let journal = Self {
            run_dir,
            log: RunLog::new(run_id, started_at),
        };
        journal.log.save(&journal.path())?;
        Ok(journal)
    }

    pub fn record(&mut self, outcome: JobOutcome) -> io::Result<()> {
        self.log.jobs.push(outcome);
        self.log.save(&self.path())
    }

    pub fn finish(&mut self, state: RunState, at: DateTime<Utc>) -> io::Result<()> {
        self.log.state = state;
        self.log.completed_at = Some(at);
        self.log.save(&self.path())
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn path(&self) -> PathBuf {
        self.run_dir.join("journal.yaml")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobOutcome>,
}

impl RunLog {
    pub fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: RunState::Running,
            started_at,
            completed_at: None,
            jobs: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| io::Error::other(format!("bad journal: {e}")))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(
            path,
            serde_yaml::to_string(self)
                .map_err(|e| io::Error::other(format!("Failed to serialize journal: {}", e)))?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn journal_is_rewritten_on_each_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 12, 20, 0, 0).unwrap();
        let mut journal = Journal::create(dir.path(), start).unwrap();
        assert!(journal.path().starts_with(dir.path().join("runs")));
        assert_eq!(RunLog::load(&journal.path()).unwrap().state, RunState::Running);

        journal
            .record(JobOutcome {
                job: "M42".into(),
                state: JobState::Complete,
                started_at: start,
                completed_at: start + chrono::Duration::minutes(40),
                attempts: 1,
                error: None,
            })
            .unwrap();
        journal
            .finish(RunState::Completed, start + chrono::Duration::hours(1))
            .unwrap();

        let saved = RunLog::load(&journal.path()).unwrap();
        assert_eq!(&saved, journal.log());
        assert_eq!(saved.jobs[0].state, JobState::Complete);
        assert_eq!(saved.state, RunState::Completed);
    }
}
