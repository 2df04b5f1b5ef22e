//! Session progress tracking: counters, ETA estimation, checkpoints, and a
//! crash-safe progress file.
//!
//! The tracker is advisory. The authoritative "already downloaded" signal is
//! the on-disk existence check in [`crate::naming`], so a lost or corrupted
//! progress file costs statistics, never re-downloads.
//!
//! Every save is write-temp-then-rename: a `SIGKILL` at any instant leaves
//! either the previous complete file or the new complete file, never a
//! truncated one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;

/// Current progress file schema version. Files reporting a higher version
/// were written by a newer build and abort the run.
pub const SCHEMA_VERSION: u32 = 2;

/// Checkpoint cadence: one checkpoint per this many completed topics.
const CHECKPOINT_EVERY_SKILLS: u64 = 10;

/// Number of rolling checkpoints retained.
const MAX_CHECKPOINTS: usize = 10;

/// Speed below this (items per second) reports ETA as unknown.
const MIN_SPEED: f64 = 1e-9;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Initialized
    }
}

/// What the pipeline is working on right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentActivity {
    /// Topic currently being processed.
    pub current_skill: Option<String>,
    /// `done/total` within the current topic.
    pub current_skill_progress: String,
    /// Title of the book currently being processed.
    pub current_item: Option<String>,
    /// Id of the book currently being processed.
    pub current_item_id: Option<String>,
}

/// A point-in-time snapshot appended at checkpoint boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
    /// Completed books at that time.
    pub completed_books: u64,
    /// Completed topics at that time.
    pub completed_skills: u64,
    /// Failed books at that time.
    pub failed_books: u64,
}

/// One failed item: error kind plus the first error message observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Short stable error kind (`auth`, `transport`, `parse`, ...).
    pub kind: String,
    /// First error message for this item.
    pub message: String,
}

/// The persisted progress state.
///
/// Unknown fields from other (older or newer-but-compatible) versions are
/// captured in `extra` and written back untouched; missing fields default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressState {
    /// Schema version of the writing build. Missing means a v1 file.
    #[serde(default = "schema_version_v1")]
    pub schema_version: u32,
    /// Fresh UUID per run.
    pub session_id: Uuid,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When this session started.
    pub start_time: DateTime<Utc>,
    /// When the file was last written.
    pub last_update: DateTime<Utc>,
    /// Total topics in this job.
    pub total_skills: u64,
    /// Topics finished.
    pub completed_skills: u64,
    /// Total books in this job.
    pub total_books: u64,
    /// Books downloaded and packaged.
    pub completed_books: u64,
    /// Books skipped by the existence check.
    pub skipped_books: u64,
    /// Ids of completed books.
    pub completed_items: Vec<String>,
    /// Failed books by id.
    pub failed_items: BTreeMap<String, FailedItem>,
    /// Names of completed topics.
    pub skills_completed: Vec<String>,
    /// Live activity snapshot.
    pub current_activity: CurrentActivity,
    /// Rolling checkpoints, newest last.
    pub checkpoints: Vec<Checkpoint>,
    /// Fields this build does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn schema_version_v1() -> u32 {
    1
}

impl Default for ProgressState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: Uuid::new_v4(),
            status: SessionStatus::Initialized,
            start_time: now,
            last_update: now,
            total_skills: 0,
            completed_skills: 0,
            total_books: 0,
            completed_books: 0,
            skipped_books: 0,
            completed_items: Vec::new(),
            failed_items: BTreeMap::new(),
            skills_completed: Vec::new(),
            current_activity: CurrentActivity::default(),
            checkpoints: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// In-memory tracker bound to its progress file.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    state: ProgressState,
}

impl ProgressTracker {
    /// Loads the progress file if present (and `resume` allows), otherwise
    /// starts fresh. Older schemas are upgraded in place; a newer schema
    /// aborts with [`JobError::ResumeConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::ResumeConflict`] for files from a newer build.
    /// An unreadable or unparseable file is logged and replaced by a fresh
    /// state rather than failing the run.
    pub fn load_or_new(path: &Path, resume: bool) -> Result<Self, JobError> {
        if resume && path.exists() {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<ProgressState>(&raw) {
                    Ok(mut state) => {
                        if state.schema_version > SCHEMA_VERSION {
                            return Err(JobError::ResumeConflict {
                                path: path.to_path_buf(),
                                found: state.schema_version,
                                supported: SCHEMA_VERSION,
                            });
                        }
                        if state.schema_version < SCHEMA_VERSION {
                            debug!(
                                from = state.schema_version,
                                to = SCHEMA_VERSION,
                                "upgrading progress file schema"
                            );
                            state.schema_version = SCHEMA_VERSION;
                        }
                        info!(
                            completed_books = state.completed_books,
                            failed = state.failed_items.len(),
                            "resumed progress state"
                        );
                        // A resumed run is a new session.
                        state.session_id = Uuid::new_v4();
                        return Ok(Self {
                            path: path.to_path_buf(),
                            state,
                        });
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "progress file unreadable; starting fresh");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "progress file unreadable; starting fresh");
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: ProgressState::default(),
        })
    }

    /// Read access to the current state.
    #[must_use]
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Marks the session started with the given totals.
    pub fn start_session(&mut self, total_skills: u64, total_books: u64) {
        self.state.status = SessionStatus::InProgress;
        self.state.start_time = Utc::now();
        self.state.total_skills = total_skills;
        self.state.total_books = total_books;
    }

    /// `in_progress → paused` (interrupt).
    pub fn pause_session(&mut self) {
        self.state.status = SessionStatus::Paused;
    }

    /// `paused → in_progress` (resume).
    pub fn resume_session(&mut self) {
        self.state.status = SessionStatus::InProgress;
    }

    /// `in_progress → completed`.
    pub fn complete_session(&mut self) {
        self.state.status = SessionStatus::Completed;
        self.state.current_activity = CurrentActivity::default();
    }

    /// Any state → failed (fatal error).
    pub fn fail_session(&mut self) {
        self.state.status = SessionStatus::Failed;
    }

    /// Updates the current-topic snapshot.
    pub fn update_current_skill(&mut self, skill: &str, done: usize, total: usize) {
        self.state.current_activity.current_skill = Some(skill.to_string());
        self.state.current_activity.current_skill_progress = format!("{done}/{total}");
    }

    /// Updates the current-book snapshot.
    pub fn update_current_item(&mut self, title: &str, id: &str) {
        self.state.current_activity.current_item = Some(title.to_string());
        self.state.current_activity.current_item_id = Some(id.to_string());
    }

    /// Records a completed book. Clears any earlier failure for the same id.
    pub fn record_completed_item(&mut self, id: &str) {
        if !self.state.completed_items.iter().any(|i| i == id) {
            self.state.completed_items.push(id.to_string());
        }
        self.state.completed_books = self.state.completed_items.len() as u64;
        self.state.failed_items.remove(id);
    }

    /// Records a book skipped by the existence check.
    pub fn record_skipped_item(&mut self) {
        self.state.skipped_books += 1;
    }

    /// Records a failed book. The first message for an id wins; later
    /// failures of the same id do not duplicate or overwrite it.
    pub fn record_failed_item(&mut self, id: &str, kind: &str, message: &str) {
        self.state
            .failed_items
            .entry(id.to_string())
            .or_insert_with(|| FailedItem {
                kind: kind.to_string(),
                message: message.to_string(),
            });
    }

    /// Marks a topic completed, appending a checkpoint every
    /// [`CHECKPOINT_EVERY_SKILLS`] completions.
    pub fn complete_skill(&mut self, skill: &str) {
        if !self.state.skills_completed.iter().any(|s| s == skill) {
            self.state.skills_completed.push(skill.to_string());
        }
        self.state.completed_skills = self.state.skills_completed.len() as u64;
        self.state.current_activity.current_skill = None;
        self.state.current_activity.current_item = None;
        self.state.current_activity.current_item_id = None;

        if self.state.completed_skills % CHECKPOINT_EVERY_SKILLS == 0 {
            self.append_checkpoint();
        }
    }

    /// Appends a checkpoint, keeping only the most recent
    /// [`MAX_CHECKPOINTS`].
    pub fn append_checkpoint(&mut self) {
        self.state.checkpoints.push(Checkpoint {
            timestamp: Utc::now(),
            completed_books: self.state.completed_books,
            completed_skills: self.state.completed_skills,
            failed_books: self.state.failed_items.len() as u64,
        });
        let excess = self.state.checkpoints.len().saturating_sub(MAX_CHECKPOINTS);
        if excess > 0 {
            self.state.checkpoints.drain(..excess);
        }
    }

    /// Wall-clock time since the session started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.state.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Estimated time remaining: `(total − completed) / speed`, where
    /// `speed = completed / elapsed`. Unknown (`None`) when the session is
    /// under a second old or no speed is measurable yet.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let elapsed = self.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let speed = self.state.completed_books as f64 / elapsed.as_secs_f64();
        if speed < MIN_SPEED {
            return None;
        }
        let remaining = self
            .state
            .total_books
            .saturating_sub(self.state.completed_books) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    /// Writes the state to its file via temp-file + atomic rename.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::State`]; a progress write failure is job-fatal.
    pub fn save(&mut self) -> Result<(), JobError> {
        self.state.last_update = Utc::now();

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| JobError::State {
                path: self.path.clone(),
                source,
            })?;
        }

        let body =
            serde_json::to_vec_pretty(&self.state).map_err(|source| JobError::State {
                path: self.path.clone(),
                source: std::io::Error::other(source),
            })?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &body).map_err(|source| JobError::State {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| JobError::State {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), "save: progress checkpointed");
        Ok(())
    }
}
