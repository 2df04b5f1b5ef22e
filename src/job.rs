//! Job controller: orchestrates discovery and download runs.
//!
//! One serial pipeline per job. The controller reads the topic catalogue,
//! drives the discovery engine and the per-book fetch → package pipeline,
//! updates the progress tracker at item boundaries, and persists the
//! session cookies on the configured cadence. The file system is the
//! authoritative record of completed work; the tracker is bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, instrument, warn};

use crate::config::JobConfig;
use crate::discovery::{DiscoveryEngine, TopicManifest};
use crate::epub::EpubBuilder;
use crate::error::{FetchError, JobError};
use crate::fetch::{BookFetcher, BookMetadata, extract_book_id};
use crate::naming::{book_folder_name, is_book_present, topic_folder_name};
use crate::progress::ProgressTracker;
use crate::rate::{RatePolicy, RequestClass, RetryPolicy};
use crate::session::{CookieStore, GetOptions, SessionClient};
use crate::topics::{self, Topic};

/// Outcome of a completed (or interrupted) run.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    /// Topics processed to completion.
    pub skills_processed: usize,
    /// Books downloaded and packaged during this run.
    pub books_completed: u64,
    /// Books skipped by the existence check.
    pub books_skipped: u64,
    /// Books that failed (cumulative, from the tracker).
    pub books_failed: u64,
    /// Whether the run stopped on an interrupt.
    pub interrupted: bool,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl JobSummary {
    /// Process exit code: 0 success, 3 partial success, 130 interrupted.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            130
        } else if self.books_failed > 0 {
            3
        } else {
            0
        }
    }
}

/// The per-job orchestrator.
pub struct JobController {
    config: JobConfig,
    session: Arc<SessionClient>,
    rate: Arc<RatePolicy>,
    tracker: ProgressTracker,
    interrupted: Arc<AtomicBool>,
    spinner: ProgressBar,
}

impl JobController {
    /// Builds a controller: loads the cookie jar, the progress file, and
    /// wires up the shared session and pacing.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Config`] when the cookie file is unusable and
    /// [`JobError::ResumeConflict`] when the progress file is too new.
    pub fn new(config: JobConfig) -> Result<Self, JobError> {
        config
            .validate()
            .map_err(|e| JobError::Config(e.to_string()))?;
        // Serial pipeline, always; the config method logs if it refused a
        // higher request.
        let _ = config.effective_concurrency();

        let cookies = if config.cookies_file.exists() {
            let store = CookieStore::load(&config.cookies_file)
                .map_err(|e| JobError::Config(e.to_string()))?;
            store.warn_if_unauthenticated();
            Arc::new(store)
        } else {
            warn!(
                path = %config.cookies_file.display(),
                "cookie file missing; starting with an empty jar"
            );
            Arc::new(CookieStore::from_map(
                &config.cookies_file,
                std::collections::BTreeMap::new(),
            ))
        };

        let session = Arc::new(SessionClient::new(cookies, config.token_save_interval));
        let rate = Arc::new(RatePolicy::new(
            config.discovery_delay(),
            config.download_delay(),
            config.session_reuse_delay(),
        ));
        let tracker = ProgressTracker::load_or_new(&config.progress_file, config.resume)?;

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        Ok(Self {
            config,
            session,
            rate,
            tracker,
            interrupted: Arc::new(AtomicBool::new(false)),
            spinner,
        })
    }

    /// The flag a signal handler sets to request a graceful stop.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Discovery mode: enumerate topics (smallest expected count first),
    /// write a manifest per topic, checkpoint as it goes.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Auth`] on a dead session and state-write
    /// failures; individual topic failures are recorded and skipped.
    #[instrument(skip_all)]
    pub async fn run_discovery(
        &mut self,
        mut topics: Vec<Topic>,
        update: bool,
    ) -> Result<JobSummary, JobError> {
        topics::order_for_processing(&mut topics);

        let engine = DiscoveryEngine::from_config(
            &self.config,
            Arc::clone(&self.session),
            Arc::clone(&self.rate),
        );

        if !update {
            let before = topics.len();
            topics.retain(|topic| !engine.is_topic_discovered(&topic.name));
            let skipped = before - topics.len();
            if skipped > 0 {
                info!(skipped, "skip: topics already discovered");
            }
        }

        let expected_total: u64 = topics.iter().filter_map(|t| t.expected_count).sum();
        self.tracker
            .start_session(topics.len() as u64, expected_total);
        self.tracker.save()?;

        let started = std::time::Instant::now();
        let total = topics.len();
        let mut summary = JobSummary::default();

        for (index, topic) in topics.iter().enumerate() {
            if self.is_interrupted() {
                summary.interrupted = true;
                break;
            }

            self.spinner.set_message(format!(
                "[{}/{}] Discovering {}...",
                index + 1,
                total,
                topic.name
            ));
            self.tracker.update_current_skill(&topic.name, index, total);

            match engine.discover_topic(topic).await {
                Ok(outcome) => {
                    self.tracker.complete_skill(&topic.name);
                    summary.skills_processed += 1;
                    summary.books_completed += outcome.manifest.total_books;
                }
                Err(error) if error.is_auth() => {
                    self.tracker.fail_session();
                    self.tracker.save()?;
                    return Err(JobError::Auth(error));
                }
                Err(error) => {
                    error!(topic = %topic.name, error = %error, "fail: topic discovery failed");
                    self.tracker
                        .record_failed_item(&topic.name, error.kind(), &error.to_string());
                }
            }
            self.tracker.save()?;
        }

        self.finish_session(&mut summary, started)?;
        Ok(summary)
    }

    /// Download mode: walk every topic manifest (smallest first), skip
    /// books already on disk, and pipeline the rest through fetch →
    /// package.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Auth`] when the session dies and state-write
    /// failures. Per-book failures are recorded and the run continues.
    #[instrument(skip_all)]
    pub async fn run_download(
        &mut self,
        skill_filter: Option<&[String]>,
    ) -> Result<JobSummary, JobError> {
        let manifests = self.load_manifests(skill_filter)?;
        if manifests.is_empty() {
            return Err(JobError::Config(format!(
                "no topic manifests in {}; run discovery first",
                self.config.book_ids_directory.display()
            )));
        }

        self.auth_probe().await?;

        let fetcher = BookFetcher::new(
            Arc::clone(&self.session),
            Arc::clone(&self.rate),
            RetryPolicy::default(),
            &self.config.base_url,
        );

        let total_books: u64 = manifests.iter().map(|m| m.total_books).sum();
        self.tracker
            .start_session(manifests.len() as u64, total_books);
        self.tracker.save()?;

        let started = std::time::Instant::now();
        let mut summary = JobSummary::default();

        'topics: for manifest in &manifests {
            if self.is_interrupted() {
                summary.interrupted = true;
                break;
            }

            let skill_dir = self
                .config
                .base_directory
                .join(topic_folder_name(&manifest.skill_name));
            let book_count = manifest.books.len();
            info!(
                topic = %manifest.skill_name,
                books = book_count,
                "download: starting topic"
            );

            for (index, book) in manifest.books.iter().enumerate() {
                if self.is_interrupted() {
                    summary.interrupted = true;
                    break 'topics;
                }

                self.tracker
                    .update_current_skill(&manifest.skill_name, index, book_count);
                self.tracker.update_current_item(&book.title, &book.id);
                self.spinner.set_message(format!(
                    "[{}/{}] {}: {}",
                    index + 1,
                    book_count,
                    manifest.skill_name,
                    book.title
                ));

                let book_id = extract_book_id(&book.id);
                let book_dir = skill_dir.join(book_folder_name(&book.title, &book_id));

                if !self.config.force_redownload
                    && self.existing_book(&book_dir)
                {
                    info!(book_id = %book_id, title = %book.title, "skip: already on disk");
                    self.tracker.record_skipped_item();
                    self.tracker.record_completed_item(&book_id);
                    summary.books_skipped += 1;
                    self.tracker.save()?;
                    continue;
                }

                // Book-boundary pacing, then the session-reuse gap.
                self.rate.acquire(RequestClass::Download).await;
                self.rate.acquire(RequestClass::SessionReuse).await;

                match self.download_one_book(&fetcher, &book_id, &book_dir).await {
                    Ok(()) => {
                        self.tracker.record_completed_item(&book_id);
                        summary.books_completed += 1;
                        if self
                            .session
                            .record_book_download()
                            .await
                            .map_err(|e| JobError::State {
                                path: self.config.cookies_file.clone(),
                                source: std::io::Error::other(e),
                            })?
                        {
                            info!("save: cookie jar persisted");
                        }
                    }
                    Err(error) if error.is_auth() => {
                        self.tracker.fail_session();
                        self.tracker.save()?;
                        self.flush_state().await?;
                        return Err(JobError::Auth(error));
                    }
                    Err(error) => {
                        error!(
                            book_id = %book_id,
                            title = %book.title,
                            error = %error,
                            "fail: book failed"
                        );
                        self.tracker
                            .record_failed_item(&book_id, error.kind(), &error.to_string());
                    }
                }
                self.tracker.save()?;
            }

            self.tracker.complete_skill(&manifest.skill_name);
            summary.skills_processed += 1;
            self.tracker.save()?;
        }

        self.finish_session(&mut summary, started)?;
        Ok(summary)
    }

    /// Fetches and packages one book.
    async fn download_one_book(
        &self,
        fetcher: &BookFetcher,
        book_id: &str,
        book_dir: &std::path::Path,
    ) -> Result<(), FetchError> {
        let fetched = fetcher.fetch_book(book_id, book_dir).await?;

        let builder = EpubBuilder::new(
            book_dir,
            &fetched.metadata,
            &fetched.chapters,
            fetched.cover_file.as_deref(),
        );
        let paths = builder
            .build_all(self.config.epub_format)
            .map_err(|e| FetchError::parse(book_id, e.to_string()))?;

        info!(
            book_id = %book_id,
            files = paths.len(),
            "download: book complete"
        );
        Ok(())
    }

    /// The on-disk existence check. Uses the metadata sidecar of a prior
    /// run to reconstruct the package filenames; without a sidecar the
    /// book cannot be present.
    fn existing_book(&self, book_dir: &std::path::Path) -> bool {
        let sidecar = book_dir.join("metadata.json");
        let Ok(raw) = std::fs::read_to_string(&sidecar) else {
            return false;
        };
        let Ok(metadata) = serde_json::from_str::<BookMetadata>(&raw) else {
            return false;
        };
        is_book_present(
            book_dir,
            &metadata.title,
            metadata.first_author(),
            self.config.epub_format,
        )
    }

    /// One cheap authenticated request before a download run. A dead
    /// session fails fast here instead of one book in.
    async fn auth_probe(&self) -> Result<(), JobError> {
        let url = format!("{}/profile/", self.config.base_url.trim_end_matches('/'));
        match self.session.get(&url, &GetOptions::default()).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_auth() => Err(JobError::Auth(error)),
            Err(error) => {
                // Transport trouble is not proof of a dead session; let the
                // per-book pipeline find out.
                warn!(error = %error, "auth probe inconclusive; continuing");
                Ok(())
            }
        }
    }

    /// Loads and orders the topic manifests for a download run.
    fn load_manifests(
        &self,
        skill_filter: Option<&[String]>,
    ) -> Result<Vec<TopicManifest>, JobError> {
        let dir = &self.config.book_ids_directory;
        let entries = std::fs::read_dir(dir).map_err(|_| {
            JobError::Config(format!("book ids directory {} not found", dir.display()))
        })?;

        let mut manifests = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let is_manifest = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_books.json"));
            if !is_manifest {
                continue;
            }
            match TopicManifest::load(&path) {
                Ok(manifest) => {
                    let selected = skill_filter.is_none_or(|filter| {
                        filter.iter().any(|f| {
                            manifest
                                .skill_name
                                .to_lowercase()
                                .contains(&f.to_lowercase())
                        })
                    });
                    if selected {
                        manifests.push(manifest);
                    }
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping unreadable manifest");
                }
            }
        }

        // Small topics first so early wins stabilize the ETA.
        manifests.sort_by_key(|manifest| manifest.total_books);
        Ok(manifests)
    }

    /// Marks the session finished (or paused), flushes all state, and
    /// writes the human-readable summary file.
    fn finish_session(
        &mut self,
        summary: &mut JobSummary,
        started: std::time::Instant,
    ) -> Result<(), JobError> {
        summary.elapsed = started.elapsed();
        summary.books_failed = self.tracker.state().failed_items.len() as u64;

        if summary.interrupted {
            self.tracker.pause_session();
            info!("download interrupted; progress saved for resume");
        } else {
            self.tracker.complete_session();
        }
        self.tracker.save()?;
        self.spinner.finish_and_clear();
        self.write_summary_file(summary);
        Ok(())
    }

    /// Flushes cookies; a failed cookie write is job-fatal.
    async fn flush_state(&self) -> Result<(), JobError> {
        self.session
            .flush_cookies()
            .await
            .map_err(|e| JobError::State {
                path: self.config.cookies_file.clone(),
                source: std::io::Error::other(e),
            })
    }

    /// Flushes cookies and progress on shutdown (both paths of §exit).
    ///
    /// # Errors
    ///
    /// Returns the first state-write failure.
    pub async fn shutdown(&mut self) -> Result<(), JobError> {
        self.flush_state().await?;
        self.tracker.save()
    }

    /// Writes `download_summary.txt` next to the progress file.
    fn write_summary_file(&self, summary: &JobSummary) {
        let state = self.tracker.state();
        let mut body = String::new();
        body.push_str("DOWNLOAD SUMMARY\n");
        body.push_str("================\n\n");
        body.push_str(&format!("Session:          {}\n", state.session_id));
        body.push_str(&format!("Status:           {:?}\n", state.status));
        body.push_str(&format!("Topics processed: {}\n", summary.skills_processed));
        body.push_str(&format!("Books completed:  {}\n", state.completed_books));
        body.push_str(&format!("Books skipped:    {}\n", summary.books_skipped));
        body.push_str(&format!("Books failed:     {}\n", state.failed_items.len()));
        body.push_str(&format!(
            "Elapsed:          {:.1} minutes\n",
            summary.elapsed.as_secs_f64() / 60.0
        ));

        if !state.failed_items.is_empty() {
            body.push_str("\nFAILED ITEMS\n------------\n");
            for (id, item) in &state.failed_items {
                body.push_str(&format!("{id}  [{}]  {}\n", item.kind, item.message));
            }
        }

        let path = self.summary_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(error) = std::fs::write(&path, body) {
            warn!(path = %path.display(), error = %error, "could not write summary file");
        } else {
            info!(path = %path.display(), "save: summary written");
        }
    }

    /// The summary file lives next to the progress file.
    fn summary_path(&self) -> PathBuf {
        self.config
            .progress_file
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("download_summary.txt")
    }

    /// Read access to the tracker (status display, tests).
    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }
}
