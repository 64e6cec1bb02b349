//! Bounded-concurrency chapter downloads.
//!
//! Each active task owns up to `pool_size` workers. A worker claims the next
//! pending chapter, runs fetch -> extract -> persist -> catalogue sync, records
//! the outcome and claims again. The last worker to find nothing left retires
//! the task from the registry.

pub mod events;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::extract::ExtractionEngine;
use crate::library::Library;
use crate::model::{Chapter, ChapterFilter};
use crate::provider::NovelProvider;

pub use events::{DownloadEvent, TaskProgress};
pub use task::{ETA_WINDOW, FailedChapter, Task, TaskState};

pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub novel_url: String,
    pub chapters: Vec<Chapter>,
}

impl DownloadRequest {
    pub fn new(novel_url: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        Self {
            novel_url: novel_url.into(),
            chapters,
        }
    }

    /// Chapters of enabled groups that are not downloaded yet.
    pub async fn missing(library: &Library, novel_url: &str) -> anyhow::Result<Self> {
        let chapters = library
            .load_chapters(novel_url, ChapterFilter::EnabledGroups)
            .await
            .context("load chapters")?
            .into_iter()
            .filter(|chapter| !chapter.downloaded)
            .collect();
        Ok(Self::new(novel_url, chapters))
    }
}

struct ActiveTask {
    task: std::sync::Mutex<Task>,
    cancel: CancellationToken,
    provider: Arc<dyn NovelProvider>,
}

impl ActiveTask {
    fn task(&self) -> std::sync::MutexGuard<'_, Task> {
        self.task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn claim(&self) -> Option<Chapter> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.task().claim_next()
    }
}

struct Shared {
    library: Arc<Library>,
    engine: Arc<ExtractionEngine>,
    pool_size: usize,
    registry: Mutex<HashMap<String, Arc<ActiveTask>>>,
    finished: std::sync::Mutex<HashMap<String, Task>>,
    events: broadcast::Sender<DownloadEvent>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(library: Arc<Library>, engine: Arc<ExtractionEngine>, pool_size: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                library,
                engine,
                pool_size: pool_size.max(1),
                registry: Mutex::new(HashMap::new()),
                finished: std::sync::Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Registers a batch, merging into the running task for the same novel.
    /// Returns how many chapters were newly queued.
    ///
    /// A merged batch keeps running on the provider of the existing task.
    pub async fn download(
        &self,
        request: DownloadRequest,
        provider: Arc<dyn NovelProvider>,
    ) -> anyhow::Result<usize> {
        if self.shared.shutdown.is_cancelled() {
            anyhow::bail!("downloader is shut down");
        }

        let mut registry = self.shared.registry.lock().await;
        let (active, added, spawn) = match registry.get(&request.novel_url) {
            Some(active) => {
                if active.cancel.is_cancelled() {
                    anyhow::bail!("task is being cancelled: {}", request.novel_url);
                }
                let active = Arc::clone(active);
                let (added, spawn) = {
                    let mut task = active.task();
                    let added = task.enqueue(request.chapters);
                    let spawn = self
                        .shared
                        .pool_size
                        .saturating_sub(task.workers())
                        .min(task.pending_len());
                    task.add_workers(spawn);
                    (added, spawn)
                };
                (active, added, spawn)
            }
            None => {
                let mut task = Task::new(request.novel_url.as_str(), Instant::now());
                let added = task.enqueue(request.chapters);
                if added == 0 {
                    return Ok(0);
                }
                let spawn = self.shared.pool_size.min(added);
                task.add_workers(spawn);

                let active = Arc::new(ActiveTask {
                    task: std::sync::Mutex::new(task),
                    cancel: self.shared.shutdown.child_token(),
                    provider,
                });
                registry.insert(request.novel_url.clone(), Arc::clone(&active));
                (active, added, spawn)
            }
        };
        drop(registry);

        if added > 0 {
            let pending = active.task().pending_len();
            tracing::info!(novel = %request.novel_url, added, pending, workers = spawn, "download task registered");
            self.shared.emit(DownloadEvent::TaskRegistered {
                novel_url: request.novel_url.clone(),
                pending,
            });
        }

        for _ in 0..spawn {
            let shared = Arc::clone(&self.shared);
            let active = Arc::clone(&active);
            tokio::spawn(async move {
                run_worker(shared, active).await;
            });
        }
        Ok(added)
    }

    /// Starts a new batch from the failures of the last finished task.
    pub async fn retry_failed(
        &self,
        novel_url: &str,
        provider: Arc<dyn NovelProvider>,
    ) -> anyhow::Result<usize> {
        let failed = self
            .finished_task(novel_url)
            .map(|task| task.failed().to_vec())
            .unwrap_or_default();

        let mut chapters = Vec::with_capacity(failed.len());
        for failure in failed {
            match self.shared.library.chapter(&failure.url).await? {
                Some(chapter) => chapters.push(chapter),
                None => tracing::warn!(chapter = %failure.url, "failed chapter no longer stored"),
            }
        }
        self.download(DownloadRequest::new(novel_url, chapters), provider)
            .await
    }

    pub async fn current_task(&self, novel_url: &str) -> Option<Task> {
        let registry = self.shared.registry.lock().await;
        registry
            .get(novel_url)
            .map(|active| active.task().clone())
    }

    pub async fn current_tasks(&self) -> Vec<Task> {
        let registry = self.shared.registry.lock().await;
        registry
            .values()
            .map(|active| active.task().clone())
            .collect()
    }

    /// Last retired task for a novel.
    pub fn finished_task(&self, novel_url: &str) -> Option<Task> {
        self.shared.finished().get(novel_url).cloned()
    }

    /// Stops dispatching new chapters; in-flight chapters finish normally.
    pub async fn cancel(&self, novel_url: &str) -> bool {
        let registry = self.shared.registry.lock().await;
        match registry.get(novel_url) {
            Some(active) => {
                tracing::info!(novel = %novel_url, "cancelling download task");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every task and aborts in-flight fetches.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn finished(&self) -> std::sync::MutexGuard<'_, HashMap<String, Task>> {
        self.finished
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fetch, extract and persist one chapter. Only the queued URL is used;
    /// the rest of the chapter is reloaded from the library when stored.
    async fn process(&self, active: &ActiveTask, chapter_url: &str) -> anyhow::Result<()> {
        let markup = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => anyhow::bail!("cancelled"),
            markup = active.provider.load_chapter(chapter_url) => markup.context("fetch chapter")?,
        };

        let engine = Arc::clone(&self.engine);
        let url = chapter_url.to_owned();
        let (markup, extraction) = tokio::task::spawn_blocking(move || {
            let extraction = engine.extract(&markup, &url);
            (markup, extraction)
        })
        .await
        .context("join extraction")?;
        if extraction.is_empty() {
            tracing::warn!(chapter = %chapter_url, "no content extracted; keeping raw markup");
        }

        self.library
            .store_download(chapter_url, markup, extraction.content)
            .await
            .context("persist chapter")?;
        Ok(())
    }
}

async fn run_worker(shared: Arc<Shared>, active: Arc<ActiveTask>) {
    loop {
        while let Some(chapter) = active.claim() {
            let url = chapter.url;
            let result = shared.process(&active, &url).await;

            let progress = {
                let mut task = active.task();
                match &result {
                    Ok(()) => task.complete(&url, Instant::now()),
                    Err(err) => task.fail(&url, format!("{err:#}"), Instant::now()),
                }
                task.progress()
            };
            if let Err(err) = &result {
                tracing::warn!(chapter = %url, ?err, "chapter download failed");
            }
            shared.emit(DownloadEvent::TaskProgress(progress));
        }

        // Retiring takes the registry lock so a concurrent merge either sees
        // this worker alive or finds the task gone.
        let mut registry = shared.registry.lock().await;
        let cancelled = active.cancel.is_cancelled();
        let finished = {
            let mut task = active.task();
            if !cancelled && task.pending_len() > 0 {
                None
            } else if task.retire_worker() {
                task.finish(cancelled);
                Some(task.clone())
            } else {
                return;
            }
        };
        let Some(finished) = finished else {
            continue;
        };

        registry.remove(finished.novel_url());
        drop(registry);

        tracing::info!(
            novel = %finished.novel_url(),
            completed = finished.completed().len(),
            failed = finished.failed().len(),
            cancelled,
            "download task finished"
        );
        let event = DownloadEvent::TaskCompleted {
            novel_url: finished.novel_url().to_owned(),
            completed: finished.completed().len(),
            failed: finished.failed().to_vec(),
            cancelled,
        };
        shared
            .finished()
            .insert(finished.novel_url().to_owned(), finished);
        shared.emit(event);
        break;
    }
}
