use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::download::events::TaskProgress;
use crate::model::Chapter;

/// Completions averaged for the remaining-time estimate.
pub const ETA_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Registered,
    Running,
    Draining,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChapter {
    pub url: String,
    pub reason: String,
}

/// Progress of one download batch for a web novel.
#[derive(Debug, Clone)]
pub struct Task {
    novel_url: String,
    state: TaskState,
    pending: VecDeque<Chapter>,
    in_flight: Vec<String>,
    completed: Vec<String>,
    failed: Vec<FailedChapter>,
    durations: VecDeque<Duration>,
    last_mark: Instant,
    workers: usize,
}

impl Task {
    pub fn new(novel_url: impl Into<String>, now: Instant) -> Self {
        Self {
            novel_url: novel_url.into(),
            state: TaskState::Registered,
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            durations: VecDeque::with_capacity(ETA_WINDOW),
            last_mark: now,
            workers: 0,
        }
    }

    pub fn novel_url(&self) -> &str {
        &self.novel_url
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn pending(&self) -> impl Iterator<Item = &Chapter> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> &[String] {
        &self.in_flight
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failed(&self) -> &[FailedChapter] {
        &self.failed
    }

    /// Appends chapters not already pending or in flight. Returns how many
    /// were added.
    pub fn enqueue(&mut self, chapters: impl IntoIterator<Item = Chapter>) -> usize {
        let mut known = self
            .pending
            .iter()
            .map(|chapter| chapter.url.clone())
            .chain(self.in_flight.iter().cloned())
            .collect::<HashSet<_>>();

        let mut added = 0;
        for chapter in chapters {
            if known.insert(chapter.url.clone()) {
                self.pending.push_back(chapter);
                added += 1;
            }
        }
        if added > 0 && self.state == TaskState::Draining {
            self.state = TaskState::Running;
        }
        added
    }

    pub fn claim_next(&mut self) -> Option<Chapter> {
        let chapter = self.pending.pop_front()?;
        self.in_flight.push(chapter.url.clone());
        self.state = TaskState::Running;
        Some(chapter)
    }

    pub fn complete(&mut self, url: &str, now: Instant) {
        self.settle(url, now);
        self.completed.push(url.to_owned());
    }

    pub fn fail(&mut self, url: &str, reason: impl Into<String>, now: Instant) {
        self.settle(url, now);
        self.failed.push(FailedChapter {
            url: url.to_owned(),
            reason: reason.into(),
        });
    }

    /// Mean of the last [`ETA_WINDOW`] completion intervals times the pending
    /// count; `None` until the window is full.
    pub fn eta(&self) -> Option<Duration> {
        if self.durations.len() < ETA_WINDOW {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        let mean = total / ETA_WINDOW as u32;
        Some(mean * u32::try_from(self.pending.len()).unwrap_or(u32::MAX))
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            novel_url: self.novel_url.clone(),
            state: self.state,
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            eta: self.eta(),
        }
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    pub(crate) fn add_workers(&mut self, count: usize) {
        self.workers += count;
    }

    /// Marks one worker as gone; returns `true` when it was the last one.
    pub(crate) fn retire_worker(&mut self) -> bool {
        self.workers = self.workers.saturating_sub(1);
        self.workers == 0
    }

    pub(crate) fn finish(&mut self, cancelled: bool) {
        self.state = if cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Completed
        };
    }

    fn settle(&mut self, url: &str, now: Instant) {
        if let Some(position) = self.in_flight.iter().position(|u| u == url) {
            self.in_flight.swap_remove(position);
        }

        if self.durations.len() == ETA_WINDOW {
            self.durations.pop_front();
        }
        self.durations
            .push_back(now.saturating_duration_since(self.last_mark));
        self.last_mark = now;

        if self.pending.is_empty() {
            self.state = TaskState::Draining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOVEL: &str = "https://novels.example/n/1";

    fn chapters(ids: std::ops::RangeInclusive<u64>) -> Vec<Chapter> {
        ids.map(|id| Chapter::new(NOVEL, format!("{NOVEL}/c/{id}"), id, format!("{id}"), "tl"))
            .collect()
    }

    #[test]
    fn enqueue_suppresses_duplicates_against_pending_and_in_flight() {
        let mut task = Task::new(NOVEL, Instant::now());
        assert_eq!(task.enqueue(chapters(1..=3)), 3);
        let claimed = task.claim_next().expect("claim");
        assert_eq!(claimed.id, 1);

        assert_eq!(task.enqueue(chapters(1..=4)), 1);
        assert_eq!(
            task.pending().map(|c| c.id).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(task.in_flight().len(), 1);
    }

    #[test]
    fn eta_is_unavailable_until_window_fills() {
        let start = Instant::now();
        let mut task = Task::new(NOVEL, start);
        task.enqueue(chapters(1..=10));

        for i in 1..=4u64 {
            let chapter = task.claim_next().expect("claim");
            task.complete(&chapter.url, start + Duration::from_secs(2 * i));
            assert_eq!(task.eta(), None);
        }

        let chapter = task.claim_next().expect("claim");
        task.fail(&chapter.url, "timeout", start + Duration::from_secs(10));
        // Five 2s intervals, five chapters left.
        assert_eq!(task.eta(), Some(Duration::from_secs(10)));

        let chapter = task.claim_next().expect("claim");
        task.complete(&chapter.url, start + Duration::from_secs(17));
        // Window is now 2,2,2,2,7 -> mean 3s, four left.
        assert_eq!(task.eta(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn state_moves_through_running_and_draining() {
        let now = Instant::now();
        let mut task = Task::new(NOVEL, now);
        assert_eq!(task.state(), TaskState::Registered);

        task.enqueue(chapters(1..=1));
        let chapter = task.claim_next().expect("claim");
        assert_eq!(task.state(), TaskState::Running);

        task.complete(&chapter.url, now);
        assert_eq!(task.state(), TaskState::Draining);
        assert!(task.in_flight().is_empty());

        task.enqueue(chapters(2..=2));
        assert_eq!(task.state(), TaskState::Running);

        task.finish(true);
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn progress_reports_counts() {
        let now = Instant::now();
        let mut task = Task::new(NOVEL, now);
        task.enqueue(chapters(1..=3));
        let a = task.claim_next().expect("claim");
        let b = task.claim_next().expect("claim");
        task.complete(&a.url, now);
        task.fail(&b.url, "404", now);

        let progress = task.progress();
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.in_flight, 0);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.eta, None);
        assert_eq!(task.failed()[0].reason, "404");
    }
}
