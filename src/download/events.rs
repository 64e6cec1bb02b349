use std::time::Duration;

use serde::Serialize;

use crate::download::task::{FailedChapter, TaskState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub novel_url: String,
    pub state: TaskState,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub eta: Option<Duration>,
}

/// Lifecycle signals published by the downloader. Sends never block; slow
/// subscribers observe `RecvError::Lagged` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    TaskRegistered {
        novel_url: String,
        pending: usize,
    },
    TaskProgress(TaskProgress),
    TaskCompleted {
        novel_url: String,
        completed: usize,
        failed: Vec<FailedChapter>,
        cancelled: bool,
    },
}

impl DownloadEvent {
    pub fn novel_url(&self) -> &str {
        match self {
            Self::TaskRegistered { novel_url, .. } | Self::TaskCompleted { novel_url, .. } => {
                novel_url
            }
            Self::TaskProgress(progress) => &progress.novel_url,
        }
    }
}
