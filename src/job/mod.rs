//! Publish job tracking.
//!
//! Each publish runs as a background task that reports through a
//! [`JobHandle`]; callers poll snapshots off the [`JobBoard`] by job id.
//! Every job carries a cancel flag the publish loop checks at each wait
//! boundary, so navigating away can stop a poll promptly instead of
//! waiting out its timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;


/// Lifecycle of one publish job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

/// URLs of a successfully published site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishResult {
    pub site_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_url: Option<String>,
}

/// Snapshot of one publish job: current status, a short progress message,
/// and the ordered log/error lines collected so far.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishJob {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PublishResult>,
}

impl PublishJob {
    fn new(message: String) -> Self {
        Self {
            // v7 keeps ids time-ordered, which keeps job listings readable
            id: Uuid::now_v7().to_string(),
            status: JobStatus::Pending,
            message,
            logs: Vec::new(),
            errors: Vec::new(),
            result: None,
        }
    }
}

/// Writer side of one job, held by the publish task.
///
/// Mutations take a short std lock; the lock is never held across an
/// await point.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    job: Arc<Mutex<PublishJob>>,
    cancel: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether a cancel was requested. Checked at every wait boundary.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: JobStatus) {
        self.job.lock().unwrap().status = status;
    }

    /// Update the short progress message shown in the editor.
    pub fn set_message(&self, message: impl Into<String>) {
        self.job.lock().unwrap().message = message.into();
    }

    /// Append one log line.
    pub fn log(&self, line: impl Into<String>) {
        self.job.lock().unwrap().logs.push(line.into());
    }

    /// Append one error line.
    pub fn log_error(&self, line: impl Into<String>) {
        self.job.lock().unwrap().errors.push(line.into());
    }

    /// Terminal success with the published URLs.
    pub fn succeed(&self, message: impl Into<String>, result: PublishResult) {
        let mut job = self.job.lock().unwrap();
        job.status = JobStatus::Success;
        job.message = message.into();
        job.result = Some(result);
    }

    /// Terminal failure. The message lands in both the progress message
    /// and the error lines.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut job = self.job.lock().unwrap();
        job.status = JobStatus::Error;
        job.errors.push(message.clone());
        job.message = message;
    }

    pub fn snapshot(&self) -> PublishJob {
        self.job.lock().unwrap().clone()
    }
}

/// All live publish jobs of one connector, keyed by job id.
pub struct JobBoard {
    jobs: DashMap<String, JobHandle>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Register a new pending job and hand back its writer handle.
    pub fn create(&self, message: impl Into<String>) -> JobHandle {
        let job = PublishJob::new(message.into());
        let handle = JobHandle {
            id: job.id.clone(),
            job: Arc::new(Mutex::new(job)),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        self.jobs.insert(handle.id.clone(), handle.clone());
        handle
    }

    pub fn snapshot(&self, id: &str) -> Option<PublishJob> {
        self.jobs.get(id).map(|handle| handle.snapshot())
    }

    /// Request cancellation. The job flips its own status once the publish
    /// task observes the flag. Returns whether the job exists.
    pub fn cancel(&self, id: &str) -> bool {
        match self.jobs.get(id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop a finished job from the board.
    pub fn remove(&self, id: &str) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}
