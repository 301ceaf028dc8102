//! Task lifecycle controller.
//!
//! Drives the state machine: enqueue on submission, dequeue-one and execute,
//! then finalize completed/failed tasks by handing notifications to the
//! messaging collaborator.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};

use crate::db::Db;
use crate::executor::DownloadExecutor;
use crate::models::{TaskStatus, UserStat};
use crate::platform;
use crate::rate_limit::RateLimiter;
use crate::telegram::MessagingGateway;

/// Bounded batch per finalize pass, to keep per-tick work finite.
const FINALIZE_BATCH: u32 = 5;

/// Result of a submission attempt. `RateLimited` and `InvalidUrl` are
/// terminal, user-visible rejections; neither creates a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(i64),
    RateLimited,
    InvalidUrl,
}

pub struct TaskManager {
    db: Db,
    limiter: RateLimiter,
    executor: DownloadExecutor,
    max_file_bytes: u64,
}

impl TaskManager {
    pub fn new(db: Db, limiter: RateLimiter, executor: DownloadExecutor, max_file_mb: u64) -> Self {
        Self {
            db,
            limiter,
            executor,
            max_file_bytes: max_file_mb * 1024 * 1024,
        }
    }

    /// Fail any task a previous run left mid-download. Call once before the
    /// first tick; affected users get the normal failure notification.
    pub fn recover(&mut self) -> Result<usize> {
        let recovered = self
            .db
            .fail_stale_downloads("Download was interrupted by a restart.")
            .context("recovering stale downloads")?;
        if recovered > 0 {
            warn!("recovered {recovered} task(s) stuck in downloading");
        }
        Ok(recovered)
    }

    /// Validate and enqueue one URL request.
    ///
    /// Rejections happen before any task row exists, and an invalid URL is
    /// rejected before the rate counter moves, so a bad link never costs the
    /// user part of their hourly budget.
    pub fn submit(&mut self, user_id: i64, url: &str) -> Result<SubmitOutcome> {
        if !platform::validate(url) {
            return Ok(SubmitOutcome::InvalidUrl);
        }

        if !self
            .limiter
            .allow(&mut self.db, user_id, Utc::now())
            .context("rate-limit check")?
        {
            return Ok(SubmitOutcome::RateLimited);
        }

        let id = self
            .db
            .enqueue_task(user_id, url)
            .context("enqueueing task")?;
        info!("task {id}: queued {url} for user {user_id}");
        Ok(SubmitOutcome::Accepted(id))
    }

    /// Pull the oldest pending task and run it to a terminal outcome.
    ///
    /// Returns the processed task id, or `None` when the queue is empty. The
    /// single-worker invariant holds because this is only ever called from
    /// the one driver loop, and it does not return until the task has left
    /// `downloading`.
    pub async fn process_one(&mut self) -> Result<Option<i64>> {
        let Some(task) = self.db.next_pending_task()? else {
            return Ok(None);
        };

        self.db.mark_downloading(task.id)?;

        match self.executor.execute(&task.url, task.id).await {
            Ok(path) => {
                self.db
                    .mark_completed(task.id, &path.to_string_lossy())?;
                self.db.increment_downloads(task.user_id)?;
                info!("task {}: completed", task.id);
            }
            Err(err) => {
                self.db.mark_failed(task.id, &err.to_string())?;
                warn!("task {}: failed: {err}", task.id);
            }
        }

        Ok(Some(task.id))
    }

    /// Deliver up to [`FINALIZE_BATCH`] completed tasks, oldest first.
    ///
    /// Oversized artifacts get a size warning instead of the file; vanished
    /// artifacts get an expiry notice. Either way the task is marked `sent`
    /// after the delivery attempt; delivery failures are logged, never
    /// retried.
    pub async fn finalize_completed<G: MessagingGateway>(&mut self, gateway: &G) -> Result<usize> {
        let batch = self.db.completed_unsent(FINALIZE_BATCH)?;
        let mut finalized = 0;

        for task in batch {
            let path_str = task.file_path.clone().unwrap_or_default();
            let path = Path::new(&path_str);

            let attempt = match fs::metadata(path) {
                Ok(meta) if meta.len() > self.max_file_bytes => {
                    gateway
                        .send_text(
                            task.user_id,
                            &format!(
                                "Task #{}: the file came out larger than the {} MB limit, so it \
                                 can't be delivered and will be purged.",
                                task.id,
                                self.max_file_bytes / (1024 * 1024)
                            ),
                        )
                        .await
                }
                Ok(_) => gateway.send_file(task.user_id, path, &task.url).await,
                Err(_) => {
                    gateway
                        .send_text(
                            task.user_id,
                            &format!(
                                "Task #{}: the downloaded file is no longer available.",
                                task.id
                            ),
                        )
                        .await
                }
            };

            if let Err(e) = attempt {
                warn!("task {}: delivery failed: {e}", task.id);
            }
            self.db.mark_sent(task.id)?;
            finalized += 1;
        }

        Ok(finalized)
    }

    /// Notify up to [`FINALIZE_BATCH`] failed tasks, oldest first.
    pub async fn finalize_failed<G: MessagingGateway>(&mut self, gateway: &G) -> Result<usize> {
        let batch = self.db.failed_unnotified(FINALIZE_BATCH)?;
        let mut finalized = 0;

        for task in batch {
            let reason = task
                .error_message
                .as_deref()
                .unwrap_or("unknown error");
            let attempt = gateway
                .send_text(task.user_id, &format!("Task #{}: {reason}", task.id))
                .await;

            if let Err(e) = attempt {
                warn!("task {}: failure notice not delivered: {e}", task.id);
            }
            self.db.mark_notified(task.id)?;
            finalized += 1;
        }

        Ok(finalized)
    }

    // Aggregate helpers for reporting.

    pub fn count_by_status(&mut self, statuses: &[TaskStatus]) -> Result<u64> {
        Ok(self.db.count_by_status(statuses)?)
    }

    pub fn user_stat(&mut self, user_id: i64) -> Result<Option<UserStat>> {
        Ok(self.db.get_user_stat(user_id)?)
    }
}
