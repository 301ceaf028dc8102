//! Polling driver.
//!
//! The single logical actor: each iteration runs one download, finalizes
//! completed and failed tasks, sweeps the download directory when due, then
//! long-polls the chat transport and dispatches inbound messages. The loop
//! catches and logs every failure; it never terminates.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::time::Instant;

use crate::manager::{SubmitOutcome, TaskManager};
use crate::models::TaskStatus;
use crate::platform;
use crate::sweeper;
use crate::telegram::{InboundMessage, MessagingGateway};

/// How often the retention sweeper runs (it also runs on the first tick).
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Pause after a failed iteration before retrying the loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

const HELP_TEXT: &str = "Send me a link from YouTube, TikTok, Instagram, Twitter/X, Facebook, \
    Reddit, Vimeo, Pinterest, Dailymotion or SoundCloud and I'll fetch the media for you. \
    /stats shows queue and usage numbers.";

pub struct PollingDriver<G: MessagingGateway> {
    manager: TaskManager,
    gateway: G,
    download_dir: PathBuf,
    retention: Duration,
    poll_delay: Duration,

    // Loop state, threaded through iterations rather than held globally.
    update_offset: i64,
    last_sweep: Option<Instant>,
}

impl<G: MessagingGateway> PollingDriver<G> {
    pub fn new(
        manager: TaskManager,
        gateway: G,
        download_dir: PathBuf,
        retention: Duration,
        poll_delay: Duration,
    ) -> Self {
        Self {
            manager,
            gateway,
            download_dir,
            retention,
            poll_delay,
            update_offset: 0,
            last_sweep: None,
        }
    }

    /// Run forever. Iteration failures are logged and followed by a short
    /// backoff; nothing escapes this loop.
    pub async fn run(&mut self) {
        info!("polling driver started");
        loop {
            if let Err(e) = self.tick().await {
                error!("iteration failed: {e:#}");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
            tokio::time::sleep(self.poll_delay).await;
        }
    }

    /// One iteration of the loop, in the fixed order the system is specified
    /// to run: execute → finalize → sweep → poll inbound → dispatch.
    pub async fn tick(&mut self) -> Result<()> {
        self.manager.process_one().await?;
        self.manager.finalize_completed(&self.gateway).await?;
        self.manager.finalize_failed(&self.gateway).await?;
        self.maybe_sweep();

        let updates = self
            .gateway
            .fetch_updates(self.update_offset)
            .await
            .context("fetching inbound events")?;

        for msg in updates {
            self.update_offset = self.update_offset.max(msg.update_id + 1);
            if msg.text.is_empty() {
                continue;
            }
            self.handle_message(&msg).await?;
        }

        Ok(())
    }

    fn maybe_sweep(&mut self) {
        let due = match self.last_sweep {
            None => true,
            Some(at) => at.elapsed() >= SWEEP_INTERVAL,
        };
        if !due {
            return;
        }

        // Sweep failures are logged, not fatal to the iteration.
        match sweeper::sweep(&self.download_dir, self.retention, SystemTime::now()) {
            Ok(stats) if stats.removed > 0 || stats.errors > 0 => {
                info!(
                    "sweep removed {} expired file(s), kept {}, {} error(s)",
                    stats.removed, stats.kept, stats.errors
                );
            }
            Ok(_) => {}
            Err(e) => warn!("sweep of {} failed: {e}", self.download_dir.display()),
        }
        self.last_sweep = Some(Instant::now());
    }

    async fn handle_message(&mut self, msg: &InboundMessage) -> Result<()> {
        let reply = if msg.text.starts_with('/') {
            self.handle_command(msg)?
        } else {
            self.handle_submission(msg)?
        };

        // Reply failures are logged-and-dropped; the inbound cursor has
        // already advanced, so the message is not reprocessed.
        if let Err(e) = self.gateway.send_text(msg.user_id, &reply).await {
            warn!("reply to user {} failed: {e}", msg.user_id);
        }
        Ok(())
    }

    fn handle_submission(&mut self, msg: &InboundMessage) -> Result<String> {
        let Some(url) = platform::extract_first_url(&msg.text) else {
            return Ok("I couldn't find a link in that message. Send a media URL, or /help."
                .to_string());
        };

        Ok(match self.manager.submit(msg.user_id, &url)? {
            SubmitOutcome::Accepted(id) => format!(
                "Queued as task #{id}. You'll get the file here once it's downloaded."
            ),
            SubmitOutcome::RateLimited => {
                "Hourly request limit reached. Try again after the top of the hour.".to_string()
            }
            SubmitOutcome::InvalidUrl => {
                "That link isn't from a supported platform. /help lists what I can fetch."
                    .to_string()
            }
        })
    }

    fn handle_command(&mut self, msg: &InboundMessage) -> Result<String> {
        let command = msg.text.split_whitespace().next().unwrap_or("");
        match command {
            "/start" | "/help" => Ok(HELP_TEXT.to_string()),
            "/stats" => self.stats_reply(msg.user_id),
            _ => Ok("Unknown command. Try /help.".to_string()),
        }
    }

    fn stats_reply(&mut self, user_id: i64) -> Result<String> {
        let pending = self.manager.count_by_status(&[TaskStatus::Pending])?;
        let active = self.manager.count_by_status(&[TaskStatus::Downloading])?;
        let awaiting = self
            .manager
            .count_by_status(&[TaskStatus::Completed, TaskStatus::Failed])?;
        let done = self
            .manager
            .count_by_status(&[TaskStatus::Sent, TaskStatus::Notified])?;

        let own = match self.manager.user_stat(user_id)? {
            Some(stat) => format!(
                "You: {} download(s) total, {} request(s) this hour.",
                stat.downloads_count, stat.requests_hour
            ),
            None => "You haven't requested anything yet.".to_string(),
        };

        Ok(format!(
            "Queue: {pending} pending, {active} downloading, {awaiting} awaiting delivery, \
             {done} finished. {own}"
        ))
    }
}
