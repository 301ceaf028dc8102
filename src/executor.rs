use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

/// Bound log capture to avoid unbounded memory use.
const MAX_CAPTURE_LINES: usize = 500;

/// How the external fetch process is run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Absolute path to the `yt-dlp` binary.
    pub yt_dlp_path: PathBuf,
    /// Directory downloaded artifacts are written to.
    pub download_dir: PathBuf,
    /// Maximum file size passed to the fetch process, in megabytes.
    pub max_file_mb: u64,
    /// Wall-clock budget for one download.
    pub timeout: Duration,
    /// Resolution ceiling (pixels of height) for format selection.
    pub max_height: u32,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("download timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Non-zero exit. The message is a condensed user-facing reason; the raw
    /// diagnostic tail went to the log.
    #[error("{0}")]
    ProcessFailed(String),

    #[error("fetch process finished but produced no file at {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("failed to run fetch process: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the external fetch process, one task at a time.
///
/// The caller guarantees serialization; `execute` is never re-entered while a
/// download is in flight.
#[derive(Debug, Clone)]
pub struct DownloadExecutor {
    cfg: ExecutorConfig,
}

impl DownloadExecutor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self { cfg }
    }

    /// Fetch `url` into a file whose name derives from the task id and the
    /// current time. Returns the path the process actually wrote.
    pub async fn execute(&self, url: &str, task_id: i64) -> Result<PathBuf, ExecError> {
        let out_path = self
            .cfg
            .download_dir
            .join(format!("task_{}_{}.mp4", task_id, Utc::now().timestamp()));

        let height = self.cfg.max_height;
        let args = vec![
            "-f".to_string(),
            format!("bv*[height<={height}]+ba/b[height<={height}]"),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--no-playlist".to_string(),
            "--max-filesize".to_string(),
            format!("{}M", self.cfg.max_file_mb),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "-o".to_string(),
            out_path.to_string_lossy().to_string(),
            url.to_string(),
        ];

        info!("task {task_id}: starting fetch of {url}");
        debug!("task {task_id}: fetch args: {args:?}");

        let mut cmd = Command::new(&self.cfg.yt_dlp_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let deadline = Instant::now() + self.cfg.timeout;
        let mut captured: Vec<String> = Vec::new();

        // Drain both streams until they close, bounded by the wall clock.
        // Capture is shared between streams; ordering between them is
        // best-effort and only used for diagnostics.
        let read_task = async {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_reader.next_line(), if stdout_open => match line {
                        Ok(Some(l)) => {
                            if captured.len() < MAX_CAPTURE_LINES {
                                captured.push(l);
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(_) => stdout_open = false,
                    },
                    line = stderr_reader.next_line(), if stderr_open => match line {
                        Ok(Some(l)) => {
                            if captured.len() < MAX_CAPTURE_LINES {
                                captured.push(l);
                            }
                        }
                        Ok(None) => stderr_open = false,
                        Err(_) => stderr_open = false,
                    },
                }
            }
        };

        if tokio::time::timeout_at(deadline, read_task).await.is_err() {
            warn!("task {task_id}: fetch exceeded {:?}, killing", self.cfg.timeout);
            let _ = child.kill().await;
            return Err(ExecError::Timeout(self.cfg.timeout));
        }

        // Streams are closed; the process should exit promptly. Keep the same
        // deadline so a process that lingers after closing its pipes is still
        // bounded.
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("task {task_id}: fetch hung after closing pipes, killing");
                let _ = child.kill().await;
                return Err(ExecError::Timeout(self.cfg.timeout));
            }
        };

        if !status.success() {
            let diagnostics = captured.join("\n");
            warn!(
                "task {task_id}: fetch exited with {:?}; tail:\n{}",
                status.code(),
                tail(&diagnostics, 20)
            );
            return Err(ExecError::ProcessFailed(summarize_failure(&diagnostics)));
        }

        if !out_path.exists() {
            return Err(ExecError::OutputMissing(out_path));
        }

        info!("task {task_id}: fetch finished at {}", out_path.display());
        Ok(out_path)
    }
}

fn tail(s: &str, lines: usize) -> String {
    let all: Vec<&str> = s.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Condense fetch-process diagnostics into a short user-facing reason.
pub fn summarize_failure(diagnostics: &str) -> String {
    let lowered = diagnostics.to_lowercase();

    if lowered.contains("sign in")
        || lowered.contains("login")
        || lowered.contains("cookies")
        || lowered.contains("age-restricted")
    {
        return "This content requires sign-in and cannot be fetched.".to_string();
    }

    if lowered.contains("not available in your country")
        || lowered.contains("geo restricted")
        || lowered.contains("geo-restricted")
    {
        return "This content is not available in the bot's region.".to_string();
    }

    if lowered.contains("unsupported url") || lowered.contains("no video formats") {
        return "The platform rejected this URL (unsupported or removed content).".to_string();
    }

    if lowered.contains("max-filesize") || lowered.contains("file is larger") {
        return "The media exceeds the configured size limit.".to_string();
    }

    if lowered.contains("network")
        || lowered.contains("connection")
        || lowered.contains("timed out")
    {
        return "A network error occurred while fetching. Try again later.".to_string();
    }

    let last = diagnostics
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown error");
    if last.len() > 200 {
        format!("Download failed: {}…", &last[..200])
    } else {
        format!("Download failed: {}", last)
    }
}
