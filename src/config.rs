use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use log::warn;

/// Startup configuration, read once from the environment (plus `.env` via
/// dotenvy in `main`). Static for the process lifetime.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram bot token. The only knob without a default.
    pub bot_token: String,

    /// Accepted requests per user per wall-clock hour bucket.
    pub rate_limit_hourly: u32,
    /// Delivery size ceiling, in megabytes. Also passed to the fetch process.
    pub max_file_mb: u64,
    /// Wall-clock budget for one download.
    pub download_timeout: Duration,
    /// Files older than this are swept from the download directory.
    pub retention: Duration,
    /// Fixed inter-iteration delay of the polling loop.
    pub poll_interval: Duration,
    /// Server-side long-poll window for inbound events.
    pub poll_timeout: Duration,
    /// Resolution ceiling passed to the fetch process.
    pub max_height: u32,

    /// Where the task store lives.
    pub data_dir: PathBuf,
    /// Where downloaded artifacts land (and get swept).
    pub download_dir: PathBuf,
    /// The external fetch binary.
    pub yt_dlp_path: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        let bot_token =
            env::var("CLIPBOT_BOT_TOKEN").context("CLIPBOT_BOT_TOKEN must be set")?;

        let data_dir = match env::var("CLIPBOT_DATA_DIR").ok() {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let download_dir = match env::var("CLIPBOT_DOWNLOAD_DIR").ok() {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.join("downloads"),
        };

        Ok(Self {
            bot_token,
            rate_limit_hourly: parse_or(
                env::var("CLIPBOT_RATE_LIMIT_HOURLY").ok(),
                "CLIPBOT_RATE_LIMIT_HOURLY",
                10,
            )?,
            max_file_mb: parse_or(
                env::var("CLIPBOT_MAX_FILE_MB").ok(),
                "CLIPBOT_MAX_FILE_MB",
                50,
            )?,
            download_timeout: Duration::from_secs(parse_or(
                env::var("CLIPBOT_DOWNLOAD_TIMEOUT_SECS").ok(),
                "CLIPBOT_DOWNLOAD_TIMEOUT_SECS",
                300,
            )?),
            retention: Duration::from_secs(
                86_400
                    * parse_or(
                        env::var("CLIPBOT_RETENTION_DAYS").ok(),
                        "CLIPBOT_RETENTION_DAYS",
                        3u64,
                    )?,
            ),
            poll_interval: Duration::from_secs(parse_or(
                env::var("CLIPBOT_POLL_INTERVAL_SECS").ok(),
                "CLIPBOT_POLL_INTERVAL_SECS",
                2,
            )?),
            poll_timeout: Duration::from_secs(parse_or(
                env::var("CLIPBOT_LONG_POLL_SECS").ok(),
                "CLIPBOT_LONG_POLL_SECS",
                25,
            )?),
            max_height: parse_or(
                env::var("CLIPBOT_MAX_HEIGHT").ok(),
                "CLIPBOT_MAX_HEIGHT",
                1080,
            )?,
            data_dir,
            download_dir,
            yt_dlp_path: resolve_yt_dlp(env::var("CLIPBOT_YT_DLP_PATH").ok()),
        })
    }
}

/// Per-user state directory, e.g. `~/.local/share/clipbot` on Linux.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "clipbot", "Clipbot")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Explicit override wins; otherwise search PATH, falling back to the bare
/// name so a later spawn error names the missing binary.
fn resolve_yt_dlp(explicit: Option<String>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    match which::which("yt-dlp") {
        Ok(path) => path,
        Err(_) => {
            warn!("yt-dlp not found on PATH; relying on spawn-time lookup");
            PathBuf::from("yt-dlp")
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|e| anyhow!("invalid value for {key}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_fall_back_to_defaults() {
        assert_eq!(parse_or::<u32>(None, "X", 10).unwrap(), 10);
        assert_eq!(parse_or::<u64>(None, "X", 50).unwrap(), 50);
    }

    #[test]
    fn present_values_are_parsed() {
        assert_eq!(
            parse_or::<u32>(Some("25".to_string()), "X", 10).unwrap(),
            25
        );
    }

    #[test]
    fn garbage_values_name_the_offending_key() {
        let err = parse_or::<u32>(Some("lots".to_string()), "CLIPBOT_RATE_LIMIT_HOURLY", 10)
            .unwrap_err();
        assert!(err.to_string().contains("CLIPBOT_RATE_LIMIT_HOURLY"));
    }

    #[test]
    fn explicit_fetcher_path_wins() {
        assert_eq!(
            resolve_yt_dlp(Some("/opt/yt-dlp".to_string())),
            PathBuf::from("/opt/yt-dlp")
        );
    }
}
