use std::fs;

use anyhow::{Context, Result};
use log::{info, LevelFilter};

use clipbot::config::BotConfig;
use clipbot::db::Db;
use clipbot::driver::PollingDriver;
use clipbot::executor::{DownloadExecutor, ExecutorConfig};
use clipbot::manager::TaskManager;
use clipbot::rate_limit::RateLimiter;
use clipbot::telegram::TelegramGateway;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .init();

    let cfg = BotConfig::from_env().context("loading configuration")?;
    fs::create_dir_all(&cfg.download_dir)
        .with_context(|| format!("create download dir: {}", cfg.download_dir.display()))?;

    let db = Db::open(&cfg.data_dir.join("clipbot.sqlite3"))?;
    let executor = DownloadExecutor::new(ExecutorConfig {
        yt_dlp_path: cfg.yt_dlp_path.clone(),
        download_dir: cfg.download_dir.clone(),
        max_file_mb: cfg.max_file_mb,
        timeout: cfg.download_timeout,
        max_height: cfg.max_height,
    });

    let mut manager = TaskManager::new(
        db,
        RateLimiter::new(cfg.rate_limit_hourly),
        executor,
        cfg.max_file_mb,
    );
    manager.recover()?;

    let gateway = TelegramGateway::new(&cfg.bot_token, cfg.poll_timeout)?;
    let mut driver = PollingDriver::new(
        manager,
        gateway,
        cfg.download_dir.clone(),
        cfg.retention,
        cfg.poll_interval,
    );

    info!("clipbot starting (fetcher: {})", cfg.yt_dlp_path.display());
    driver.run().await;
    Ok(())
}
