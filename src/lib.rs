//! Clipbot: a chat-bot front end for a single-worker media download queue.
//!
//! One polling loop drives everything: it executes at most one download at a
//! time through an external yt-dlp process, records task outcomes in SQLite,
//! delivers results back to requesters, and enforces per-user hourly rate
//! limits plus a disk retention window.

pub mod config;
pub mod db;
pub mod driver;
pub mod executor;
pub mod manager;
pub mod models;
pub mod platform;
pub mod rate_limit;
pub mod sweeper;
pub mod telegram;
