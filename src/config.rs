use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub database_url: String,
    pub active_tasks_file: PathBuf,
    pub freemium_limit: usize,
    pub premium_limit: usize,
    pub relay_chat_id: i64,
    pub session_encryption_key: String,
    pub default_session: String,
    pub download_dir: PathBuf,
    pub ytdl_bin: String,
    pub yt_cookies: String,
    pub insta_cookies: String,
    pub batch_throttle_ms: u64,
    pub shutdown_grace_seconds: u64,
    pub owner_ids: Vec<i64>,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_id_list(name: &str) -> Vec<i64> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter_map(|value| match value.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid id '{}' in {}", value, name);
                None
            }
        })
        .collect()
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let relay_chat_id = env_i64("RELAY_CHAT_ID", 0);
        if relay_chat_id == 0 {
            warn!("RELAY_CHAT_ID is not set; the shared bot cannot fetch messages by link");
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://relay_bot.db?mode=rwc",
            )),
            active_tasks_file: PathBuf::from(env_string("ACTIVE_TASKS_FILE", "active_users.json")),
            freemium_limit: env_usize("FREEMIUM_LIMIT", 5),
            premium_limit: env_usize("PREMIUM_LIMIT", 500),
            relay_chat_id,
            session_encryption_key: env_string("SESSION_ENCRYPTION_KEY", ""),
            default_session: env_string("DEFAULT_SESSION", ""),
            download_dir: PathBuf::from(env_string("DOWNLOAD_DIR", "downloads")),
            ytdl_bin: env_string("YTDL_BIN", "yt-dlp"),
            yt_cookies: env_string("YT_COOKIES", ""),
            insta_cookies: env_string("INSTA_COOKIES", ""),
            batch_throttle_ms: env_u64("BATCH_THROTTLE_MS", 1000),
            shutdown_grace_seconds: env_u64("SHUTDOWN_GRACE_SECONDS", 10),
            owner_ids: env_id_list("OWNER_IDS"),
        })
    }

    pub fn batch_throttle(&self) -> Duration {
        Duration::from_millis(self.batch_throttle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}
