use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use teloxide::prelude::*;
use tracing::info;

use crate::batch::TaskStatus;
use crate::db::UserDataStore;
use crate::handlers::access::{check_owner_access, user_id_of};
use crate::handlers::batch::describe_task;
use crate::handlers::responses::reply_text;
use crate::state::AppState;

const HELP_TEXT: &str = "\
Relay commands

/batch - Start a batch extraction, then send t.me links one per line
/single <link> - Copy one message to this chat
/cancel or /stop - Cancel your batch or download
/status - Show your batch progress

/dl <url> - Download a video with yt-dlp
/adl <url> - Download audio as mp3

/set <key> <value> - Store a setting
/unset <key> - Remove a setting
/settings - List your settings

Setting keys:
bot_token - your own bot, used for chats the shared bot cannot read
session_string - a logged-in session for private chats
rename_tag - appended to re-uploaded file names
caption - caption used instead of the original
chat_id - send results to this chat instead
replacements - JSON object of words to replace in captions
delete_words - JSON array of words to strip from captions";

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    reply_text(
        &bot,
        &message,
        "Hello! Send /batch to copy messages from t.me links, or /help to see all commands.",
    )
    .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    reply_text(&bot, &message, HELP_TEXT).await?;
    Ok(())
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

async fn build_status_report(state: &AppState) -> String {
    let db_status = match state.db.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("error ({err})"),
    };
    let (bots, sessions) = state.pool.cached_counts();
    let tasks = state.batches.store().snapshot();
    let running = tasks
        .values()
        .filter(|task| task.status == TaskStatus::Processing)
        .count();
    let uptime = Utc::now() - state.started_at;

    let mut report = String::from("\n\nSystem\n");
    report.push_str(&format!("uptime: {}h {}m\n", uptime.num_hours(), uptime.num_minutes() % 60));
    report.push_str(&format!("db: {db_status}\n"));
    report.push_str(&format!("active_tasks: {} ({running} running)\n", tasks.len()));
    report.push_str(&format!("cached_clients: bots={bots} sessions={sessions}\n"));
    report.push_str(&format!(
        "tools: ffmpeg={} ffprobe={} yt-dlp={}\n",
        bool_label(state.tools.ffmpeg),
        bool_label(state.tools.ffprobe),
        bool_label(state.tools.ytdl)
    ));
    report
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let mut report = describe_task(&state, user_id);
    if state.ytdl.is_busy(user_id) {
        report.push_str("\nA download is in progress.");
    }
    if state.db.is_owner(user_id) {
        report.push_str(&build_status_report(&state).await);
    }
    reply_text(&bot, &message, report).await?;
    Ok(())
}

/// `<user_id> [days]`; no days means no expiry.
pub fn parse_grant_args(arg: &str) -> Option<(i64, Option<i64>)> {
    let mut parts = arg.split_whitespace();
    let user_id = parts.next()?.parse::<i64>().ok()?;
    let days = match parts.next() {
        Some(value) => Some(value.parse::<i64>().ok().filter(|days| *days > 0)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((user_id, days))
}

pub async fn add_premium_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: String,
) -> Result<()> {
    if !check_owner_access(&bot, &state.db, &message).await {
        return Ok(());
    }
    let Some((user_id, days)) = parse_grant_args(&arg) else {
        reply_text(&bot, &message, "Usage: /add <user_id> [days]").await?;
        return Ok(());
    };

    let expires_at = days.map(|days| Utc::now() + ChronoDuration::days(days));
    state.db.grant_premium(user_id, expires_at).await?;
    info!("Granted premium to {user_id} until {:?}", expires_at);

    let reply = match expires_at {
        Some(at) => format!(
            "User {user_id} is premium until {}.",
            at.format("%Y-%m-%d %H:%M UTC")
        ),
        None => format!("User {user_id} is premium with no expiry."),
    };
    reply_text(&bot, &message, reply).await?;
    Ok(())
}

pub async fn remove_premium_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: String,
) -> Result<()> {
    if !check_owner_access(&bot, &state.db, &message).await {
        return Ok(());
    }
    let Ok(user_id) = arg.trim().parse::<i64>() else {
        reply_text(&bot, &message, "Usage: /rem <user_id>").await?;
        return Ok(());
    };

    let reply = if state.db.revoke_premium(user_id).await? {
        info!("Revoked premium from {user_id}");
        format!("User {user_id} is no longer premium.")
    } else if state.db.is_premium_user(user_id).await? {
        format!("User {user_id} is an owner and always premium.")
    } else {
        format!("User {user_id} was not premium.")
    };
    reply_text(&bot, &message, reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_args_accept_optional_days() {
        assert_eq!(parse_grant_args("42"), Some((42, None)));
        assert_eq!(parse_grant_args(" 42  30 "), Some((42, Some(30))));
        assert_eq!(parse_grant_args("42 0"), None);
        assert_eq!(parse_grant_args("42 x"), None);
        assert_eq!(parse_grant_args("abc"), None);
        assert_eq!(parse_grant_args("42 30 extra"), None);
        assert_eq!(parse_grant_args(""), None);
    }
}
