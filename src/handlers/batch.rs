use anyhow::Result;
use teloxide::prelude::*;
use tracing::{error, info};

use crate::batch::progress;
use crate::batch::{CancelOutcome, StartOutcome, SubmitError, TaskStatus};
use crate::handlers::access::user_id_of;
use crate::handlers::responses::{reply_text, update_status};
use crate::state::AppState;
use crate::utils::timing::{complete_command_timer, start_command_timer};

pub async fn batch_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("batch", &message);
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };

    let (reply, outcome) = match state.batches.start(user_id, message.chat.id.0).await {
        StartOutcome::Started { limit, is_premium } => {
            (progress::batch_prompt(is_premium, limit), "success")
        }
        StartOutcome::AlreadyActive => (
            "You already have an active batch. Use /cancel or /stop first.".to_string(),
            "already_active",
        ),
        StartOutcome::PremiumOnly => (
            "Batch extraction is available to premium users only.".to_string(),
            "premium_only",
        ),
    };
    reply_text(&bot, &message, reply).await?;
    complete_command_timer(&mut timer, outcome, None);
    Ok(())
}

/// Plain text from a user whose batch is waiting for links.
pub async fn links_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    if !state.batches.is_waiting_for_links(user_id) {
        return Ok(());
    }
    let text = message.text().unwrap_or_default();

    let links = match state.batches.submit_links(user_id, text) {
        Ok(links) => links,
        Err(SubmitError::NotWaiting) => return Ok(()),
        Err(err) => {
            reply_text(&bot, &message, err.to_string()).await?;
            return Ok(());
        }
    };
    info!("User {user_id} submitted {} links", links.len());

    let status = match reply_text(&bot, &message, progress::batch_started(links.len())).await {
        Ok(status) => status,
        Err(err) => {
            state.batches.store().remove(user_id);
            return Err(err);
        }
    };

    let chat_id = message.chat.id.0;
    let task_state = state.clone();
    state.tracker.spawn(async move {
        task_state
            .batches
            .execute(
                user_id,
                chat_id,
                status.id.0,
                task_state.processor.as_ref(),
                task_state.reporter.as_ref(),
            )
            .await;
    });
    Ok(())
}

pub async fn cancel_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let batch = state.batches.request_cancel(user_id);
    let download = state.ytdl.cancel_user(user_id);

    let reply = match (batch, download) {
        (CancelOutcome::Requested, _) => {
            "Cancellation requested. The batch stops after the current link."
        }
        (CancelOutcome::Removed, _) => "Batch cancelled.",
        (CancelOutcome::NotFound, true) => "Download cancelled.",
        (CancelOutcome::NotFound, false) => "No active batch or download to cancel.",
    };
    reply_text(&bot, &message, reply).await?;
    Ok(())
}

pub async fn single_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    link: Option<String>,
) -> Result<()> {
    let mut timer = start_command_timer("single", &message);
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let Some(link) = link else {
        reply_text(&bot, &message, "Usage: /single <t.me link>").await?;
        complete_command_timer(&mut timer, "usage", None);
        return Ok(());
    };

    let status = reply_text(&bot, &message, "Processing link...").await?;
    match state
        .processor
        .relay_link(user_id, message.chat.id.0, link.trim())
        .await
    {
        Ok(true) => {
            update_status(&bot, &status, "Done.").await;
            complete_command_timer(&mut timer, "success", None);
        }
        Ok(false) => {
            update_status(&bot, &status, "Could not fetch or send that message.").await;
            complete_command_timer(&mut timer, "failed", None);
        }
        Err(err) => {
            error!("single link failed for user {user_id}: {err}");
            update_status(&bot, &status, &format!("Error: {err}")).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
        }
    }
    Ok(())
}

pub fn describe_task(state: &AppState, user_id: i64) -> String {
    let Some(task) = state.batches.task(user_id) else {
        return "No active batch.".to_string();
    };
    match task.status {
        TaskStatus::WaitingForLinks => format!(
            "Batch status: {}\nLimit: {} links\nStarted: {}",
            task.status.label(),
            task.limit,
            task.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        _ => format!(
            "Batch status: {}{}\nProgress: {}/{}\nSuccess: {}\nFailed: {}\nStarted: {}",
            task.status.label(),
            if task.cancel_requested {
                " (stopping)"
            } else {
                ""
            },
            task.current,
            task.total,
            task.success,
            task.failed(),
            task.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        ),
    }
}
