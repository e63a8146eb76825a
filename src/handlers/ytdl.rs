use std::path::{Path, PathBuf};

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::batch::progress::watch_transfer;
use crate::handlers::access::user_id_of;
use crate::handlers::responses::{reply_text, update_status};
use crate::media::probe::screenshot;
use crate::media::ytdl::{build_caption, fetch_thumbnail, Downloaded, TempFile, YtdlError, YtdlMode};
use crate::state::AppState;
use crate::telegram::client::{InputSource, OutboundMessage, Payload, TransferProgress};
use crate::utils::telegram::start_chat_action_heartbeat;
use crate::utils::timing::{complete_command_timer, start_command_timer};

fn command_name(mode: YtdlMode) -> &'static str {
    match mode {
        YtdlMode::Video => "dl",
        YtdlMode::Audio => "adl",
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    path.with_file_name(format!("{stem}{suffix}"))
}

/// Builds the upload for a finished extraction, registering any preview it creates.
async fn upload_payload(
    state: &AppState,
    downloaded: &Downloaded,
    mode: YtdlMode,
    cleanup: &mut Vec<TempFile>,
) -> Payload {
    let Downloaded { path, info } = downloaded;
    let source = InputSource::Local(path.clone());
    match mode {
        YtdlMode::Video => {
            let duration = info.duration_secs();
            let thumb = if state.tools.ffmpeg && duration > 0 {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                match screenshot(path, duration, dir).await {
                    Ok(thumb) => {
                        cleanup.push(TempFile(thumb.clone()));
                        Some(thumb)
                    }
                    Err(err) => {
                        warn!("Preview frame failed: {err}");
                        None
                    }
                }
            } else {
                None
            };
            Payload::Video {
                source,
                duration,
                width: info.width.unwrap_or(0),
                height: info.height.unwrap_or(0),
                thumb,
            }
        }
        YtdlMode::Audio => {
            let thumb = match info.thumbnail.as_deref() {
                Some(url) => {
                    let fetched = fetch_thumbnail(url, &sibling(path, "_thumb.jpg")).await;
                    if let Some(thumb) = &fetched {
                        cleanup.push(TempFile(thumb.clone()));
                    }
                    fetched
                }
                None => None,
            };
            Payload::Audio {
                source,
                duration: info.duration_secs(),
                performer: None,
                title: info.title.clone(),
                thumb,
            }
        }
    }
}

/// `/dl` and `/adl`: fetch an external URL with yt-dlp and upload the result here.
pub async fn ytdl_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    url: Option<String>,
    mode: YtdlMode,
) -> Result<()> {
    let command = command_name(mode);
    let mut timer = start_command_timer(command, &message);
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    if !state.tools.ytdl {
        reply_text(&bot, &message, "Downloads are not available on this server.").await?;
        complete_command_timer(&mut timer, "unavailable", None);
        return Ok(());
    }
    let Some(url) = url.map(|value| value.trim().to_string()) else {
        reply_text(&bot, &message, format!("Usage: /{command} <url>")).await?;
        complete_command_timer(&mut timer, "usage", None);
        return Ok(());
    };

    let slot = match state.ytdl.begin(user_id, &state.shutdown) {
        Ok(slot) => slot,
        Err(YtdlError::Busy) => {
            reply_text(
                &bot,
                &message,
                "You already have a download in progress. Use /cancel to stop it.",
            )
            .await?;
            complete_command_timer(&mut timer, "busy", None);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let status = reply_text(&bot, &message, "Extracting...").await?;
    let action = match mode {
        YtdlMode::Video => ChatAction::UploadVideo,
        YtdlMode::Audio => ChatAction::UploadVoice,
    };
    let _heartbeat =
        start_chat_action_heartbeat(bot.clone(), message.chat.id, action, slot.token().clone());

    let downloaded = match state.ytdl.download(&slot, &url, mode).await {
        Ok(downloaded) => downloaded,
        Err(YtdlError::Cancelled) => {
            update_status(&bot, &status, "Download cancelled.").await;
            complete_command_timer(&mut timer, "cancelled", None);
            return Ok(());
        }
        Err(err) => {
            error!("{command} failed for user {user_id}: {err}");
            update_status(&bot, &status, &format!("Error: {err}")).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };
    let mut cleanup = vec![TempFile(downloaded.path.clone())];

    let size = tokio::fs::metadata(&downloaded.path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    info!(
        "{command} for user {user_id} produced {} ({size} bytes)",
        downloaded.path.display()
    );
    let caption = build_caption(&downloaded.info, size, mode);
    update_status(&bot, &status, "Uploading...").await;
    let payload = upload_payload(&state, &downloaded, mode, &mut cleanup).await;

    let client = state.pool.default_bot();
    let chat_id = message.chat.id.0;
    let (progress, receiver) = watch::channel(TransferProgress::default());
    let watcher = watch_transfer(client.clone(), chat_id, status.id.0, "Uploading...", receiver);
    let mut outbound = OutboundMessage::new(payload, Some(caption));
    outbound.reply_to = Some(message.id.0);
    outbound.upload_progress = Some(progress);

    let sent = tokio::select! {
        sent = client.send_media(chat_id, outbound) => Some(sent),
        _ = slot.token().cancelled() => None,
    };
    let _ = watcher.await;
    match sent {
        Some(Ok(())) => {
            if let Err(err) = bot.delete_message(status.chat.id, status.id).await {
                warn!("Failed to delete status message: {err}");
            }
            complete_command_timer(&mut timer, "success", None);
        }
        Some(Err(err)) => {
            error!("{command} upload failed for user {user_id}: {err}");
            update_status(&bot, &status, &format!("Upload failed: {err}")).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
        }
        None => {
            update_status(&bot, &status, "Download cancelled.").await;
            complete_command_timer(&mut timer, "cancelled", None);
        }
    }
    drop(cleanup);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnails_sit_next_to_the_download() {
        let path = Path::new("/tmp/ytdl_1_abc.mp3");
        assert_eq!(sibling(path, "_thumb.jpg"), PathBuf::from("/tmp/ytdl_1_abc_thumb.jpg"));
    }
}
