use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::batch::progress::watch_transfer;
use crate::db::{SettingKey, UserDataStore};
use crate::media::filename::{apply_rename_tag, default_file_name, sanitize, user_download_dir};
use crate::media::probe::{screenshot, video_metadata};
use crate::telegram::client::{
    ChatClient, InputSource, Media, OutboundMessage, Payload, TransferProgress,
};
use crate::telegram::resolver::ResolvedMessage;

/// Explicit override, then the rule-processed source caption, then nothing.
pub fn resolve_caption(
    override_caption: Option<String>,
    processed_source: Option<String>,
) -> Option<String> {
    override_caption
        .filter(|value| !value.trim().is_empty())
        .or_else(|| processed_source.filter(|value| !value.trim().is_empty()))
}

/// Deletes the listed files when dropped, whichever way the transfer ended.
struct LocalFiles(Vec<PathBuf>);

impl LocalFiles {
    fn track(&mut self, path: PathBuf) {
        self.0.push(path);
    }
}

impl Drop for LocalFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove {}: {err}", path.display()),
            }
        }
    }
}

struct ReuploadJob<'a> {
    client: Arc<dyn ChatClient>,
    resolved: &'a ResolvedMessage,
    media: &'a Media,
    destination: i64,
    status_id: i32,
    user_id: i64,
}

#[derive(Clone)]
pub struct TransferExecutor {
    store: Arc<dyn UserDataStore>,
    download_root: PathBuf,
    video_tools: bool,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn UserDataStore>, download_root: PathBuf, video_tools: bool) -> Self {
        TransferExecutor {
            store,
            download_root,
            video_tools,
        }
    }

    async fn setting(&self, user_id: i64, key: SettingKey) -> Option<String> {
        match self.store.get_user_data_key(user_id, key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read {} for user {user_id}: {err}", key.as_str());
                None
            }
        }
    }

    async fn final_caption(
        &self,
        user_id: i64,
        source_caption: Option<&str>,
        caption_override: Option<String>,
    ) -> Option<String> {
        let processed = match source_caption {
            Some(caption) => match self.store.process_text_with_rules(user_id, caption).await {
                Ok(processed) => Some(processed),
                Err(err) => {
                    warn!("Caption rules failed for user {user_id}: {err}");
                    Some(caption.to_string())
                }
            },
            None => None,
        };
        resolve_caption(caption_override, processed)
    }

    /// Relays one resolved message into `destination`. Never raises; returns
    /// whether something was sent.
    pub async fn transfer(
        &self,
        resolved: &ResolvedMessage,
        destination: i64,
        user_id: i64,
        caption_override: Option<String>,
    ) -> bool {
        let Some(media) = resolved.message.media.as_ref() else {
            debug!(
                "Message {}/{} has nothing to relay",
                resolved.message.chat_id, resolved.message.id
            );
            return false;
        };
        let has_override = caption_override
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        let caption = self
            .final_caption(user_id, resolved.message.caption.as_deref(), caption_override)
            .await;

        if media.is_rewritable_attachment() {
            let rename_tag = self.setting(user_id, SettingKey::RenameTag).await;
            if rename_tag.is_some() || has_override {
                match self
                    .reupload(resolved, media, destination, user_id, rename_tag.as_deref(), caption.clone())
                    .await
                {
                    Ok(()) => return true,
                    Err(err) => {
                        error!("Download/upload error for user {user_id}: {err}");
                    }
                }
            }
        }

        self.relay(resolved.via.as_ref(), media, destination, caption).await
    }

    async fn relay(
        &self,
        client: &dyn ChatClient,
        media: &Media,
        destination: i64,
        caption: Option<String>,
    ) -> bool {
        let outbound = OutboundMessage::new(Payload::relay(media), caption);
        match client.send_media(destination, outbound).await {
            Ok(()) => true,
            Err(err) => {
                error!("Error sending {} directly: {err}", media.kind_name());
                false
            }
        }
    }

    async fn reupload(
        &self,
        resolved: &ResolvedMessage,
        media: &Media,
        destination: i64,
        user_id: i64,
        rename_tag: Option<&str>,
        caption: Option<String>,
    ) -> Result<()> {
        let client = resolved.via.clone();
        let status_id = client.send_text(destination, "Downloading file...").await?;

        let job = ReuploadJob {
            client: client.clone(),
            resolved,
            media,
            destination,
            status_id,
            user_id,
        };
        let result = self.download_and_send(&job, rename_tag, caption).await;
        match &result {
            Ok(()) => {
                if let Err(err) = client.delete_message(destination, status_id).await {
                    debug!("Failed to delete status message: {err}");
                }
            }
            Err(err) => {
                let text = format!("Error: {err}");
                if let Err(edit_err) = client.edit_text(destination, status_id, &text).await {
                    debug!("Failed to report transfer error: {edit_err}");
                }
            }
        }
        result
    }

    async fn download_and_send(
        &self,
        job: &ReuploadJob<'_>,
        rename_tag: Option<&str>,
        caption: Option<String>,
    ) -> Result<()> {
        let ReuploadJob {
            client,
            resolved,
            media,
            destination,
            status_id,
            user_id,
        } = job;
        let (destination, status_id, user_id) = (*destination, *status_id, *user_id);
        let file_name = sanitize(&apply_rename_tag(
            &default_file_name(media, Utc::now().timestamp()),
            rename_tag,
        ));
        if file_name.is_empty() {
            return Err(anyhow!("Rename rule produced an empty file name"));
        }
        let dir = user_download_dir(&self.download_root, user_id);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&file_name);
        let mut local = LocalFiles(vec![target.clone()]);

        let (progress, receiver) = watch::channel(TransferProgress::default());
        let watcher = watch_transfer(client.clone(), destination, status_id, "Downloading...", receiver);
        let downloaded = client
            .download_media(&resolved.message, &target, Some(progress))
            .await;
        let _ = watcher.await;
        let downloaded = downloaded?;
        if downloaded != target {
            local.track(downloaded.clone());
        }
        info!("Downloaded {} for user {user_id}", downloaded.display());

        client.edit_text(destination, status_id, "Uploading file...").await?;
        let payload = self
            .upload_payload(media, &downloaded, &file_name, &dir, &mut local)
            .await;

        let (progress, receiver) = watch::channel(TransferProgress::default());
        let watcher = watch_transfer(client.clone(), destination, status_id, "Uploading...", receiver);
        let mut outbound = OutboundMessage::new(payload, caption);
        outbound.upload_progress = Some(progress);
        let sent = client.send_media(destination, outbound).await;
        let _ = watcher.await;
        sent?;
        Ok(())
    }

    async fn upload_payload(
        &self,
        media: &Media,
        path: &Path,
        file_name: &str,
        dir: &Path,
        local: &mut LocalFiles,
    ) -> Payload {
        let source = InputSource::Local(path.to_path_buf());
        match media {
            Media::Video {
                duration,
                width,
                height,
                ..
            } => {
                let (duration, width, height, thumb) = if self.video_tools {
                    let probed = video_metadata(path).await;
                    let duration = if probed.duration > 0 { probed.duration } else { *duration };
                    let thumb = match screenshot(path, duration, dir).await {
                        Ok(thumb) => {
                            local.track(thumb.clone());
                            Some(thumb)
                        }
                        Err(err) => {
                            warn!("Preview generation failed: {err}");
                            None
                        }
                    };
                    (
                        duration,
                        if probed.width > 0 { probed.width } else { *width },
                        if probed.height > 0 { probed.height } else { *height },
                        thumb,
                    )
                } else {
                    (*duration, *width, *height, None)
                };
                Payload::Video {
                    source,
                    duration,
                    width,
                    height,
                    thumb,
                }
            }
            Media::Audio {
                duration,
                performer,
                title,
                ..
            } => Payload::Audio {
                source,
                duration: *duration,
                performer: performer.clone(),
                title: title.clone(),
                thumb: None,
            },
            _ => Payload::Document {
                source,
                file_name: Some(file_name.to_string()),
                thumb: None,
            },
        }
    }
}
