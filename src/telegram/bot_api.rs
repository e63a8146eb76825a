use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::StreamExt;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, FileMeta, InputFile, MessageId, Recipient, ReplyParameters};
use teloxide::{ApiError, RequestError};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tracing::{debug, info};

use crate::telegram::client::{
    ChatClient, ChatRef, ClientError, ClientFactory, FileRef, InputSource, Media, OutboundMessage,
    Payload, Peer, ProgressSender, SourceMessage, TransferProgress,
};

impl From<RequestError> for ClientError {
    fn from(err: RequestError) -> Self {
        ClientError::Api(err.to_string())
    }
}

fn recipient(chat: &ChatRef) -> Recipient {
    match chat {
        ChatRef::Id(id) => Recipient::Id(ChatId(*id)),
        ChatRef::Username(name) => Recipient::ChannelUsername(format!("@{name}")),
    }
}

fn file_ref(meta: &FileMeta) -> FileRef {
    FileRef {
        file_id: meta.id.0.clone(),
        file_size: u64::from(meta.size),
    }
}

fn message_not_found(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Api(ApiError::MessageToForwardNotFound | ApiError::MessageIdInvalid)
    )
}

/// Maps a Bot API message onto the relay's media model.
pub fn convert_message(message: &Message, chat_id: i64, id: i32) -> SourceMessage {
    let media = if let Some(video) = message.video() {
        Some(Media::Video {
            file: file_ref(&video.file),
            duration: video.duration.seconds(),
            width: video.width,
            height: video.height,
            file_name: video.file_name.clone(),
        })
    } else if let Some(note) = message.video_note() {
        Some(Media::VideoNote {
            file: file_ref(&note.file),
            duration: note.duration.seconds(),
            length: note.length,
        })
    } else if let Some(animation) = message.animation() {
        Some(Media::Animation {
            file: file_ref(&animation.file),
            duration: animation.duration.seconds(),
            width: animation.width,
            height: animation.height,
        })
    } else if let Some(sticker) = message.sticker() {
        Some(Media::Sticker {
            file: file_ref(&sticker.file),
        })
    } else if let Some(document) = message.document() {
        Some(Media::Document {
            file: file_ref(&document.file),
            file_name: document.file_name.clone(),
        })
    } else if let Some(audio) = message.audio() {
        Some(Media::Audio {
            file: file_ref(&audio.file),
            duration: audio.duration.seconds(),
            performer: audio.performer.clone(),
            title: audio.title.clone(),
            file_name: audio.file_name.clone(),
        })
    } else if let Some(voice) = message.voice() {
        Some(Media::Voice {
            file: file_ref(&voice.file),
            duration: voice.duration.seconds(),
        })
    } else if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        Some(Media::Photo {
            file: file_ref(&photo.file),
        })
    } else {
        message.text().map(|text| Media::Text {
            text: text.to_string(),
        })
    };

    SourceMessage {
        chat_id,
        id,
        caption: message.caption().map(|value| value.to_string()),
        empty: media.is_none(),
        media,
    }
}

/// Counts bytes as they are read so uploads can report progress.
struct ProgressReader<R> {
    inner: R,
    done: u64,
    total: u64,
    progress: ProgressSender,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                self.done += read;
                let update = TransferProgress {
                    done: self.done,
                    total: self.total,
                };
                let _ = self.progress.send(update);
            }
        }
        poll
    }
}

async fn input_file(
    source: &InputSource,
    progress: Option<&ProgressSender>,
) -> Result<InputFile, ClientError> {
    match source {
        InputSource::Remote(file_id) => Ok(InputFile::file_id(FileId(file_id.clone()))),
        InputSource::Local(path) => {
            let Some(progress) = progress else {
                return Ok(InputFile::file(path.clone()));
            };
            let file = tokio::fs::File::open(path).await?;
            let total = file.metadata().await?.len();
            let name = path
                .file_name()
                .map(|value| value.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let reader = ProgressReader {
                inner: file,
                done: 0,
                total,
                progress: progress.clone(),
            };
            Ok(InputFile::read(reader).file_name(name))
        }
    }
}

fn thumbnail(path: &Option<PathBuf>) -> Option<InputFile> {
    path.as_ref()
        .filter(|value| value.exists())
        .map(|value| InputFile::file(value.clone()))
}

/// Bot API backed client. Used for the shared bot and for users' own bots.
pub struct BotApiClient {
    bot: Bot,
    label: String,
    relay_chat_id: i64,
}

impl BotApiClient {
    pub fn new(bot: Bot, label: impl Into<String>, relay_chat_id: i64) -> Self {
        BotApiClient {
            bot,
            label: label.into(),
            relay_chat_id,
        }
    }
}

#[async_trait]
impl ChatClient for BotApiClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn get_message(
        &self,
        chat: &ChatRef,
        message_id: i32,
    ) -> Result<SourceMessage, ClientError> {
        if self.relay_chat_id == 0 {
            return Err(ClientError::Unsupported(
                "message fetch needs RELAY_CHAT_ID".to_string(),
            ));
        }
        let source_chat_id = match chat {
            ChatRef::Id(id) => *id,
            ChatRef::Username(_) => 0,
        };

        let forwarded = match self
            .bot
            .forward_message(ChatId(self.relay_chat_id), recipient(chat), MessageId(message_id))
            .await
        {
            Ok(forwarded) => forwarded,
            Err(err) if message_not_found(&err) => {
                debug!("{}: {chat}/{message_id} is empty: {err}", self.label);
                return Ok(SourceMessage::empty(source_chat_id, message_id));
            }
            Err(err) => return Err(err.into()),
        };

        let converted = convert_message(&forwarded, source_chat_id, message_id);
        if let Err(err) = self
            .bot
            .delete_message(forwarded.chat.id, forwarded.id)
            .await
        {
            debug!("{}: failed to delete relay copy: {err}", self.label);
        }
        Ok(converted)
    }

    async fn join_chat(&self, chat: &ChatRef) -> Result<(), ClientError> {
        Err(ClientError::Unsupported(format!(
            "bots cannot join {chat} on their own"
        )))
    }

    async fn get_chat(&self, chat: &ChatRef) -> Result<i64, ClientError> {
        let info = self.bot.get_chat(recipient(chat)).await?;
        Ok(info.id.0)
    }

    async fn resolve_peer(&self, chat: &ChatRef) -> Result<Peer, ClientError> {
        let chat_id = self.get_chat(chat).await?;
        Ok(Peer::from_bot_api_id(chat_id))
    }

    async fn warm_dialogs(&self, _limit: usize) -> Result<(), ClientError> {
        Ok(())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i32, ClientError> {
        let message = self.bot.send_message(ChatId(chat_id), text.to_string()).await?;
        Ok(message.id.0)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
    ) -> Result<(), ClientError> {
        self.bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text.to_string())
            .await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), ClientError> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await?;
        Ok(())
    }

    async fn send_media(&self, chat_id: i64, message: OutboundMessage) -> Result<(), ClientError> {
        let chat = ChatId(chat_id);
        let reply = message
            .reply_to
            .map(|id| ReplyParameters::new(MessageId(id)));
        let caption = if message.payload.accepts_caption() {
            message.caption.clone()
        } else {
            None
        };
        let progress = message.upload_progress.as_ref();

        match &message.payload {
            Payload::Video {
                source,
                duration,
                width,
                height,
                thumb,
            } => {
                let mut request = self
                    .bot
                    .send_video(chat, input_file(source, progress).await?)
                    .duration(*duration)
                    .width(*width)
                    .height(*height)
                    .supports_streaming(true);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(thumb) = thumbnail(thumb) {
                    request = request.thumbnail(thumb);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::VideoNote {
                source,
                duration,
                length,
            } => {
                let mut request = self
                    .bot
                    .send_video_note(chat, input_file(source, progress).await?)
                    .duration(*duration)
                    .length(*length);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Animation {
                source,
                duration,
                width,
                height,
            } => {
                let mut request = self
                    .bot
                    .send_animation(chat, input_file(source, progress).await?)
                    .duration(*duration)
                    .width(*width)
                    .height(*height);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Sticker { source } => {
                let mut request = self
                    .bot
                    .send_sticker(chat, input_file(source, progress).await?);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Document {
                source,
                file_name,
                thumb,
            } => {
                let mut input = input_file(source, progress).await?;
                if let Some(name) = file_name {
                    input = input.file_name(name.clone());
                }
                let mut request = self.bot.send_document(chat, input);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(thumb) = thumbnail(thumb) {
                    request = request.thumbnail(thumb);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Audio {
                source,
                duration,
                performer,
                title,
                thumb,
            } => {
                let mut request = self
                    .bot
                    .send_audio(chat, input_file(source, progress).await?)
                    .duration(*duration);
                if let Some(performer) = performer {
                    request = request.performer(performer.clone());
                }
                if let Some(title) = title {
                    request = request.title(title.clone());
                }
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(thumb) = thumbnail(thumb) {
                    request = request.thumbnail(thumb);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Voice { source, duration } => {
                let mut request = self
                    .bot
                    .send_voice(chat, input_file(source, progress).await?)
                    .duration(*duration);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Photo { source } => {
                let mut request = self
                    .bot
                    .send_photo(chat, input_file(source, progress).await?);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
            Payload::Text { text } => {
                let body = message.caption.clone().unwrap_or_else(|| text.clone());
                let mut request = self.bot.send_message(chat, body);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                request.await?;
            }
        }
        Ok(())
    }

    async fn download_media(
        &self,
        message: &SourceMessage,
        destination: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<PathBuf, ClientError> {
        let file = message
            .media
            .as_ref()
            .and_then(|media| media.file())
            .ok_or(ClientError::NoMedia)?;
        let remote = self.bot.get_file(FileId(file.file_id.clone())).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut output = tokio::fs::File::create(destination).await?;
        let mut stream = self.bot.download_file_stream(&remote.path);
        let mut done: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ClientError::Api(err.to_string()))?;
            output.write_all(&chunk).await?;
            done += chunk.len() as u64;
            if let Some(progress) = &progress {
                let _ = progress.send(TransferProgress {
                    done,
                    total: file.file_size.max(done),
                });
            }
        }
        output.flush().await?;
        Ok(destination.to_path_buf())
    }

    async fn stop(&self) {
        debug!("{}: Bot API client holds no connection to close", self.label);
    }
}

/// Starts clients for users' own credentials.
pub struct BotApiFactory {
    relay_chat_id: i64,
}

impl BotApiFactory {
    pub fn new(relay_chat_id: i64) -> Self {
        BotApiFactory { relay_chat_id }
    }
}

#[async_trait]
impl ClientFactory for BotApiFactory {
    async fn start_bot(
        &self,
        user_id: i64,
        token: &str,
    ) -> Result<Arc<dyn ChatClient>, ClientError> {
        let bot = Bot::new(token.to_string());
        let me = bot.get_me().await?;
        info!("Started delegate bot @{} for user {user_id}", me.username());
        Ok(Arc::new(BotApiClient::new(
            bot,
            format!("user_{user_id}_bot"),
            self.relay_chat_id,
        )))
    }

    async fn start_session(
        &self,
        user_id: i64,
        _session: &str,
    ) -> Result<Arc<dyn ChatClient>, ClientError> {
        Err(ClientError::Unsupported(format!(
            "user {user_id}: session logins need an MTProto client factory"
        )))
    }
}
