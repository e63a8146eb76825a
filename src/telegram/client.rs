use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Telegram API error: {0}")]
    Api(String),

    #[error("Not supported by this client: {0}")]
    Unsupported(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message has no downloadable media")]
    NoMedia,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat reference as it appears in a link: a public username or a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatRef {
    Username(String),
    Id(i64),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Username(name) => write!(f, "@{name}"),
            ChatRef::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Concrete peer kinds a chat reference can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Channel { channel_id: i64 },
    Chat { chat_id: i64 },
    User { user_id: i64 },
}

fn decimal_digits(value: u64) -> u32 {
    value.checked_ilog10().map_or(1, |log| log + 1)
}

/// Splits a `-100<channel>` chat id into the channel part.
pub fn channel_suffix(id: i64) -> Option<i64> {
    if id >= 0 {
        return None;
    }
    let abs = id.unsigned_abs();
    let digits = decimal_digits(abs);
    if digits < 4 {
        return None;
    }
    let scale = 10u64.pow(digits - 3);
    if abs / scale != 100 {
        return None;
    }
    i64::try_from(abs % scale).ok()
}

/// Builds `-100<channel>`; `None` when it does not fit in an i64.
pub fn with_channel_prefix(channel_id: u64) -> Option<i64> {
    let value = 10u64
        .checked_pow(decimal_digits(channel_id))?
        .checked_mul(100)?
        .checked_add(channel_id)?;
    i64::try_from(value).ok().map(|value| -value)
}

impl Peer {
    /// Derives the peer from a Bot API style chat id.
    pub fn from_bot_api_id(id: i64) -> Self {
        if let Some(channel_id) = channel_suffix(id) {
            return Peer::Channel { channel_id };
        }
        if id < 0 {
            Peer::Chat {
                chat_id: id.saturating_neg(),
            }
        } else {
            Peer::User { user_id: id }
        }
    }

    /// Canonical chat identifier used for message fetches.
    pub fn canonical_chat_id(&self) -> i64 {
        match self {
            Peer::Channel { channel_id } => with_channel_prefix(channel_id.unsigned_abs())
                .unwrap_or_else(|| channel_id.saturating_neg()),
            Peer::Chat { chat_id } => chat_id.saturating_neg(),
            Peer::User { user_id } => *user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub file_id: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Video {
        file: FileRef,
        duration: u32,
        width: u32,
        height: u32,
        file_name: Option<String>,
    },
    VideoNote {
        file: FileRef,
        duration: u32,
        length: u32,
    },
    Animation {
        file: FileRef,
        duration: u32,
        width: u32,
        height: u32,
    },
    Sticker {
        file: FileRef,
    },
    Document {
        file: FileRef,
        file_name: Option<String>,
    },
    Audio {
        file: FileRef,
        duration: u32,
        performer: Option<String>,
        title: Option<String>,
        file_name: Option<String>,
    },
    Voice {
        file: FileRef,
        duration: u32,
    },
    Photo {
        file: FileRef,
    },
    Text {
        text: String,
    },
}

impl Media {
    pub fn file(&self) -> Option<&FileRef> {
        match self {
            Media::Video { file, .. }
            | Media::VideoNote { file, .. }
            | Media::Animation { file, .. }
            | Media::Sticker { file }
            | Media::Document { file, .. }
            | Media::Audio { file, .. }
            | Media::Voice { file, .. }
            | Media::Photo { file } => Some(file),
            Media::Text { .. } => None,
        }
    }

    /// Attachments that go through download-then-reupload when renaming applies.
    pub fn is_rewritable_attachment(&self) -> bool {
        matches!(
            self,
            Media::Video { .. } | Media::Document { .. } | Media::Audio { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Media::Video { .. } => "video",
            Media::VideoNote { .. } => "video_note",
            Media::Animation { .. } => "animation",
            Media::Sticker { .. } => "sticker",
            Media::Document { .. } => "document",
            Media::Audio { .. } => "audio",
            Media::Voice { .. } => "voice",
            Media::Photo { .. } => "photo",
            Media::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub chat_id: i64,
    pub id: i32,
    pub caption: Option<String>,
    /// `None` for service messages or anything without relayable content.
    pub media: Option<Media>,
    pub empty: bool,
}

impl SourceMessage {
    pub fn empty(chat_id: i64, id: i32) -> Self {
        SourceMessage {
            chat_id,
            id,
            caption: None,
            media: None,
            empty: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub done: u64,
    pub total: u64,
}

pub type ProgressSender = watch::Sender<TransferProgress>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Remote(String),
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Video {
        source: InputSource,
        duration: u32,
        width: u32,
        height: u32,
        thumb: Option<PathBuf>,
    },
    VideoNote {
        source: InputSource,
        duration: u32,
        length: u32,
    },
    Animation {
        source: InputSource,
        duration: u32,
        width: u32,
        height: u32,
    },
    Sticker {
        source: InputSource,
    },
    Document {
        source: InputSource,
        file_name: Option<String>,
        thumb: Option<PathBuf>,
    },
    Audio {
        source: InputSource,
        duration: u32,
        performer: Option<String>,
        title: Option<String>,
        thumb: Option<PathBuf>,
    },
    Voice {
        source: InputSource,
        duration: u32,
    },
    Photo {
        source: InputSource,
    },
    Text {
        text: String,
    },
}

impl Payload {
    /// By-reference payload for a source message's media, no download involved.
    pub fn relay(media: &Media) -> Payload {
        match media {
            Media::Video {
                file,
                duration,
                width,
                height,
                ..
            } => Payload::Video {
                source: InputSource::Remote(file.file_id.clone()),
                duration: *duration,
                width: *width,
                height: *height,
                thumb: None,
            },
            Media::VideoNote {
                file,
                duration,
                length,
            } => Payload::VideoNote {
                source: InputSource::Remote(file.file_id.clone()),
                duration: *duration,
                length: *length,
            },
            Media::Animation {
                file,
                duration,
                width,
                height,
            } => Payload::Animation {
                source: InputSource::Remote(file.file_id.clone()),
                duration: *duration,
                width: *width,
                height: *height,
            },
            Media::Sticker { file } => Payload::Sticker {
                source: InputSource::Remote(file.file_id.clone()),
            },
            Media::Document { file, .. } => Payload::Document {
                source: InputSource::Remote(file.file_id.clone()),
                file_name: None,
                thumb: None,
            },
            Media::Audio {
                file,
                duration,
                performer,
                title,
                ..
            } => Payload::Audio {
                source: InputSource::Remote(file.file_id.clone()),
                duration: *duration,
                performer: performer.clone(),
                title: title.clone(),
                thumb: None,
            },
            Media::Voice { file, duration } => Payload::Voice {
                source: InputSource::Remote(file.file_id.clone()),
                duration: *duration,
            },
            Media::Photo { file } => Payload::Photo {
                source: InputSource::Remote(file.file_id.clone()),
            },
            Media::Text { text } => Payload::Text { text: text.clone() },
        }
    }

    /// Stickers and video notes carry no caption.
    pub fn accepts_caption(&self) -> bool {
        !matches!(self, Payload::Sticker { .. } | Payload::VideoNote { .. })
    }
}

#[derive(Debug)]
pub struct OutboundMessage {
    pub payload: Payload,
    pub caption: Option<String>,
    pub reply_to: Option<i32>,
    pub upload_progress: Option<ProgressSender>,
}

impl OutboundMessage {
    pub fn new(payload: Payload, caption: Option<String>) -> Self {
        OutboundMessage {
            payload,
            caption,
            reply_to: None,
            upload_progress: None,
        }
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    fn label(&self) -> &str;

    async fn get_message(&self, chat: &ChatRef, message_id: i32)
        -> Result<SourceMessage, ClientError>;

    async fn join_chat(&self, chat: &ChatRef) -> Result<(), ClientError>;

    /// Looks the chat up directly and returns its id.
    async fn get_chat(&self, chat: &ChatRef) -> Result<i64, ClientError>;

    async fn resolve_peer(&self, chat: &ChatRef) -> Result<Peer, ClientError>;

    /// Walks the dialog list so the client's local chat cache knows recent chats.
    async fn warm_dialogs(&self, limit: usize) -> Result<(), ClientError>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i32, ClientError>;

    async fn edit_text(&self, chat_id: i64, message_id: i32, text: &str)
        -> Result<(), ClientError>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), ClientError>;

    async fn send_media(&self, chat_id: i64, message: OutboundMessage) -> Result<(), ClientError>;

    async fn download_media(
        &self,
        message: &SourceMessage,
        destination: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<PathBuf, ClientError>;

    async fn stop(&self);
}

/// Starts clients from credentials a user saved with `/set`.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn start_bot(&self, user_id: i64, token: &str)
        -> Result<Arc<dyn ChatClient>, ClientError>;

    async fn start_session(
        &self,
        user_id: i64,
        session: &str,
    ) -> Result<Arc<dyn ChatClient>, ClientError>;
}
