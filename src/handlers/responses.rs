use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ReplyParameters};
use tracing::warn;

use crate::batch::BatchReporter;

pub async fn edit_text_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
    parse_mode: Option<ParseMode>,
) -> Result<()> {
    let mut delay = Duration::from_secs_f32(1.5);
    for attempt in 0..3 {
        let request = bot.edit_message_text(chat_id, message_id, text.to_string());
        let request = if let Some(mode) = parse_mode {
            request.parse_mode(mode)
        } else {
            request
        };

        match request.await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if attempt == 2 {
                    return Err(err.into());
                }
                warn!("edit_message_text failed: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    Ok(())
}

/// Replies to `message` with plain text and returns the new message.
pub async fn reply_text(bot: &Bot, message: &Message, text: impl Into<String>) -> Result<Message> {
    let sent = bot
        .send_message(message.chat.id, text.into())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(sent)
}

/// Edits a status message, logging instead of failing.
pub async fn update_status(bot: &Bot, status: &Message, text: &str) {
    if let Err(err) = edit_text_with_retry(bot, status.chat.id, status.id, text, None).await {
        warn!("Failed to update status message: {err}");
    }
}

/// Batch status messages sent through the shared bot.
pub struct BotReporter {
    bot: Bot,
}

impl BotReporter {
    pub fn new(bot: Bot) -> Self {
        BotReporter { bot }
    }
}

#[async_trait]
impl BatchReporter for BotReporter {
    async fn post(&self, chat_id: i64, text: &str) -> Result<i32> {
        let sent = self.bot.send_message(ChatId(chat_id), text.to_string()).await?;
        Ok(sent.id.0)
    }

    async fn update(&self, chat_id: i64, message_id: i32, text: &str) -> Result<()> {
        edit_text_with_retry(&self.bot, ChatId(chat_id), MessageId(message_id), text, None).await
    }
}
