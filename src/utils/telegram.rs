use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHAT_ACTION_INTERVAL: Duration = Duration::from_secs(4);

/// Repeats a chat action until dropped or until `token` fires.
pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub fn start_chat_action_heartbeat(
    bot: Bot,
    chat_id: ChatId,
    action: ChatAction,
    token: CancellationToken,
) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action).await {
                debug!("send_chat_action failed: {err}");
            }
            tokio::select! {
                _ = tokio::time::sleep(CHAT_ACTION_INTERVAL) => {}
                _ = token.cancelled() => break,
            }
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}
