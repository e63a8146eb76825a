use teloxide::prelude::*;

use crate::db::Database;

pub fn user_id_of(message: &Message) -> Option<i64> {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
}

pub async fn check_owner_access(bot: &Bot, db: &Database, message: &Message) -> bool {
    let allowed = user_id_of(message)
        .map(|user_id| db.is_owner(user_id))
        .unwrap_or(false);
    if !allowed {
        let _ = bot
            .send_message(message.chat.id, "This command is only available to the bot owner.")
            .await;
    }
    allowed
}
