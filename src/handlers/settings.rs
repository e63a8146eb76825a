use std::collections::BTreeMap;

use anyhow::Result;
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::db::{SettingKey, UserDataStore};
use crate::handlers::access::user_id_of;
use crate::handlers::responses::reply_text;
use crate::state::AppState;

const VALUE_PREVIEW_CHARS: usize = 60;

fn key_list() -> String {
    SettingKey::ALL
        .iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks and normalizes a value before it is stored.
pub fn validate_setting(key: SettingKey, raw: &str) -> Result<String, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(format!("A value is required for {}.", key.as_str()));
    }
    match key {
        SettingKey::ChatId => value
            .parse::<i64>()
            .map(|id| id.to_string())
            .map_err(|_| "chat_id must be a numeric chat id such as -1001234567890.".to_string()),
        SettingKey::Replacements => serde_json::from_str::<BTreeMap<String, String>>(value)
            .map(|_| value.to_string())
            .map_err(|err| format!("replacements must be a JSON object of strings: {err}")),
        SettingKey::DeleteWords => serde_json::from_str::<Vec<String>>(value)
            .map(|_| value.to_string())
            .map_err(|err| format!("delete_words must be a JSON array of strings: {err}")),
        _ => Ok(value.to_string()),
    }
}

fn split_key_value(arg: &str) -> (&str, &str) {
    let arg = arg.trim();
    match arg.split_once(char::is_whitespace) {
        Some((key, value)) => (key, value.trim()),
        None => (arg, ""),
    }
}

pub async fn set_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let (raw_key, raw_value) = split_key_value(&arg);
    let Some(key) = SettingKey::parse(raw_key) else {
        reply_text(
            &bot,
            &message,
            format!("Usage: /set <key> <value>\nKeys: {}", key_list()),
        )
        .await?;
        return Ok(());
    };

    if key.is_secret() {
        // Keep credentials out of the chat history.
        if let Err(err) = bot.delete_message(message.chat.id, message.id).await {
            warn!("Could not delete credential message from user {user_id}: {err}");
        }
    }

    let value = match validate_setting(key, raw_value) {
        Ok(value) => value,
        Err(reason) => {
            bot.send_message(message.chat.id, reason).await?;
            return Ok(());
        }
    };
    let stored = if key == SettingKey::SessionString {
        match state.cipher.encrypt(&value) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("Session encryption failed for user {user_id}: {err}");
                bot.send_message(message.chat.id, "Could not store the session securely.")
                    .await?;
                return Ok(());
            }
        }
    } else {
        value
    };

    state.db.set_user_data_key(user_id, key, &stored).await?;
    info!("User {user_id} set {}", key.as_str());

    let reply = if key.is_secret() {
        format!(
            "Saved {}. It takes effect the next time the bot restarts if a client is already running for you.",
            key.as_str()
        )
    } else {
        format!("Saved {}.", key.as_str())
    };
    bot.send_message(message.chat.id, reply).await?;
    Ok(())
}

pub async fn unset_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let Some(key) = SettingKey::parse(arg.trim()) else {
        reply_text(
            &bot,
            &message,
            format!("Usage: /unset <key>\nKeys: {}", key_list()),
        )
        .await?;
        return Ok(());
    };

    let reply = if state.db.remove_user_data_key(user_id, key).await? {
        format!("Removed {}.", key.as_str())
    } else {
        format!("{} was not set.", key.as_str())
    };
    reply_text(&bot, &message, reply).await?;
    Ok(())
}

fn preview(value: &str) -> String {
    if value.chars().count() <= VALUE_PREVIEW_CHARS {
        return value.to_string();
    }
    let head: String = value.chars().take(VALUE_PREVIEW_CHARS).collect();
    format!("{head}...")
}

pub async fn settings_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = user_id_of(&message) else {
        return Ok(());
    };
    let rows = state.db.list_user_settings(user_id).await?;
    if rows.is_empty() {
        reply_text(
            &bot,
            &message,
            format!("No settings stored.\nUse /set <key> <value> with one of: {}", key_list()),
        )
        .await?;
        return Ok(());
    }

    let mut report = String::from("Your settings\n");
    for row in rows {
        let secret = SettingKey::parse(&row.key)
            .map(SettingKey::is_secret)
            .unwrap_or(true);
        let shown = if secret {
            "(set)".to_string()
        } else {
            preview(&row.value)
        };
        report.push_str(&format!("{}: {}\n", row.key, shown));
    }
    reply_text(&bot, &message, report).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_ids_must_be_numeric() {
        assert_eq!(
            validate_setting(SettingKey::ChatId, " -1001234 "),
            Ok("-1001234".to_string())
        );
        assert!(validate_setting(SettingKey::ChatId, "@channel").is_err());
    }

    #[test]
    fn rule_settings_must_be_json() {
        assert!(validate_setting(SettingKey::Replacements, r#"{"a":"b"}"#).is_ok());
        assert!(validate_setting(SettingKey::Replacements, r#"["a"]"#).is_err());
        assert!(validate_setting(SettingKey::DeleteWords, r#"["spam","ads"]"#).is_ok());
        assert!(validate_setting(SettingKey::DeleteWords, "spam").is_err());
    }

    #[test]
    fn empty_values_are_rejected() {
        assert!(validate_setting(SettingKey::RenameTag, "   ").is_err());
        assert_eq!(
            validate_setting(SettingKey::RenameTag, "@mychannel"),
            Ok("@mychannel".to_string())
        );
    }

    #[test]
    fn key_and_value_split_on_first_whitespace() {
        assert_eq!(split_key_value(" caption  Hello world "), ("caption", "Hello world"));
        assert_eq!(split_key_value("caption"), ("caption", ""));
    }
}
