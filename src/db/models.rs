use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserSettingRow {
    pub user_id: i64,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-user settings understood by `/set`, `/unset` and the relay pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    BotToken,
    SessionString,
    RenameTag,
    Caption,
    ChatId,
    Replacements,
    DeleteWords,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        SettingKey::BotToken,
        SettingKey::SessionString,
        SettingKey::RenameTag,
        SettingKey::Caption,
        SettingKey::ChatId,
        SettingKey::Replacements,
        SettingKey::DeleteWords,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::BotToken => "bot_token",
            SettingKey::SessionString => "session_string",
            SettingKey::RenameTag => "rename_tag",
            SettingKey::Caption => "caption",
            SettingKey::ChatId => "chat_id",
            SettingKey::Replacements => "replacements",
            SettingKey::DeleteWords => "delete_words",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
    }

    /// Credentials are never echoed back to the chat.
    pub fn is_secret(self) -> bool {
        matches!(self, SettingKey::BotToken | SettingKey::SessionString)
    }
}

/// Caption rewriting rules: delete words first, then replacements in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRules {
    pub replacements: BTreeMap<String, String>,
    pub delete_words: Vec<String>,
}

impl TextRules {
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty() && self.delete_words.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut output = text.to_string();
        for word in self.delete_words.iter().filter(|word| !word.is_empty()) {
            output = output.replace(word.as_str(), "");
        }
        for (from, to) in self.replacements.iter().filter(|(from, _)| !from.is_empty()) {
            output = output.replace(from.as_str(), to);
        }
        output.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_keys_parse_case_insensitively() {
        assert_eq!(SettingKey::parse(" Rename_Tag "), Some(SettingKey::RenameTag));
        assert_eq!(SettingKey::parse("unknown"), None);
        for key in SettingKey::ALL {
            assert_eq!(SettingKey::parse(key.as_str()), Some(key));
        }
    }

    #[test]
    fn rules_delete_before_replacing() {
        let rules = TextRules {
            replacements: BTreeMap::from([
                ("old".to_string(), "new".to_string()),
                ("ad".to_string(), "AD".to_string()),
            ]),
            delete_words: vec!["@spam".to_string(), "ad".to_string()],
        };
        assert_eq!(rules.apply("old post @spam with ad"), "new post  with");
    }

    #[test]
    fn empty_rules_only_trim() {
        assert!(TextRules::default().is_empty());
        assert_eq!(TextRules::default().apply("  hi  "), "hi");
    }
}
