use url::Url;

use crate::telegram::client::{channel_suffix, with_channel_prefix, ChatRef};

/// Marker a submitted line must contain to count as a Telegram link.
pub const LINK_MARKER: &str = "t.me";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLink {
    pub chat: ChatRef,
    pub message_id: i32,
    pub kind: LinkType,
}

pub fn has_link_marker(text: &str) -> bool {
    text.contains(LINK_MARKER)
}

pub fn parse_link(link: &str) -> Option<ParsedLink> {
    let trimmed = link.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.trim_start_matches("www.");
    if host != "t.me" && host != "telegram.me" {
        return None;
    }

    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    let message_id = segments.last()?.parse::<i32>().ok()?;
    if message_id <= 0 {
        return None;
    }

    match segments.as_slice() {
        ["c", chat, .., _] if segments.len() <= 4 => {
            if chat.is_empty() || !chat.bytes().all(|byte| byte.is_ascii_digit()) {
                return None;
            }
            let id = chat.parse::<i64>().ok()?;
            Some(ParsedLink {
                chat: ChatRef::Id(id),
                message_id,
                kind: LinkType::Private,
            })
        }
        ["b", bot, _] => Some(ParsedLink {
            chat: ChatRef::Username(bot.to_string()),
            message_id,
            kind: LinkType::Private,
        }),
        [username, ..] if segments.len() <= 3 && is_username(username) => Some(ParsedLink {
            chat: ChatRef::Username(username.to_string()),
            message_id,
            kind: LinkType::Public,
        }),
        _ => None,
    }
}

fn is_username(value: &str) -> bool {
    value.len() >= 4
        && value.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        && value
            .chars()
            .next()
            .map(|ch| ch.is_ascii_alphabetic())
            .unwrap_or(false)
}

/// Rewrites a numeric chat reference into its `-100<id>` supergroup form.
pub fn normalize_chat_ref(chat: &ChatRef) -> ChatRef {
    match chat {
        ChatRef::Id(id) => {
            if channel_suffix(*id).is_some() {
                ChatRef::Id(*id)
            } else {
                ChatRef::Id(with_channel_prefix(id.unsigned_abs()).unwrap_or(*id))
            }
        }
        ChatRef::Username(name) => ChatRef::Username(name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_private_channel_links() {
        let parsed = parse_link("https://t.me/c/1234567890/123").unwrap();
        assert_eq!(parsed.chat, ChatRef::Id(1234567890));
        assert_eq!(parsed.message_id, 123);
        assert_eq!(parsed.kind, LinkType::Private);
    }

    #[test]
    fn parses_private_topic_links_to_the_message_id() {
        let parsed = parse_link("https://t.me/c/1234567890/5/321").unwrap();
        assert_eq!(parsed.chat, ChatRef::Id(1234567890));
        assert_eq!(parsed.message_id, 321);
    }

    #[test]
    fn parses_public_links_without_scheme_and_with_query() {
        let parsed = parse_link("t.me/some_channel/42?single").unwrap();
        assert_eq!(parsed.chat, ChatRef::Username("some_channel".to_string()));
        assert_eq!(parsed.message_id, 42);
        assert_eq!(parsed.kind, LinkType::Public);
    }

    #[test]
    fn parses_bot_chat_links_as_private() {
        let parsed = parse_link("https://t.me/b/my_helper_bot/9").unwrap();
        assert_eq!(parsed.chat, ChatRef::Username("my_helper_bot".to_string()));
        assert_eq!(parsed.kind, LinkType::Private);
    }

    #[test]
    fn rejects_non_message_links() {
        assert!(parse_link("https://t.me/some_channel").is_none());
        assert!(parse_link("https://example.com/c/1/2").is_none());
        assert!(parse_link("https://t.me/c/notanumber/2").is_none());
        assert!(parse_link("https://t.me/joinchat/abc").is_none());
        assert!(parse_link("").is_none());
    }

    #[test]
    fn private_chat_ids_must_be_plain_digits() {
        assert!(parse_link("https://t.me/c/-9223372036854775808/1").is_none());
        assert!(parse_link("https://t.me/c/-1001234567890/1").is_none());
        assert!(parse_link("https://t.me/c/+123/1").is_none());
        assert!(parse_link("https://t.me/c/99999999999999999999/1").is_none());
    }

    #[test]
    fn normalizing_extreme_ids_does_not_panic() {
        assert_eq!(normalize_chat_ref(&ChatRef::Id(i64::MIN)), ChatRef::Id(i64::MIN));
        assert_eq!(normalize_chat_ref(&ChatRef::Id(i64::MAX)), ChatRef::Id(i64::MAX));
        assert_eq!(normalize_chat_ref(&ChatRef::Id(-4567)), ChatRef::Id(-1004567));
    }

    #[test]
    fn normalizes_numeric_refs_once() {
        assert_eq!(
            normalize_chat_ref(&ChatRef::Id(1234567890)),
            ChatRef::Id(-1001234567890)
        );
        assert_eq!(
            normalize_chat_ref(&ChatRef::Id(-1001234567890)),
            ChatRef::Id(-1001234567890)
        );
        assert_eq!(
            normalize_chat_ref(&ChatRef::Username("chan".to_string())),
            ChatRef::Username("chan".to_string())
        );
    }
}
