use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::batch::machine::LinkProcessor;
use crate::batch::transfer::TransferExecutor;
use crate::db::{SettingKey, UserDataStore};
use crate::telegram::link::parse_link;
use crate::telegram::pool::ClientPool;
use crate::telegram::resolver::resolve;

/// Parses, resolves and transfers links for a user.
#[derive(Clone)]
pub struct RelayProcessor {
    pool: ClientPool,
    users: Arc<dyn UserDataStore>,
    executor: TransferExecutor,
}

impl RelayProcessor {
    pub fn new(pool: ClientPool, users: Arc<dyn UserDataStore>, executor: TransferExecutor) -> Self {
        RelayProcessor {
            pool,
            users,
            executor,
        }
    }

    async fn setting(&self, user_id: i64, key: SettingKey) -> Option<String> {
        match self.users.get_user_data_key(user_id, key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read {} for user {user_id}: {err}", key.as_str());
                None
            }
        }
    }

    /// The user's configured target chat, or the chat the request came from.
    pub async fn destination(&self, user_id: i64, origin_chat: i64) -> i64 {
        let Some(raw) = self.setting(user_id, SettingKey::ChatId).await else {
            return origin_chat;
        };
        match raw.trim().parse::<i64>() {
            Ok(chat_id) => chat_id,
            Err(_) => {
                warn!("Ignoring malformed chat_id setting {raw:?} for user {user_id}");
                origin_chat
            }
        }
    }

    pub async fn relay_link(&self, user_id: i64, origin_chat: i64, link: &str) -> Result<bool> {
        let parsed = parse_link(link).ok_or_else(|| anyhow!("Invalid link format: {link}"))?;
        let delegate = self.pool.get_user_session_client(user_id).await;
        let default_bot = self.pool.default_bot();

        let Some(resolved) = resolve(
            &default_bot,
            delegate.as_ref(),
            &parsed.chat,
            parsed.message_id,
            parsed.kind,
        )
        .await
        else {
            warn!("Could not resolve {link} for user {user_id}");
            return Ok(false);
        };
        if resolved.is_empty() {
            info!("{link} resolved to an empty message");
            return Ok(false);
        }

        let destination = self.destination(user_id, origin_chat).await;
        let caption_override = self.setting(user_id, SettingKey::Caption).await;
        Ok(self
            .executor
            .transfer(&resolved, destination, user_id, caption_override)
            .await)
    }
}

#[async_trait]
impl LinkProcessor for RelayProcessor {
    async fn process(&self, user_id: i64, chat_id: i64, link: &str) -> Result<bool> {
        self.relay_link(user_id, chat_id, link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::client::ChatClient;
    use crate::telegram::pool::tests::{FakeFactory, MemoryStore};
    use crate::telegram::resolver::tests::FakeClient;
    use crate::utils::crypto::PlaintextCipher;

    struct Harness {
        processor: RelayProcessor,
        default_bot: Arc<FakeClient>,
        session: Option<Arc<FakeClient>>,
        _dir: tempfile::TempDir,
    }

    fn harness(store: MemoryStore, default_bot: FakeClient, session: Option<FakeClient>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let users: Arc<dyn UserDataStore> = Arc::new(store);
        let default_bot = Arc::new(default_bot);
        let session = session.map(Arc::new);
        let pool = ClientPool::new(
            Arc::new(FakeFactory::default()),
            users.clone(),
            Arc::new(PlaintextCipher),
            default_bot.clone() as Arc<dyn ChatClient>,
            session.clone().map(|client| client as Arc<dyn ChatClient>),
        );
        let executor = TransferExecutor::new(users.clone(), dir.path().to_path_buf(), false);
        Harness {
            processor: RelayProcessor::new(pool, users, executor),
            default_bot,
            session,
            _dir: dir,
        }
    }

    fn public_bot() -> FakeClient {
        FakeClient::named("default_bot")
            .with_username("somechannel", -1001)
            .with_message(-1001, 7)
    }

    #[tokio::test]
    async fn public_links_go_to_the_origin_chat() {
        let h = harness(MemoryStore::default(), public_bot(), None);
        let ok = h
            .processor
            .relay_link(1, 10, "https://t.me/somechannel/7")
            .await
            .unwrap();
        assert!(ok);
        assert!(h.default_bot.calls().contains(&"send_media 10".to_string()));
    }

    #[tokio::test]
    async fn chat_id_setting_redirects_the_transfer() {
        let store = MemoryStore::default().with(1, SettingKey::ChatId, "-100555");
        let h = harness(store, public_bot(), None);
        assert!(h
            .processor
            .relay_link(1, 10, "https://t.me/somechannel/7")
            .await
            .unwrap());
        assert!(h.default_bot.calls().contains(&"send_media -100555".to_string()));
    }

    #[tokio::test]
    async fn malformed_chat_id_falls_back_to_origin() {
        let store = MemoryStore::default().with(1, SettingKey::ChatId, "my channel");
        let h = harness(store, public_bot(), None);
        assert_eq!(h.processor.destination(1, 10).await, 10);
    }

    #[tokio::test]
    async fn private_links_need_a_delegate() {
        let h = harness(MemoryStore::default(), public_bot(), None);
        let ok = h
            .processor
            .relay_link(1, 10, "https://t.me/c/1234567890/5")
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn private_links_use_the_shared_session() {
        let session = FakeClient::named("shared").with_message(-1001234567890, 5);
        let h = harness(MemoryStore::default(), public_bot(), Some(session));
        let ok = h
            .processor
            .relay_link(1, 10, "https://t.me/c/1234567890/5")
            .await
            .unwrap();
        assert!(ok);
        let session = h.session.unwrap();
        assert!(session.calls().contains(&"send_media 10".to_string()));
        assert!(!h.default_bot.calls().iter().any(|call| call.starts_with("send_media")));
    }

    #[tokio::test]
    async fn missing_messages_and_bad_links() {
        let h = harness(MemoryStore::default(), public_bot(), None);
        assert!(!h
            .processor
            .relay_link(1, 10, "https://t.me/somechannel/8")
            .await
            .unwrap());
        assert!(h.processor.relay_link(1, 10, "https://t.me/").await.is_err());
    }

    #[tokio::test]
    async fn signed_private_chat_ids_are_rejected_as_invalid() {
        let store = MemoryStore::default().with(1, SettingKey::BotToken, "123:abc");
        let h = harness(store, public_bot(), None);
        assert!(h
            .processor
            .relay_link(1, 10, "https://t.me/c/-9223372036854775808/1")
            .await
            .is_err());
    }
}
