use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::db::{SettingKey, UserDataStore};
use crate::telegram::client::{ChatClient, ClientFactory};
use crate::utils::crypto::SessionCipher;

const SESSION_WARMUP_DIALOGS: usize = 100;

/// Registry of per-user delegate clients.
///
/// Entries live for the lifetime of the process once created; there is no
/// eviction. Both maps are only touched between awaits, never across one.
/// Starting a client holds a per-user lock, so concurrent first calls for one
/// user start a single client.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ClientFactory>,
    store: Arc<dyn UserDataStore>,
    cipher: Arc<dyn SessionCipher>,
    default_bot: Arc<dyn ChatClient>,
    default_session: Option<Arc<dyn ChatClient>>,
    bots: Mutex<HashMap<i64, Arc<dyn ChatClient>>>,
    sessions: Mutex<HashMap<i64, Arc<dyn ChatClient>>>,
    bot_starts: StartLocks,
    session_starts: StartLocks,
}

#[derive(Default)]
struct StartLocks(Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>);

impl StartLocks {
    fn for_user(&self, user_id: i64) -> Arc<AsyncMutex<()>> {
        self.0.lock().entry(user_id).or_default().clone()
    }
}

impl ClientPool {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        store: Arc<dyn UserDataStore>,
        cipher: Arc<dyn SessionCipher>,
        default_bot: Arc<dyn ChatClient>,
        default_session: Option<Arc<dyn ChatClient>>,
    ) -> Self {
        ClientPool {
            inner: Arc::new(PoolInner {
                factory,
                store,
                cipher,
                default_bot,
                default_session,
                bots: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                bot_starts: StartLocks::default(),
                session_starts: StartLocks::default(),
            }),
        }
    }

    /// The shared bot every user talks to.
    pub fn default_bot(&self) -> Arc<dyn ChatClient> {
        self.inner.default_bot.clone()
    }

    pub async fn get_delegate_bot(&self, user_id: i64) -> Option<Arc<dyn ChatClient>> {
        let token = match self
            .inner
            .store
            .get_user_data_key(user_id, SettingKey::BotToken)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(err) => {
                error!("Failed to read bot token for user {user_id}: {err}");
                return None;
            }
        };
        if let Some(bot) = self.inner.bots.lock().get(&user_id) {
            return Some(bot.clone());
        }

        let lock = self.inner.bot_starts.for_user(user_id);
        let _starting = lock.lock().await;
        if let Some(bot) = self.inner.bots.lock().get(&user_id) {
            return Some(bot.clone());
        }
        match self.inner.factory.start_bot(user_id, &token).await {
            Ok(bot) => {
                self.inner.bots.lock().insert(user_id, bot.clone());
                Some(bot)
            }
            Err(err) => {
                error!("Error starting bot for user {user_id}: {err}");
                None
            }
        }
    }

    /// Best client that can read chats on the user's behalf.
    ///
    /// Order: the user's own session, then the user's own bot, then the shared
    /// default session.
    pub async fn get_user_session_client(&self, user_id: i64) -> Option<Arc<dyn ChatClient>> {
        if let Some(client) = self.own_session(user_id).await {
            return Some(client);
        }
        if let Some(bot) = self.get_delegate_bot(user_id).await {
            debug!("Using delegate bot for user {user_id}");
            return Some(bot);
        }
        self.inner.default_session.clone()
    }

    async fn own_session(&self, user_id: i64) -> Option<Arc<dyn ChatClient>> {
        if let Some(client) = self.inner.sessions.lock().get(&user_id) {
            return Some(client.clone());
        }

        let lock = self.inner.session_starts.for_user(user_id);
        let _starting = lock.lock().await;
        if let Some(client) = self.inner.sessions.lock().get(&user_id) {
            return Some(client.clone());
        }
        let stored = match self
            .inner
            .store
            .get_user_data_key(user_id, SettingKey::SessionString)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!("Failed to read session for user {user_id}: {err}");
                None
            }
        };

        match self.start_session(user_id, &stored?).await {
            Ok(client) => {
                self.inner.sessions.lock().insert(user_id, client.clone());
                Some(client)
            }
            Err(err) => {
                warn!("User client error for {user_id}: {err}");
                None
            }
        }
    }

    async fn start_session(
        &self,
        user_id: i64,
        stored: &str,
    ) -> anyhow::Result<Arc<dyn ChatClient>> {
        let session = self.inner.cipher.decrypt(stored)?;
        let client = self.inner.factory.start_session(user_id, &session).await?;
        if let Err(err) = client.warm_dialogs(SESSION_WARMUP_DIALOGS).await {
            warn!("Failed to update dialogs for user {user_id}: {err}");
        }
        info!("Started session client for user {user_id}");
        Ok(client)
    }

    pub fn cached_counts(&self) -> (usize, usize) {
        (
            self.inner.bots.lock().len(),
            self.inner.sessions.lock().len(),
        )
    }

    /// Stops every cached and shared client.
    pub async fn stop_all(&self) {
        let mut clients: Vec<Arc<dyn ChatClient>> = Vec::new();
        clients.extend(self.inner.sessions.lock().drain().map(|(_, client)| client));
        clients.extend(self.inner.bots.lock().drain().map(|(_, client)| client));
        if let Some(session) = &self.inner.default_session {
            clients.push(session.clone());
        }
        clients.push(self.inner.default_bot.clone());

        let count = clients.len();
        futures::future::join_all(clients.iter().map(|client| client.stop())).await;
        info!("Stopped {count} chat clients");
    }
}
