use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::telegram::client::{ChatClient, ChatRef, ClientError, SourceMessage};
use crate::telegram::link::{normalize_chat_ref, LinkType};

const PRIVATE_WARMUP_DIALOGS: usize = 50;
const PRIVATE_REFRESH_DIALOGS: usize = 200;

/// A fetched message together with the client that can see it.
#[derive(Clone)]
pub struct ResolvedMessage {
    pub message: SourceMessage,
    pub via: Arc<dyn ChatClient>,
}

impl ResolvedMessage {
    pub fn is_empty(&self) -> bool {
        self.message.empty
    }
}

pub async fn resolve(
    default_client: &Arc<dyn ChatClient>,
    delegate_client: Option<&Arc<dyn ChatClient>>,
    chat: &ChatRef,
    message_id: i32,
    link_type: LinkType,
) -> Option<ResolvedMessage> {
    match link_type {
        LinkType::Public => resolve_public(default_client, delegate_client, chat, message_id).await,
        LinkType::Private => {
            let Some(delegate) = delegate_client else {
                warn!("No delegate client available for private chat {chat}");
                return None;
            };
            resolve_private(delegate, chat, message_id).await
        }
    }
}

async fn resolve_public(
    default_client: &Arc<dyn ChatClient>,
    delegate_client: Option<&Arc<dyn ChatClient>>,
    chat: &ChatRef,
    message_id: i32,
) -> Option<ResolvedMessage> {
    let message = match default_client.get_message(chat, message_id).await {
        Ok(message) => message,
        Err(err) => {
            error!("Error fetching public message {chat}/{message_id}: {err}");
            return None;
        }
    };
    if !message.empty {
        return Some(ResolvedMessage {
            message,
            via: default_client.clone(),
        });
    }

    let Some(delegate) = delegate_client else {
        debug!("Public message {chat}/{message_id} is empty and no delegate is available");
        return Some(ResolvedMessage {
            message,
            via: default_client.clone(),
        });
    };

    if let Err(err) = delegate.join_chat(chat).await {
        debug!("{} could not join {chat}: {err}", delegate.label());
    }
    let fetched = async {
        let chat_id = delegate.get_chat(chat).await?;
        delegate.get_message(&ChatRef::Id(chat_id), message_id).await
    }
    .await;
    match fetched {
        Ok(message) => Some(ResolvedMessage {
            message,
            via: delegate.clone(),
        }),
        Err(err) => {
            error!("Error fetching public message {chat}/{message_id} via delegate: {err}");
            None
        }
    }
}

async fn resolve_private(
    delegate: &Arc<dyn ChatClient>,
    chat: &ChatRef,
    message_id: i32,
) -> Option<ResolvedMessage> {
    if let Err(err) = delegate.warm_dialogs(PRIVATE_WARMUP_DIALOGS).await {
        debug!("Dialog warm-up failed for {}: {err}", delegate.label());
    }
    let normalized = normalize_chat_ref(chat);

    let attempts: [(&str, PrivateAttempt); 3] = [
        ("peer", PrivateAttempt::Peer),
        ("direct", PrivateAttempt::Direct),
        ("refresh", PrivateAttempt::Refresh),
    ];
    for (name, attempt) in attempts {
        match attempt.run(delegate.as_ref(), &normalized, message_id).await {
            Ok(message) => {
                debug!("Resolved {normalized}/{message_id} via {name} lookup");
                return Some(ResolvedMessage {
                    message,
                    via: delegate.clone(),
                });
            }
            Err(err) => {
                debug!("{name} lookup for {normalized}/{message_id} failed: {err}");
            }
        }
    }

    error!("Private chat {normalized}/{message_id} could not be resolved");
    None
}

/// Private lookups ordered from cheapest to the dialog refresh that warms the cache.
#[derive(Debug, Clone, Copy)]
enum PrivateAttempt {
    Peer,
    Direct,
    Refresh,
}

impl PrivateAttempt {
    async fn run(
        self,
        client: &dyn ChatClient,
        chat: &ChatRef,
        message_id: i32,
    ) -> Result<SourceMessage, ClientError> {
        match self {
            PrivateAttempt::Peer => {
                let peer = client.resolve_peer(chat).await?;
                let chat_id = peer.canonical_chat_id();
                client.get_message(&ChatRef::Id(chat_id), message_id).await
            }
            PrivateAttempt::Direct => {
                let chat_id = client.get_chat(chat).await?;
                client.get_message(&ChatRef::Id(chat_id), message_id).await
            }
            PrivateAttempt::Refresh => {
                client.warm_dialogs(PRIVATE_REFRESH_DIALOGS).await?;
                client.get_message(chat, message_id).await
            }
        }
    }
}
