pub mod bot_api;
pub mod client;
pub mod link;
pub mod pool;
pub mod resolver;

pub use bot_api::{BotApiClient, BotApiFactory};
pub use client::{ChatClient, ClientFactory};
pub use pool::ClientPool;
