use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod batch;
mod config;
mod db;
mod handlers;
mod media;
mod state;
mod telegram;
mod utils;

use config::CONFIG;
use db::Database;
use handlers::{batch as batch_cmd, commands, settings, ytdl};
use media::probe::probe_tools;
use media::ytdl::YtdlMode;
use state::AppState;
use telegram::{BotApiClient, BotApiFactory, ChatClient, ClientFactory, ClientPool};
use utils::crypto::build_session_cipher;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Batch,
    Single(String),
    Cancel,
    Stop,
    Status,
    Dl(String),
    Adl(String),
    Set(String),
    Unset(String),
    Settings,
    Add(String),
    Rem(String),
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

async fn start_default_session(factory: &dyn ClientFactory) -> Option<Arc<dyn ChatClient>> {
    let session = CONFIG.default_session.trim();
    if session.is_empty() {
        return None;
    }
    match factory.start_session(0, session).await {
        Ok(client) => {
            info!("Default session client started");
            Some(client)
        }
        Err(err) => {
            warn!("Default session could not be started: {err}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();
    info!("Starting relay bot");

    let tools = probe_tools(&CONFIG.ytdl_bin).await;
    let db = Database::init(&CONFIG.database_url)
        .await?
        .with_owners(CONFIG.owner_ids.clone());
    let cipher = build_session_cipher(&CONFIG.session_encryption_key)?;

    let bot = Bot::new(CONFIG.bot_token.clone());
    let default_bot: Arc<dyn ChatClient> =
        Arc::new(BotApiClient::new(bot.clone(), "default", CONFIG.relay_chat_id));
    let factory: Arc<dyn ClientFactory> = Arc::new(BotApiFactory::new(CONFIG.relay_chat_id));
    let default_session = start_default_session(factory.as_ref()).await;
    let pool = ClientPool::new(
        factory,
        Arc::new(db.clone()),
        cipher.clone(),
        default_bot,
        default_session,
    );

    let state = AppState::new(bot.clone(), db, pool, cipher, tools);
    let resumed = state.batches.resume_pending(
        state.processor.clone(),
        state.reporter.clone(),
        &state.tracker,
    );
    info!("Ready; {resumed} batches resumed");

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text_message),
        )
        .endpoint(ignore_message);

    Dispatcher::builder(bot, message_handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    shutdown(state).await;
    Ok(())
}

async fn shutdown(state: AppState) {
    info!("Shutting down");
    state.shutdown.cancel();
    state.tracker.close();
    if tokio::time::timeout(CONFIG.shutdown_grace(), state.tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "{} background tasks still running after {}s",
            state.tracker.len(),
            CONFIG.shutdown_grace_seconds
        );
    }

    state.pool.stop_all().await;

    if let Err(err) = state.batches.store().flush().await {
        error!("Final active task flush failed: {err}");
    }
    state.db.close().await;
}

fn optional_arg(arg: String) -> Option<String> {
    if arg.trim().is_empty() {
        None
    } else {
        Some(arg)
    }
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Batch => batch_cmd::batch_handler(bot, state, message).await?,
        Command::Cancel | Command::Stop => batch_cmd::cancel_handler(bot, state, message).await?,
        Command::Status => commands::status_handler(bot, state, message).await?,
        Command::Single(arg) => {
            let tracker = state.tracker.clone();
            let arg = optional_arg(arg);
            tracker.spawn(async move {
                if let Err(err) = batch_cmd::single_handler(bot, state, message, arg).await {
                    error!("single handler failed: {err}");
                }
            });
        }
        Command::Dl(arg) => {
            let tracker = state.tracker.clone();
            let arg = optional_arg(arg);
            tracker.spawn(async move {
                if let Err(err) = ytdl::ytdl_handler(bot, state, message, arg, YtdlMode::Video).await {
                    error!("dl handler failed: {err}");
                }
            });
        }
        Command::Adl(arg) => {
            let tracker = state.tracker.clone();
            let arg = optional_arg(arg);
            tracker.spawn(async move {
                if let Err(err) = ytdl::ytdl_handler(bot, state, message, arg, YtdlMode::Audio).await {
                    error!("adl handler failed: {err}");
                }
            });
        }
        Command::Set(arg) => settings::set_handler(bot, state, message, arg).await?,
        Command::Unset(arg) => settings::unset_handler(bot, state, message, arg).await?,
        Command::Settings => settings::settings_handler(bot, state, message).await?,
        Command::Add(arg) => commands::add_premium_handler(bot, state, message, arg).await?,
        Command::Rem(arg) => commands::remove_premium_handler(bot, state, message, arg).await?,
    }
    Ok(())
}

async fn handle_text_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    if let Some(text) = message.text() {
        if text.trim_start().starts_with('/') {
            return Ok(());
        }
    }
    batch_cmd::links_handler(bot, state, message).await?;
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
