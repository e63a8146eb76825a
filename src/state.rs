use std::sync::Arc;

use chrono::{DateTime, Utc};
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::{ActiveTaskStore, BatchManager, RelayProcessor, TransferExecutor};
use crate::config::CONFIG;
use crate::db::{Database, UserDataStore};
use crate::handlers::responses::BotReporter;
use crate::media::probe::ToolSupport;
use crate::media::ytdl::YtdlRunner;
use crate::telegram::ClientPool;
use crate::utils::crypto::SessionCipher;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub pool: ClientPool,
    pub cipher: Arc<dyn SessionCipher>,
    pub batches: Arc<BatchManager>,
    pub processor: Arc<RelayProcessor>,
    pub reporter: Arc<BotReporter>,
    pub ytdl: YtdlRunner,
    pub tools: ToolSupport,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wires the batch pipeline. Opens the active-task file, so it needs a runtime.
    pub fn new(
        bot: Bot,
        db: Database,
        pool: ClientPool,
        cipher: Arc<dyn SessionCipher>,
        tools: ToolSupport,
    ) -> Self {
        let users: Arc<dyn UserDataStore> = Arc::new(db.clone());
        let shutdown = CancellationToken::new();
        let store = ActiveTaskStore::open(CONFIG.active_tasks_file.clone());
        let batches = Arc::new(BatchManager::new(
            store,
            users.clone(),
            shutdown.clone(),
            CONFIG.freemium_limit,
            CONFIG.premium_limit,
            CONFIG.batch_throttle(),
        ));
        let executor = TransferExecutor::new(
            users.clone(),
            CONFIG.download_dir.clone(),
            tools.ffmpeg && tools.ffprobe,
        );
        let processor = Arc::new(RelayProcessor::new(pool.clone(), users, executor));
        let ytdl = YtdlRunner::new(
            &CONFIG.ytdl_bin,
            CONFIG.download_dir.join("ytdl"),
            &CONFIG.yt_cookies,
            &CONFIG.insta_cookies,
        );

        AppState {
            db,
            pool,
            cipher,
            batches,
            processor,
            reporter: Arc::new(BotReporter::new(bot)),
            ytdl,
            tools,
            shutdown,
            tracker: TaskTracker::new(),
            started_at: Utc::now(),
        }
    }
}
