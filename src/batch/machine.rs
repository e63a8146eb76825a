use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::batch::progress;
use crate::batch::store::{ActiveTask, ActiveTaskStore, TaskStatus};
use crate::db::UserDataStore;
use crate::telegram::link::has_link_marker;

/// Relays one link on behalf of a user. `Ok(false)` and `Err` both count as a
/// failed link; neither stops the batch.
#[async_trait]
pub trait LinkProcessor: Send + Sync {
    async fn process(&self, user_id: i64, chat_id: i64, link: &str) -> Result<bool>;
}

/// Where batch status messages go.
#[async_trait]
pub trait BatchReporter: Send + Sync {
    async fn post(&self, chat_id: i64, text: &str) -> Result<i32>;
    async fn update(&self, chat_id: i64, message_id: i32, text: &str) -> Result<()>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("No valid links found. Please send links one per line.")]
    Empty,

    #[error("Too many links! Maximum allowed: {limit}. Send fewer links or upgrade to premium.")]
    OverLimit { limit: usize, count: usize },

    #[error("No valid Telegram links found. Please send valid t.me links.")]
    NoValidLinks,

    #[error("No batch is waiting for links.")]
    NotWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { limit: usize, is_premium: bool },
    AlreadyActive,
    PremiumOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still collecting links and is gone.
    Removed,
    /// A running batch will stop at its next link boundary.
    Requested,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    /// Stopped by shutdown; the task stays stored and resumes on restart.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub outcome: BatchOutcome,
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
}

/// Where a run starts and the counters it inherits.
#[derive(Debug, Clone, Copy, Default)]
struct RunStart {
    index: usize,
    success: usize,
    failed: usize,
}

pub struct BatchManager {
    store: ActiveTaskStore,
    users: Arc<dyn UserDataStore>,
    root: CancellationToken,
    tokens: Mutex<HashMap<i64, CancellationToken>>,
    freemium_limit: usize,
    premium_limit: usize,
    throttle: Duration,
}

impl BatchManager {
    pub fn new(
        store: ActiveTaskStore,
        users: Arc<dyn UserDataStore>,
        root: CancellationToken,
        freemium_limit: usize,
        premium_limit: usize,
        throttle: Duration,
    ) -> Self {
        BatchManager {
            store,
            users,
            root,
            tokens: Mutex::new(HashMap::new()),
            freemium_limit,
            premium_limit,
            throttle,
        }
    }

    pub fn store(&self) -> &ActiveTaskStore {
        &self.store
    }

    pub fn task(&self, user_id: i64) -> Option<ActiveTask> {
        self.store.get(user_id)
    }

    pub fn is_waiting_for_links(&self, user_id: i64) -> bool {
        self.store
            .get(user_id)
            .map(|task| task.status == TaskStatus::WaitingForLinks)
            .unwrap_or(false)
    }

    /// Opens a batch awaiting links. Never replaces an existing task.
    pub async fn start(&self, user_id: i64, chat_id: i64) -> StartOutcome {
        if self.store.contains(user_id) {
            return StartOutcome::AlreadyActive;
        }
        let is_premium = match self.users.is_premium_user(user_id).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Premium lookup failed for user {user_id}: {err}");
                false
            }
        };
        if !is_premium && self.freemium_limit == 0 {
            return StartOutcome::PremiumOnly;
        }
        let limit = if is_premium {
            self.premium_limit
        } else {
            self.freemium_limit
        };
        if !self
            .store
            .insert_if_absent(user_id, ActiveTask::waiting(limit, chat_id))
        {
            return StartOutcome::AlreadyActive;
        }
        info!("User {user_id} opened a batch with limit {limit}");
        StartOutcome::Started { limit, is_premium }
    }

    /// Validates submitted text and moves the task to processing. On any
    /// error the task is left untouched.
    pub fn submit_links(&self, user_id: i64, text: &str) -> Result<Vec<String>, SubmitError> {
        let task = self.store.get(user_id).ok_or(SubmitError::NotWaiting)?;
        if task.status != TaskStatus::WaitingForLinks {
            return Err(SubmitError::NotWaiting);
        }

        let entries: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if entries.is_empty() {
            return Err(SubmitError::Empty);
        }
        if entries.len() > task.limit {
            return Err(SubmitError::OverLimit {
                limit: task.limit,
                count: entries.len(),
            });
        }
        let links: Vec<String> = entries
            .into_iter()
            .filter(|entry| has_link_marker(entry))
            .map(str::to_string)
            .collect();
        if links.is_empty() {
            return Err(SubmitError::NoValidLinks);
        }

        let accepted = links.clone();
        let updated = self.store.update(user_id, |task| {
            if task.status == TaskStatus::WaitingForLinks {
                task.begin_processing(accepted);
            }
        });
        match updated {
            Some(task) if task.status == TaskStatus::Processing => {
                self.tokens
                    .lock()
                    .insert(user_id, self.root.child_token());
                Ok(links)
            }
            _ => Err(SubmitError::NotWaiting),
        }
    }

    /// Records where the running batch reports, so a resumed run can find it.
    pub fn attach_status_message(&self, user_id: i64, chat_id: i64, message_id: i32) {
        self.store.update(user_id, |task| {
            task.chat_id = Some(chat_id);
            task.status_msg_id = Some(message_id);
        });
    }

    pub fn request_cancel(&self, user_id: i64) -> CancelOutcome {
        let Some(task) = self.store.get(user_id) else {
            return CancelOutcome::NotFound;
        };
        match task.status {
            TaskStatus::Processing => {
                self.store
                    .update(user_id, |task| task.cancel_requested = true);
                if let Some(token) = self.tokens.lock().get(&user_id) {
                    token.cancel();
                }
                info!("Cancel requested for user {user_id}");
                CancelOutcome::Requested
            }
            _ => {
                self.store.remove(user_id);
                self.tokens.lock().remove(&user_id);
                CancelOutcome::Removed
            }
        }
    }

    fn token(&self, user_id: i64) -> CancellationToken {
        self.tokens
            .lock()
            .entry(user_id)
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    fn should_stop(&self, user_id: i64, token: &CancellationToken) -> bool {
        token.is_cancelled()
            || self
                .store
                .get(user_id)
                .map(|task| task.cancel_requested)
                .unwrap_or(true)
    }

    /// Runs a freshly submitted batch to its end and reports the result.
    pub async fn execute(
        &self,
        user_id: i64,
        chat_id: i64,
        status_msg_id: i32,
        processor: &dyn LinkProcessor,
        reporter: &dyn BatchReporter,
    ) -> Option<BatchSummary> {
        self.attach_status_message(user_id, chat_id, status_msg_id);
        self.execute_from(user_id, chat_id, status_msg_id, RunStart::default(), processor, reporter)
            .await
    }

    async fn execute_from(
        &self,
        user_id: i64,
        chat_id: i64,
        status_msg_id: i32,
        start: RunStart,
        processor: &dyn LinkProcessor,
        reporter: &dyn BatchReporter,
    ) -> Option<BatchSummary> {
        let result = AssertUnwindSafe(self.run(
            user_id,
            chat_id,
            status_msg_id,
            start,
            processor,
            reporter,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "batch worker panicked: {}",
                panic_message(panic)
            ))
        });
        let summary = match result {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!("Batch processing error for user {user_id}: {err}");
                if let Err(report_err) = reporter
                    .update(chat_id, status_msg_id, &progress::batch_failed(&err.to_string()))
                    .await
                {
                    warn!("Failed to report batch failure: {report_err}");
                }
                None
            }
        };

        self.tokens.lock().remove(&user_id);
        let interrupted = summary
            .map(|summary| summary.outcome == BatchOutcome::Interrupted)
            .unwrap_or(false);
        if !interrupted {
            self.store.remove(user_id);
        }
        summary
    }

    async fn run(
        &self,
        user_id: i64,
        chat_id: i64,
        status_msg_id: i32,
        start: RunStart,
        processor: &dyn LinkProcessor,
        reporter: &dyn BatchReporter,
    ) -> Result<BatchSummary> {
        let task = self
            .store
            .get(user_id)
            .ok_or_else(|| anyhow::anyhow!("batch task disappeared before processing"))?;
        let links = task.links;
        let total = links.len();
        let token = self.token(user_id);
        let mut success = start.success;
        let mut failed = start.failed;
        let mut processed = start.index;

        for (index, link) in links.iter().enumerate().skip(start.index) {
            if self.should_stop(user_id, &token) {
                let outcome = if self.root.is_cancelled()
                    && self
                        .store
                        .get(user_id)
                        .map(|task| !task.cancel_requested)
                        .unwrap_or(false)
                {
                    BatchOutcome::Interrupted
                } else {
                    BatchOutcome::Cancelled
                };
                let summary = BatchSummary {
                    outcome,
                    total,
                    processed,
                    success,
                    failed,
                };
                return self
                    .finish(user_id, chat_id, status_msg_id, reporter, summary)
                    .await;
            }

            self.store
                .update(user_id, |task| task.record_progress(index + 1, success));
            let text = progress::batch_progress(index + 1, total, success, failed, link);
            if let Err(err) = reporter.update(chat_id, status_msg_id, &text).await {
                warn!("Failed to update batch progress for user {user_id}: {err}");
            }

            match processor.process(user_id, chat_id, link).await {
                Ok(true) => success += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    error!("Error processing link {link}: {err}");
                    failed += 1;
                }
            }
            processed = index + 1;
            self.store
                .update(user_id, |task| task.record_finished(index + 1, success));

            tokio::select! {
                _ = tokio::time::sleep(self.throttle) => {}
                _ = token.cancelled() => {}
            }
        }

        let outcome = if self.should_stop(user_id, &token) && processed < total {
            BatchOutcome::Cancelled
        } else {
            BatchOutcome::Completed
        };
        let summary = BatchSummary {
            outcome,
            total,
            processed,
            success,
            failed,
        };
        self.finish(user_id, chat_id, status_msg_id, reporter, summary)
            .await
    }

    async fn finish(
        &self,
        user_id: i64,
        chat_id: i64,
        status_msg_id: i32,
        reporter: &dyn BatchReporter,
        summary: BatchSummary,
    ) -> Result<BatchSummary> {
        let BatchSummary {
            outcome,
            total,
            processed,
            success,
            failed,
        } = summary;
        let text = match outcome {
            BatchOutcome::Completed => progress::batch_completed(total, success, failed),
            BatchOutcome::Cancelled => progress::batch_cancelled(processed, total, success, failed),
            BatchOutcome::Interrupted => {
                info!("Batch for user {user_id} interrupted at {processed}/{total}; it resumes on restart");
                progress::batch_interrupted(processed, total)
            }
        };
        reporter.update(chat_id, status_msg_id, &text).await?;
        info!(
            "Batch for user {user_id} finished as {:?}: total={total} processed={processed} success={success} failed={failed}",
            outcome
        );
        Ok(summary)
    }

    /// Restarts batches that were processing when the process stopped.
    ///
    /// Each resumes after the last link marked finished. A link that was in
    /// flight when the process died is relayed again. Waiting tasks stay open; finished ones are dropped.
    pub fn resume_pending(
        self: &Arc<Self>,
        processor: Arc<dyn LinkProcessor>,
        reporter: Arc<dyn BatchReporter>,
        tracker: &TaskTracker,
    ) -> usize {
        let mut resumed = 0;
        for (user_id, task) in self.store.snapshot() {
            match task.status {
                TaskStatus::WaitingForLinks => {}
                TaskStatus::Cancelled | TaskStatus::Completed => {
                    self.store.remove(user_id);
                }
                TaskStatus::Processing => {
                    let Some(chat_id) = task.chat_id else {
                        warn!("Dropping batch for user {user_id}: no chat to report to");
                        self.store.remove(user_id);
                        continue;
                    };
                    if task.cancel_requested {
                        self.store.remove(user_id);
                        continue;
                    }
                    let index = task.resume_index();
                    let success = task.success.min(index);
                    let start = RunStart {
                        index,
                        success,
                        failed: index - success,
                    };
                    self.token(user_id);

                    let manager = self.clone();
                    let processor = processor.clone();
                    let reporter = reporter.clone();
                    tracker.spawn(async move {
                        let text = progress::batch_resumed(start.index, task.total);
                        let status_msg_id = match reporter.post(chat_id, &text).await {
                            Ok(id) => id,
                            Err(err) => {
                                error!("Failed to resume batch for user {user_id}: {err}");
                                manager.tokens.lock().remove(&user_id);
                                manager.store.remove(user_id);
                                return;
                            }
                        };
                        manager.attach_status_message(user_id, chat_id, status_msg_id);
                        manager
                            .execute_from(
                                user_id,
                                chat_id,
                                status_msg_id,
                                start,
                                processor.as_ref(),
                                reporter.as_ref(),
                            )
                            .await;
                    });
                    resumed += 1;
                }
            }
        }
        if resumed > 0 {
            info!("Resumed {resumed} batches");
        }
        resumed
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::batch::store::save;
    use crate::telegram::pool::tests::MemoryStore;

    #[derive(Default)]
    struct RecordingReporter {
        posts: Mutex<Vec<String>>,
        updates: Mutex<Vec<String>>,
        fail_final: bool,
    }

    #[async_trait]
    impl BatchReporter for RecordingReporter {
        async fn post(&self, _chat_id: i64, text: &str) -> Result<i32> {
            self.posts.lock().push(text.to_string());
            Ok(100)
        }

        async fn update(&self, _chat_id: i64, _message_id: i32, text: &str) -> Result<()> {
            if self.fail_final && !text.starts_with("Processing") {
                return Err(anyhow::anyhow!("edit failed"));
            }
            self.updates.lock().push(text.to_string());
            Ok(())
        }
    }

    impl RecordingReporter {
        fn last(&self) -> String {
            self.updates.lock().last().cloned().unwrap_or_default()
        }
    }

    /// Succeeds unless the link is listed as failing; can cancel after N links.
    #[derive(Default)]
    struct ScriptedProcessor {
        failing: HashSet<String>,
        erroring: HashSet<String>,
        seen: Mutex<Vec<String>>,
        cancel_after: Option<(usize, Arc<BatchManager>)>,
    }

    #[async_trait]
    impl LinkProcessor for ScriptedProcessor {
        async fn process(&self, user_id: i64, _chat_id: i64, link: &str) -> Result<bool> {
            let count = {
                let mut seen = self.seen.lock();
                seen.push(link.to_string());
                seen.len()
            };
            if let Some((after, manager)) = &self.cancel_after {
                if count == *after {
                    assert_eq!(manager.request_cancel(user_id), CancelOutcome::Requested);
                }
            }
            if self.erroring.contains(link) {
                return Err(anyhow::anyhow!("boom"));
            }
            Ok(!self.failing.contains(link))
        }
    }

    fn links(count: usize) -> String {
        (1..=count)
            .map(|id| format!("https://t.me/chan/{id}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn manager_with(
        dir: &tempfile::TempDir,
        users: MemoryStore,
        freemium_limit: usize,
    ) -> Arc<BatchManager> {
        let store = ActiveTaskStore::open(dir.path().join("active.json"));
        Arc::new(BatchManager::new(
            store,
            Arc::new(users),
            CancellationToken::new(),
            freemium_limit,
            500,
            Duration::ZERO,
        ))
    }

    #[tokio::test]
    async fn second_start_is_rejected_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        assert_eq!(
            manager.start(1, 10).await,
            StartOutcome::Started {
                limit: 5,
                is_premium: false
            }
        );
        manager.submit_links(1, &links(2)).unwrap();
        assert_eq!(manager.start(1, 10).await, StartOutcome::AlreadyActive);
        assert_eq!(manager.task(1).unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn premium_users_get_the_premium_limit() {
        let dir = tempfile::tempdir().unwrap();
        let users = MemoryStore::default();
        users.premium.lock().push(1);
        let manager = manager_with(&dir, users, 0);
        assert_eq!(
            manager.start(1, 10).await,
            StartOutcome::Started {
                limit: 500,
                is_premium: true
            }
        );
        assert_eq!(manager.start(2, 10).await, StartOutcome::PremiumOnly);
        assert!(manager.task(2).is_none());
    }

    #[tokio::test]
    async fn over_limit_submission_leaves_the_task_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        let before = manager.task(1).unwrap();

        assert_eq!(
            manager.submit_links(1, &links(6)),
            Err(SubmitError::OverLimit { limit: 5, count: 6 })
        );
        assert_eq!(manager.task(1).unwrap(), before);
        assert_eq!(manager.submit_links(1, "  \n \n"), Err(SubmitError::Empty));
        assert_eq!(
            manager.submit_links(1, "hello\nworld"),
            Err(SubmitError::NoValidLinks)
        );
        assert_eq!(manager.task(1).unwrap(), before);
        assert_eq!(manager.submit_links(2, &links(1)), Err(SubmitError::NotWaiting));
    }

    #[tokio::test]
    async fn entries_without_marker_are_dropped_but_counted_against_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        let accepted = manager
            .submit_links(1, "https://t.me/chan/1\nnot a link\n\nhttps://t.me/chan/2")
            .unwrap();
        assert_eq!(accepted, vec!["https://t.me/chan/1", "https://t.me/chan/2"]);
        let task = manager.task(1).unwrap();
        assert_eq!(task.total, 2);
        assert_eq!(manager.submit_links(1, &links(1)), Err(SubmitError::NotWaiting));
    }

    #[tokio::test]
    async fn free_user_scenario_processes_three_links_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        assert!(matches!(
            manager.submit_links(1, &links(6)),
            Err(SubmitError::OverLimit { .. })
        ));
        manager.submit_links(1, &links(3)).unwrap();

        let processor = ScriptedProcessor::default();
        let reporter = RecordingReporter::default();
        let summary = manager.execute(1, 10, 100, &processor, &reporter).await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!((summary.total, summary.success, summary.failed), (3, 3, 0));
        assert_eq!(processor.seen.lock().clone(), links(3).lines().collect::<Vec<_>>());
        assert!(reporter.last().starts_with("Batch completed!"));
        assert!(manager.task(1).is_none());
    }

    #[tokio::test]
    async fn failures_are_counted_and_do_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(3)).unwrap();

        let processor = ScriptedProcessor {
            failing: HashSet::from(["https://t.me/chan/2".to_string()]),
            erroring: HashSet::from(["https://t.me/chan/3".to_string()]),
            ..Default::default()
        };
        let reporter = RecordingReporter::default();
        let summary = manager.execute(1, 10, 100, &processor, &reporter).await.unwrap();
        assert_eq!((summary.total, summary.success, summary.failed), (3, 1, 2));
        assert!(reporter.last().contains("Failed: 2"));
    }

    #[tokio::test]
    async fn progress_counters_stay_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(2)).unwrap();

        struct Checking(Arc<BatchManager>);

        #[async_trait]
        impl LinkProcessor for Checking {
            async fn process(&self, user_id: i64, _chat_id: i64, _link: &str) -> Result<bool> {
                let task = self.0.task(user_id).unwrap();
                assert!(task.current <= task.total);
                assert!(task.success <= task.current);
                Ok(true)
            }
        }

        let reporter = RecordingReporter::default();
        let summary = manager
            .execute(1, 10, 100, &Checking(manager.clone()), &reporter)
            .await
            .unwrap();
        assert_eq!(summary.success, 2);
    }

    #[tokio::test]
    async fn stop_after_second_link_halts_before_the_third() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(5)).unwrap();

        let processor = ScriptedProcessor {
            cancel_after: Some((2, manager.clone())),
            ..Default::default()
        };
        let reporter = RecordingReporter::default();
        let summary = manager.execute(1, 10, 100, &processor, &reporter).await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Cancelled);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.success, 2);
        assert_eq!(processor.seen.lock().len(), 2);
        assert!(reporter.last().starts_with("Batch cancelled"));
        assert!(reporter.last().contains("Progress: 2/5"));
        assert!(manager.task(1).is_none());
    }

    #[tokio::test]
    async fn cancelling_a_waiting_batch_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        assert_eq!(manager.request_cancel(1), CancelOutcome::Removed);
        assert_eq!(manager.request_cancel(1), CancelOutcome::NotFound);
        assert!(manager.task(1).is_none());
    }

    #[tokio::test]
    async fn removed_task_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(3)).unwrap();

        struct Remover(Arc<BatchManager>);

        #[async_trait]
        impl LinkProcessor for Remover {
            async fn process(&self, user_id: i64, _chat_id: i64, _link: &str) -> Result<bool> {
                self.0.store().remove(user_id);
                Ok(true)
            }
        }

        let reporter = RecordingReporter::default();
        let summary = manager
            .execute(1, 10, 100, &Remover(manager.clone()), &reporter)
            .await
            .unwrap();
        assert_eq!(summary.outcome, BatchOutcome::Cancelled);
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn final_report_failure_still_removes_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(1)).unwrap();

        let reporter = RecordingReporter {
            fail_final: true,
            ..Default::default()
        };
        let summary = manager
            .execute(1, 10, 100, &ScriptedProcessor::default(), &reporter)
            .await;
        assert!(summary.is_none());
        assert!(manager.task(1).is_none());
    }

    #[tokio::test]
    async fn shutdown_interrupts_and_keeps_the_task_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let root = CancellationToken::new();
        let store = ActiveTaskStore::open(dir.path().join("active.json"));
        let manager = Arc::new(BatchManager::new(
            store,
            Arc::new(MemoryStore::default()),
            root.clone(),
            5,
            500,
            Duration::ZERO,
        ));
        manager.start(1, 10).await;
        manager.submit_links(1, &links(3)).unwrap();

        struct Shutdown(CancellationToken);

        #[async_trait]
        impl LinkProcessor for Shutdown {
            async fn process(&self, _user_id: i64, _chat_id: i64, _link: &str) -> Result<bool> {
                self.0.cancel();
                Ok(true)
            }
        }

        let reporter = RecordingReporter::default();
        let summary = manager
            .execute(1, 10, 100, &Shutdown(root), &reporter)
            .await
            .unwrap();
        assert_eq!(summary.outcome, BatchOutcome::Interrupted);
        let task = manager.task(1).unwrap();
        assert_eq!((task.current, task.success), (1, 1));
        assert_eq!(task.resume_index(), 1);
    }

    #[tokio::test]
    async fn clean_interrupt_resumes_without_repeating_a_link() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        let mut interrupted = ActiveTask::waiting(5, 10);
        interrupted.begin_processing(links(3).lines().map(str::to_string).collect());
        interrupted.record_progress(1, 0);
        interrupted.record_finished(1, 1);
        save(&path, &HashMap::from([(1, interrupted)])).await.unwrap();

        let manager = manager_with(&dir, MemoryStore::default(), 5);
        let processor = Arc::new(ScriptedProcessor::default());
        let reporter = Arc::new(RecordingReporter::default());
        let tracker = TaskTracker::new();
        manager.resume_pending(processor.clone(), reporter.clone(), &tracker);
        tracker.close();
        tracker.wait().await;

        assert_eq!(
            processor.seen.lock().clone(),
            vec!["https://t.me/chan/2", "https://t.me/chan/3"]
        );
        assert!(reporter.last().contains("Success: 3"));
    }

    #[tokio::test]
    async fn panicking_link_still_frees_the_user() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(&dir, MemoryStore::default(), 5);
        manager.start(1, 10).await;
        manager.submit_links(1, &links(2)).unwrap();

        struct Panics;

        #[async_trait]
        impl LinkProcessor for Panics {
            async fn process(&self, _user_id: i64, _chat_id: i64, _link: &str) -> Result<bool> {
                panic!("relay exploded");
            }
        }

        let reporter = Arc::new(RecordingReporter::default());
        let task_manager = manager.clone();
        let task_reporter = reporter.clone();
        let joined = tokio::spawn(async move {
            task_manager
                .execute(1, 10, 100, &Panics, task_reporter.as_ref())
                .await
        })
        .await;

        assert!(matches!(joined, Ok(None)));
        assert!(manager.task(1).is_none());
        assert!(reporter.last().contains("relay exploded"));
        assert_eq!(
            manager.start(1, 10).await,
            StartOutcome::Started {
                limit: 5,
                is_premium: false
            }
        );
    }

    #[tokio::test]
    async fn resume_restarts_from_the_unfinished_link() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        let mut processing = ActiveTask::waiting(5, 10);
        processing.begin_processing(links(4).lines().map(str::to_string).collect());
        processing.record_finished(2, 2);
        processing.record_progress(3, 2);
        let mut done = ActiveTask::waiting(5, 30);
        done.status = TaskStatus::Completed;
        let tasks = HashMap::from([
            (1, processing),
            (2, ActiveTask::waiting(5, 20)),
            (3, done),
        ]);
        save(&path, &tasks).await.unwrap();

        let manager = manager_with(&dir, MemoryStore::default(), 5);
        let processor = Arc::new(ScriptedProcessor::default());
        let reporter = Arc::new(RecordingReporter::default());
        let tracker = TaskTracker::new();
        let resumed = manager.resume_pending(processor.clone(), reporter.clone(), &tracker);
        tracker.close();
        tracker.wait().await;

        assert_eq!(resumed, 1);
        assert_eq!(
            processor.seen.lock().clone(),
            vec!["https://t.me/chan/3", "https://t.me/chan/4"]
        );
        assert!(reporter.posts.lock()[0].contains("2/4"));
        assert!(reporter.last().contains("Success: 4"));
        assert!(manager.task(1).is_none());
        assert!(manager.is_waiting_for_links(2));
        assert!(manager.task(3).is_none());
    }
}
