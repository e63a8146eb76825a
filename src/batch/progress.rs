use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::telegram::client::{ChatClient, TransferProgress};

const MIB: f64 = 1024.0 * 1024.0;
const LINK_PREVIEW_CHARS: usize = 50;

/// Percentage points between progress edits; bigger files get coarser updates.
pub fn progress_step(total_bytes: u64) -> u64 {
    const MIB_U64: u64 = 1024 * 1024;
    if total_bytes >= 100 * MIB_U64 {
        10
    } else if total_bytes >= 50 * MIB_U64 {
        20
    } else if total_bytes >= 10 * MIB_U64 {
        30
    } else {
        50
    }
}

/// Lets through one update per step change plus the final 100%.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    last_step: Option<u64>,
    finished: bool,
}

impl ProgressThrottle {
    pub fn should_report(&mut self, done: u64, total: u64) -> bool {
        if total == 0 || self.finished {
            return false;
        }
        let percent = (done.min(total) * 100) / total;
        if percent >= 100 {
            self.finished = true;
            self.last_step = Some(100);
            return true;
        }
        let interval = progress_step(total);
        let step = (percent / interval) * interval;
        if self.last_step == Some(step) {
            return false;
        }
        self.last_step = Some(step);
        true
    }
}

fn format_eta(seconds: u64) -> String {
    format!("{:02}:{:02}", (seconds / 60).min(99), seconds % 60)
}

pub fn render_transfer(label: &str, done: u64, total: u64, elapsed: Duration) -> String {
    let percent = if total > 0 {
        done as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let filled = ((percent / 10.0) as usize).min(10);
    let bar = format!("[{}{}]", "#".repeat(filled), "-".repeat(10 - filled));
    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 { done as f64 / secs } else { 0.0 };
    let eta = if speed > 0.0 {
        format_eta((total.saturating_sub(done) as f64 / speed) as u64)
    } else {
        format_eta(0)
    };
    format!(
        "{label}\n\n{bar}\n\nCompleted: {:.2} MB / {:.2} MB\nDone: {percent:.2}%\nSpeed: {:.2} MB/s\nETA: {eta}",
        done as f64 / MIB,
        total as f64 / MIB,
        speed / MIB,
    )
}

/// Edits a status message as transfer progress arrives, throttled per step.
pub fn watch_transfer(
    client: Arc<dyn ChatClient>,
    chat_id: i64,
    message_id: i32,
    label: &'static str,
    mut receiver: watch::Receiver<TransferProgress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut throttle = ProgressThrottle::default();
        while receiver.changed().await.is_ok() {
            let progress = *receiver.borrow_and_update();
            if !throttle.should_report(progress.done, progress.total) {
                continue;
            }
            let text = render_transfer(label, progress.done, progress.total, started.elapsed());
            if let Err(err) = client.edit_text(chat_id, message_id, &text).await {
                debug!("Progress edit failed: {err}");
            }
        }
    })
}

fn preview_link(link: &str) -> String {
    if link.chars().count() <= LINK_PREVIEW_CHARS {
        return link.to_string();
    }
    let head: String = link.chars().take(LINK_PREVIEW_CHARS).collect();
    format!("{head}...")
}

pub fn batch_prompt(is_premium: bool, limit: usize) -> String {
    format!(
        "Send me the links to extract (one per line)\n\n{}\nBatch limit: {limit} links\n\nExample:\nhttps://t.me/channelname/123\nhttps://t.me/c/1234567890/123\n\nSend /cancel to cancel this operation.",
        if is_premium { "Premium user" } else { "Free user" }
    )
}

pub fn batch_started(total: usize) -> String {
    format!("Starting batch extraction...\n\nTotal links: {total}\nStatus: processing\n\nUse /stop to cancel.")
}

pub fn batch_progress(position: usize, total: usize, success: usize, failed: usize, link: &str) -> String {
    format!(
        "Processing batch...\n\nProgress: {position}/{total}\nSuccess: {success}\nFailed: {failed}\n\nCurrent: {}\n\nUse /stop to cancel.",
        preview_link(link)
    )
}

pub fn batch_cancelled(processed: usize, total: usize, success: usize, failed: usize) -> String {
    format!(
        "Batch cancelled\n\nProgress: {processed}/{total}\nSuccess: {success}\nFailed: {failed}"
    )
}

pub fn batch_completed(total: usize, success: usize, failed: usize) -> String {
    format!("Batch completed!\n\nTotal: {total}\nSuccess: {success}\nFailed: {failed}")
}

pub fn batch_interrupted(processed: usize, total: usize) -> String {
    format!("Batch paused by a restart at {processed}/{total}. It will continue automatically.")
}

pub fn batch_resumed(processed: usize, total: usize) -> String {
    format!("Resuming batch after a restart...\n\nProgress: {processed}/{total}\n\nUse /stop to cancel.")
}

pub fn batch_failed(reason: &str) -> String {
    format!("Batch failed: {reason}")
}
