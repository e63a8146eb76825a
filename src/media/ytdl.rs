use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::utils::http::get_http_client;

const MAX_CONCURRENT_EXTRACTIONS: usize = 2;
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "webm", "avi"];
const COOKIE_PLACEHOLDERS: [&str; 2] = ["# write here yt cookies", "# write up here insta cookies"];

#[derive(Error, Debug)]
pub enum YtdlError {
    #[error("A download is already running for this user")]
    Busy,

    #[error("Download cancelled")]
    Cancelled,

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Downloaded file not found after extraction")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YtdlMode {
    Video,
    Audio,
}

impl YtdlMode {
    fn args(self) -> Vec<&'static str> {
        match self {
            YtdlMode::Video => vec!["-f", "best[height<=720]/best"],
            YtdlMode::Audio => vec![
                "-f",
                "bestaudio/best",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
            ],
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            YtdlMode::Video => &VIDEO_EXTENSIONS,
            YtdlMode::Audio => &["mp3"],
        }
    }
}

/// Subset of the info JSON yt-dlp prints after downloading.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct YtdlInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnail: Option<String>,
}

impl YtdlInfo {
    pub fn duration_secs(&self) -> u32 {
        self.duration
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| secs.round() as u32)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub info: YtdlInfo,
}

/// Picks the cookie text configured for the URL's site, ignoring placeholders.
pub fn cookies_for_url<'a>(url: &str, yt_cookies: &'a str, insta_cookies: &'a str) -> Option<&'a str> {
    let host = Url::parse(url).ok()?.host_str()?.trim_start_matches("www.").to_lowercase();
    let cookies = if host.ends_with("youtube.com") || host == "youtu.be" {
        yt_cookies
    } else if host.ends_with("instagram.com") {
        insta_cookies
    } else {
        return None;
    };
    let trimmed = cookies.trim();
    if trimmed.is_empty() || COOKIE_PLACEHOLDERS.contains(&trimmed) {
        return None;
    }
    Some(cookies)
}

pub fn format_duration(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub fn build_caption(info: &YtdlInfo, size_bytes: u64, mode: YtdlMode) -> String {
    let fallback = match mode {
        YtdlMode::Video => "Extracted Video",
        YtdlMode::Audio => "Extracted Audio",
    };
    let title = info
        .title
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(fallback);
    let mut caption = format!(
        "{title}\n\nSize: {:.1} MB\nDuration: {}",
        size_bytes as f64 / (1024.0 * 1024.0),
        format_duration(info.duration_secs())
    );
    if mode == YtdlMode::Video {
        caption.push_str(&format!(
            "\nResolution: {}x{}",
            info.width.unwrap_or(0),
            info.height.unwrap_or(0)
        ));
    }
    caption
}

fn parse_info(stdout: &[u8]) -> YtdlInfo {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<YtdlInfo>(line.trim()).ok())
        .unwrap_or_default()
}

fn find_output(base: &Path, mode: YtdlMode) -> Option<PathBuf> {
    mode.extensions()
        .iter()
        .map(|ext| base.with_extension(ext))
        .find(|candidate| candidate.exists())
}

/// Removes its file when dropped.
pub struct TempFile(pub PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {err}", self.0.display());
            }
        }
    }
}

/// Ownership of a user's single download slot; released on drop.
pub struct DownloadSlot {
    user_id: i64,
    token: CancellationToken,
    ongoing: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl DownloadSlot {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for DownloadSlot {
    fn drop(&mut self) {
        self.ongoing.lock().remove(&self.user_id);
    }
}

#[derive(Clone)]
pub struct YtdlRunner {
    bin: String,
    work_dir: PathBuf,
    yt_cookies: String,
    insta_cookies: String,
    permits: Arc<Semaphore>,
    ongoing: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl YtdlRunner {
    pub fn new(bin: &str, work_dir: PathBuf, yt_cookies: &str, insta_cookies: &str) -> Self {
        YtdlRunner {
            bin: bin.to_string(),
            work_dir,
            yt_cookies: yt_cookies.to_string(),
            insta_cookies: insta_cookies.to_string(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_EXTRACTIONS)),
            ongoing: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claims the user's download slot; fails if one is already running.
    pub fn begin(&self, user_id: i64, parent: &CancellationToken) -> Result<DownloadSlot, YtdlError> {
        let mut ongoing = self.ongoing.lock();
        if ongoing.contains_key(&user_id) {
            return Err(YtdlError::Busy);
        }
        let token = parent.child_token();
        ongoing.insert(user_id, token.clone());
        Ok(DownloadSlot {
            user_id,
            token,
            ongoing: self.ongoing.clone(),
        })
    }

    pub fn cancel_user(&self, user_id: i64) -> bool {
        match self.ongoing.lock().get(&user_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, user_id: i64) -> bool {
        self.ongoing.lock().contains_key(&user_id)
    }

    /// Downloads `url`; the caller owns the returned file.
    pub async fn download(
        &self,
        slot: &DownloadSlot,
        url: &str,
        mode: YtdlMode,
    ) -> Result<Downloaded, YtdlError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let base = self
            .work_dir
            .join(format!("ytdl_{}_{}", slot.user_id, Uuid::new_v4().simple()));

        let cookie_file = match cookies_for_url(url, &self.yt_cookies, &self.insta_cookies) {
            Some(cookies) => {
                let path = base.with_extension("cookies.txt");
                tokio::fs::write(&path, cookies).await?;
                Some(TempFile(path))
            }
            None => None,
        };

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| YtdlError::Cancelled)?,
            _ = slot.token.cancelled() => return Err(YtdlError::Cancelled),
        };

        let mut command = Command::new(&self.bin);
        command
            .args(mode.args())
            .args(["--no-playlist", "--quiet", "--no-warnings", "--no-simulate", "--dump-json"])
            .arg("-o")
            .arg(format!("{}.%(ext)s", base.display()));
        if let Some(cookie_file) = &cookie_file {
            command.arg("--cookies").arg(&cookie_file.0);
        }
        command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting {:?} extraction for user {}: {url}", mode, slot.user_id);
        let output = tokio::select! {
            output = command.output() => output?,
            _ = slot.token.cancelled() => {
                debug!("Extraction for user {} cancelled", slot.user_id);
                Self::remove_outputs(&base, mode).await;
                return Err(YtdlError::Cancelled);
            }
        };
        drop(cookie_file);

        if !output.status.success() {
            Self::remove_outputs(&base, mode).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("yt-dlp exited with an error")
                .to_string();
            return Err(YtdlError::Failed(reason));
        }

        let info = parse_info(&output.stdout);
        let path = find_output(&base, mode).ok_or(YtdlError::NotFound)?;
        Ok(Downloaded { path, info })
    }

    async fn remove_outputs(base: &Path, mode: YtdlMode) {
        for ext in mode.extensions() {
            let _ = tokio::fs::remove_file(base.with_extension(ext)).await;
        }
    }
}

/// Fetches a remote thumbnail; `None` on any failure.
pub async fn fetch_thumbnail(url: &str, destination: &Path) -> Option<PathBuf> {
    let response = match get_http_client().get(url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!("Thumbnail request returned {}", response.status());
            return None;
        }
        Err(err) => {
            warn!("Failed to download thumbnail: {err}");
            return None;
        }
    };
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to read thumbnail body: {err}");
            return None;
        }
    };
    match tokio::fs::write(destination, &bytes).await {
        Ok(()) => Some(destination.to_path_buf()),
        Err(err) => {
            warn!("Failed to save thumbnail: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_follow_the_site() {
        let yt = "yt-cookie";
        let insta = "insta-cookie";
        assert_eq!(cookies_for_url("https://www.youtube.com/watch?v=1", yt, insta), Some(yt));
        assert_eq!(cookies_for_url("https://youtu.be/abc", yt, insta), Some(yt));
        assert_eq!(cookies_for_url("https://instagram.com/p/x", yt, insta), Some(insta));
        assert_eq!(cookies_for_url("https://vimeo.com/1", yt, insta), None);
        assert_eq!(
            cookies_for_url("https://youtube.com/x", "# write here yt cookies", insta),
            None
        );
        assert_eq!(cookies_for_url("https://youtube.com/x", "   ", insta), None);
    }

    #[test]
    fn captions_carry_size_duration_and_resolution() {
        let info = YtdlInfo {
            title: Some("Clip".to_string()),
            duration: Some(125.4),
            width: Some(1280),
            height: Some(720),
            thumbnail: None,
        };
        assert_eq!(
            build_caption(&info, 3 * 1024 * 1024, YtdlMode::Video),
            "Clip\n\nSize: 3.0 MB\nDuration: 2:05\nResolution: 1280x720"
        );
        assert_eq!(
            build_caption(&YtdlInfo::default(), 0, YtdlMode::Audio),
            "Extracted Audio\n\nSize: 0.0 MB\nDuration: 0:00"
        );
    }

    #[test]
    fn info_is_read_from_the_last_json_line() {
        let stdout = b"noise\n{\"title\":\"A\",\"duration\":3.0}\n";
        let info = parse_info(stdout);
        assert_eq!(info.title.as_deref(), Some("A"));
        assert_eq!(info.duration_secs(), 3);
        assert_eq!(parse_info(b"nothing"), YtdlInfo::default());
    }

    #[test]
    fn output_lookup_tries_each_extension() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ytdl_1_x");
        assert!(find_output(&base, YtdlMode::Video).is_none());
        std::fs::write(base.with_extension("webm"), b"v").unwrap();
        assert_eq!(find_output(&base, YtdlMode::Video), Some(base.with_extension("webm")));
        assert!(find_output(&base, YtdlMode::Audio).is_none());
    }

    #[test]
    fn one_download_slot_per_user() {
        let runner = YtdlRunner::new("yt-dlp", PathBuf::from("unused"), "", "");
        let root = CancellationToken::new();
        let slot = runner.begin(1, &root).unwrap();
        assert!(matches!(runner.begin(1, &root), Err(YtdlError::Busy)));
        assert!(runner.begin(2, &root).is_ok());

        assert!(runner.cancel_user(1));
        assert!(slot.token().is_cancelled());
        drop(slot);
        assert!(!runner.is_busy(1));
        assert!(!runner.cancel_user(1));
    }
}
