use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMetadata {
    pub duration: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_seconds(value: Option<&str>) -> Option<u32> {
    value
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.round() as u32)
}

fn parse_probe_output(raw: &[u8]) -> Result<VideoMetadata> {
    let parsed: ProbeOutput = serde_json::from_slice(raw)?;
    let video = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let duration = parsed
        .format
        .as_ref()
        .and_then(|format| parse_seconds(format.duration.as_deref()))
        .or_else(|| video.and_then(|stream| parse_seconds(stream.duration.as_deref())))
        .unwrap_or(0);
    Ok(VideoMetadata {
        duration,
        width: video.and_then(|stream| stream.width).unwrap_or(0),
        height: video.and_then(|stream| stream.height).unwrap_or(0),
    })
}

/// Reads duration and frame size with ffprobe; zeros when unavailable.
pub async fn video_metadata(path: &Path) -> VideoMetadata {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => match parse_probe_output(&output.stdout) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Unreadable ffprobe output for {}: {err}", path.display());
                VideoMetadata::default()
            }
        },
        Ok(output) => {
            warn!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            VideoMetadata::default()
        }
        Err(err) => {
            warn!("Failed to execute ffprobe: {err}");
            VideoMetadata::default()
        }
    }
}

/// Grabs a preview frame at half the duration.
pub async fn screenshot(path: &Path, duration: u32, output_dir: &Path) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "preview".to_string());
    let target = output_dir.join(format!("{stem}_thumb.jpg"));
    let at = format!("{}", duration / 2);

    let output = Command::new("ffmpeg")
        .args(["-y", "-loglevel", "error", "-ss", &at, "-i"])
        .arg(path)
        .args(["-vframes", "1", "-q:v", "2"])
        .arg(&target)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| anyhow!("Failed to execute ffmpeg: {err}"))?;

    if !output.status.success() || !target.exists() {
        return Err(anyhow!(
            "ffmpeg screenshot failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(target)
}

/// External binaries the media features rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolSupport {
    pub ffmpeg: bool,
    pub ffprobe: bool,
    pub ytdl: bool,
}

async fn tool_runs(bin: &str, version_flag: &str) -> bool {
    match Command::new(bin)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

pub async fn probe_tools(ytdl_bin: &str) -> ToolSupport {
    let support = ToolSupport {
        ffmpeg: tool_runs("ffmpeg", "-version").await,
        ffprobe: tool_runs("ffprobe", "-version").await,
        ytdl: tool_runs(ytdl_bin, "--version").await,
    };
    info!(
        "Tool check: ffmpeg={} ffprobe={} {}={}",
        support.ffmpeg, support.ffprobe, ytdl_bin, support.ytdl
    );
    if !support.ffprobe || !support.ffmpeg {
        warn!("ffmpeg/ffprobe missing; re-uploaded videos will lack metadata and previews");
    }
    if !support.ytdl {
        warn!("{ytdl_bin} missing; /dl and /adl are disabled");
    }
    support
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_video_stream_and_format_duration() {
        let raw = br#"{
            "streams": [
                {"codec_type": "audio", "duration": "12.0"},
                {"codec_type": "video", "width": 1280, "height": 720, "duration": "11.9"}
            ],
            "format": {"duration": "12.4"}
        }"#;
        assert_eq!(
            parse_probe_output(raw).unwrap(),
            VideoMetadata {
                duration: 12,
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let raw = br#"{"streams": [{"codec_type": "video", "width": 640, "height": 360, "duration": "7.6"}]}"#;
        assert_eq!(parse_probe_output(raw).unwrap().duration, 8);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_tools_report_false() {
        assert!(!tool_runs("definitely-not-a-real-binary-xyz", "--version").await);
    }
}
