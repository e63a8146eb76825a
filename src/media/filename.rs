use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::telegram::client::Media;

const MAX_FILENAME_CHARS: usize = 255;

static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*']"#).expect("valid filename regex"));

/// Replaces characters most file systems reject, trims spaces and dots at
/// both ends and caps the name at 255 characters.
pub fn sanitize(filename: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(filename, "_");
    let trimmed = replaced.trim_matches(|ch: char| ch == ' ' || ch == '.');
    trimmed.chars().take(MAX_FILENAME_CHARS).collect()
}

/// Name a downloaded attachment gets before any rename rule.
pub fn default_file_name(media: &Media, unix_time: i64) -> String {
    match media {
        Media::Document { file_name, .. } => file_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "document".to_string()),
        Media::Video { .. } => format!("video_{unix_time}.mp4"),
        Media::Audio { file_name, .. } => file_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("audio_{unix_time}.mp3")),
        Media::Photo { .. } => format!("photo_{unix_time}.jpg"),
        _ => format!("file_{unix_time}"),
    }
}

/// Applies the user's rename tag, keeping the original extension.
pub fn apply_rename_tag(file_name: &str, rename_tag: Option<&str>) -> String {
    let Some(tag) = rename_tag.map(str::trim).filter(|tag| !tag.is_empty()) else {
        return file_name.to_string();
    };
    match Path::new(file_name).extension() {
        Some(ext) => format!("{tag}.{}", ext.to_string_lossy()),
        None => tag.to_string(),
    }
}

/// Per-user scratch directory for downloads.
pub fn user_download_dir(root: &Path, user_id: i64) -> PathBuf {
    root.join(user_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::client::FileRef;

    fn file() -> FileRef {
        FileRef {
            file_id: "id".to_string(),
            file_size: 1,
        }
    }

    #[test]
    fn sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize(r#"a<b>c:d"e/f\g|h?i*j'k.mp4"#), "a_b_c_d_e_f_g_h_i_j_k.mp4");
    }

    #[test]
    fn sanitize_trims_spaces_and_dots() {
        assert_eq!(sanitize("  ..name.txt.. "), "name.txt");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(400);
        assert_eq!(sanitize(&long).chars().count(), 255);
        let unicode = "é".repeat(300);
        assert_eq!(sanitize(&unicode).chars().count(), 255);
    }

    #[test]
    fn default_names_follow_media_kind() {
        let doc = Media::Document {
            file: file(),
            file_name: Some("report.pdf".to_string()),
        };
        assert_eq!(default_file_name(&doc, 10), "report.pdf");
        let unnamed = Media::Document {
            file: file(),
            file_name: None,
        };
        assert_eq!(default_file_name(&unnamed, 10), "document");
        let video = Media::Video {
            file: file(),
            duration: 1,
            width: 1,
            height: 1,
            file_name: Some("ignored.mkv".to_string()),
        };
        assert_eq!(default_file_name(&video, 10), "video_10.mp4");
        let voice = Media::Voice {
            file: file(),
            duration: 1,
        };
        assert_eq!(default_file_name(&voice, 10), "file_10");
    }

    #[test]
    fn rename_tag_keeps_extension() {
        assert_eq!(apply_rename_tag("video_1.mp4", Some("My Show")), "My Show.mp4");
        assert_eq!(apply_rename_tag("document", Some("Notes")), "Notes");
        assert_eq!(apply_rename_tag("video_1.mp4", Some("  ")), "video_1.mp4");
        assert_eq!(apply_rename_tag("video_1.mp4", None), "video_1.mp4");
    }
}
