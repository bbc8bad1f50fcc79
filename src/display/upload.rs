//! Upload intake: job ids, file name handling, and temp directory
//! preparation for the display agent.

use anyhow::{Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A random 120-bit job id, hex-encoded.
pub fn random_job_id() -> String {
    let mut bytes = [0u8; 15];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Reduce an untrusted file name to a safe flat name: path separators and
/// non-portable characters collapse to underscores, leading dots are
/// stripped.
pub fn sanitize_file_name(name: &str) -> String {
    let flattened = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let sanitized: String = flattened
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.').to_string();
    if sanitized.is_empty() {
        "image".to_string()
    } else {
        sanitized
    }
}

/// Tag a file name with a job id: `photo.jpg` becomes `photo_<id>.jpg`.
pub fn with_job_suffix(file_name: &str, job_id: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => {
            format!("{}_{}.{}", stem, job_id, extension)
        }
        _ => format!("{}_{}", file_name, job_id),
    }
}

/// Derive a file name for a URL download: the Content-Disposition file name,
/// else the URL path's last segment when it carries a suffix, else the
/// fallback stem.
pub fn file_name_from_url(url: &str, content_disposition: Option<&str>, fallback: &str) -> String {
    if let Some(disposition) = content_disposition {
        if let Some(name) = parse_disposition_file_name(disposition) {
            return sanitize_file_name(&name);
        }
    }

    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    if let Some(segment) = path.rsplit('/').next() {
        if let Ok(decoded) = urlencoding::decode(segment) {
            let decoded = decoded.into_owned();
            if decoded.rsplit_once('.').map(|(stem, _)| !stem.is_empty()).unwrap_or(false) {
                return sanitize_file_name(&decoded);
            }
        }
    }

    sanitize_file_name(fallback)
}

fn parse_disposition_file_name(disposition: &str) -> Option<String> {
    let lower = disposition.to_ascii_lowercase();
    let start = lower.find("filename=")? + "filename=".len();
    let value = disposition[start..].trim();
    let value = value.split(';').next()?.trim();
    let value = value.trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Create the upload and preview directories and wipe stale files left from
/// a previous run.
pub fn prepare_temp_dirs(temp_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let upload_dir = temp_path.join("upload");
    let preview_dir = temp_path.join("preview");
    for dir in [&upload_dir, &preview_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create temp directory {:?}", dir))?;
        delete_all_files(dir);
    }
    Ok((upload_dir, preview_dir))
}

fn delete_all_files(directory: &Path) {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Can't delete stale file {:?}: {}", path, e);
            }
        }
    }
}
