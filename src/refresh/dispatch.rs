//! Delivery of a selected photo to a display agent: a configured post
//! command, a multipart upload, or a plain url form post.

use super::job::RefreshJob;
use crate::collections::PhotoInfo;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// How a photo reaches the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostMode {
    /// Run a configured argv template instead of an HTTP post.
    Command(Vec<String>),
    /// Stream the local file as `multipart/form-data` (remote agent,
    /// `file://` photo).
    Multipart,
    /// Send the photo URL in an url-encoded form.
    UrlForm,
}

pub fn decide_post_mode(
    job: &RefreshJob,
    photo_url: &str,
    post_commands: &BTreeMap<String, Vec<String>>,
) -> PostMode {
    if !job.post_command_id.is_empty() {
        if let Some(argv) = post_commands.get(&job.post_command_id) {
            return PostMode::Command(argv.clone());
        }
        tracing::error!(
            "No post command configured for id \"{}\"",
            job.post_command_id
        );
    }

    if !job.hostname_is_local() && local_file_path(photo_url).is_some() {
        return PostMode::Multipart;
    }
    PostMode::UrlForm
}

/// The local path behind a `file://` (or scheme-less) URL, percent-decoded.
pub fn local_file_path(url: &str) -> Option<PathBuf> {
    let path = if let Some(rest) = url.strip_prefix("file://") {
        rest
    } else if url.contains("://") {
        return None;
    } else {
        url
    };
    let decoded = urlencoding::decode(path).ok()?;
    Some(PathBuf::from(decoded.into_owned()))
}

/// Side-channel metadata forwarded with every submission.
fn info_json(info: &PhotoInfo, capture_date: Option<&str>) -> JsonValue {
    let mut payload = serde_json::Map::new();
    payload.insert("path".to_string(), JsonValue::String(info.path.clone()));
    payload.insert(
        "collection".to_string(),
        JsonValue::String(info.collection_name.clone()),
    );
    if let Some(capture_date) = capture_date {
        payload.insert(
            "capture_date".to_string(),
            JsonValue::String(capture_date.to_string()),
        );
    }
    JsonValue::Object(payload)
}

fn option_fields(job: &RefreshJob) -> Vec<(String, String)> {
    job.affiche_options
        .as_object()
        .map(|options| {
            options
                .iter()
                .map(|(name, value)| {
                    let text = match value {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Post one photo to the job's agent according to the decided mode.
pub async fn post_photo(
    client: &reqwest::Client,
    job: &RefreshJob,
    info: &PhotoInfo,
    capture_date: Option<&str>,
    post_commands: &BTreeMap<String, Vec<String>>,
) -> Result<()> {
    let info_payload = info_json(info, capture_date);

    match decide_post_mode(job, &info.url, post_commands) {
        PostMode::Command(argv) => run_post_command(job, info, &info_payload, argv).await,
        PostMode::Multipart => post_multipart(client, job, info, &info_payload).await,
        PostMode::UrlForm => post_url_form(client, job, info, &info_payload).await,
    }
}

async fn run_post_command(
    job: &RefreshJob,
    info: &PhotoInfo,
    info_payload: &JsonValue,
    argv: Vec<String>,
) -> Result<()> {
    let photo_path = local_file_path(&info.url)
        .ok_or_else(|| anyhow!("post command requires a local file, got \"{}\"", info.url))?;

    let argv: Vec<String> = argv
        .into_iter()
        .map(|argument| argument.replace("%HOSTNAME%", &job.hostname))
        .collect();
    let (program, arguments) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty post command for id \"{}\"", job.post_command_id))?;

    let options_json = serde_json::to_string(&job.affiche_options)?;
    let info_json = serde_json::to_string(info_payload)?;
    debug!("Running post command {} for \"{}\"", program, job.identifier);

    let status = tokio::process::Command::new(program)
        .args(arguments)
        .arg(&photo_path)
        .arg("--options")
        .arg(&options_json)
        .arg("--info")
        .arg(&info_json)
        .status()
        .await
        .with_context(|| format!("failed to run post command \"{}\"", program))?;

    if !status.success() {
        bail!("post command \"{}\" exited with {}", program, status);
    }
    Ok(())
}

async fn post_multipart(
    client: &reqwest::Client,
    job: &RefreshJob,
    info: &PhotoInfo,
    info_payload: &JsonValue,
) -> Result<()> {
    let photo_path = local_file_path(&info.url).expect("multipart mode implies a local file");
    let file_name = photo_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "photo".to_string());
    let bytes = tokio::fs::read(&photo_path)
        .await
        .with_context(|| format!("failed to read {:?}", photo_path))?;

    let mut form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        )
        .text("info", serde_json::to_string(info_payload)?);
    for (name, value) in option_fields(job) {
        form = form.text(name, value);
    }

    info!("Posting \"{}\" to {} as multipart", info.url, job.hostname);
    client
        .post(format!("http://{}", job.hostname))
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn post_url_form(
    client: &reqwest::Client,
    job: &RefreshJob,
    info: &PhotoInfo,
    info_payload: &JsonValue,
) -> Result<()> {
    let mut fields: Vec<(String, String)> = vec![
        ("url".to_string(), info.url.clone()),
        ("info".to_string(), serde_json::to_string(info_payload)?),
    ];
    fields.extend(option_fields(job));

    info!("Posting \"{}\" to {} as url", info.url, job.hostname);
    client
        .post(format!("http://{}", job.hostname))
        .form(&fields)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo_store::RefreshJobRecord;
    use serde_json::json;

    fn make_job(hostname: &str, post_command_id: &str) -> RefreshJob {
        RefreshJob::from_record(RefreshJobRecord {
            id: None,
            identifier: "hall".to_string(),
            display_name: "Hallway".to_string(),
            hostname: hostname.to_string(),
            schedule: String::new(),
            enabled: true,
            filter: "true".to_string(),
            order: "SHUFFLE".to_string(),
            affiche_options: json!({"rotation": "landscape", "exposure": 1.5}),
            post_command_id: post_command_id.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_local_file_path() {
        assert_eq!(
            local_file_path("file:///photos/a%20b.jpg"),
            Some(PathBuf::from("/photos/a b.jpg"))
        );
        assert_eq!(
            local_file_path("/photos/plain.jpg"),
            Some(PathBuf::from("/photos/plain.jpg"))
        );
        assert_eq!(local_file_path("http://example.test/a.jpg"), None);
    }

    #[test]
    fn test_local_host_with_file_url_posts_url_form() {
        let job = make_job("localhost:80", "");
        let mode = decide_post_mode(&job, "file:///photos/a.jpg", &BTreeMap::new());
        assert_eq!(mode, PostMode::UrlForm);
    }

    #[test]
    fn test_remote_host_with_file_url_posts_multipart() {
        let job = make_job("peer.example:80", "");
        let mode = decide_post_mode(&job, "file:///photos/a.jpg", &BTreeMap::new());
        assert_eq!(mode, PostMode::Multipart);
    }

    #[test]
    fn test_remote_host_with_remote_url_posts_url_form() {
        let job = make_job("peer.example:80", "");
        let mode = decide_post_mode(&job, "http://cloud.test/a.jpg", &BTreeMap::new());
        assert_eq!(mode, PostMode::UrlForm);
    }

    #[test]
    fn test_post_command_takes_precedence() {
        let job = make_job("peer.example:80", "panel");
        let mut commands = BTreeMap::new();
        commands.insert(
            "panel".to_string(),
            vec!["write-panel".to_string(), "--host".to_string(), "%HOSTNAME%".to_string()],
        );
        let mode = decide_post_mode(&job, "file:///photos/a.jpg", &commands);
        assert_eq!(
            mode,
            PostMode::Command(vec![
                "write-panel".to_string(),
                "--host".to_string(),
                "%HOSTNAME%".to_string(),
            ])
        );
    }

    #[test]
    fn test_unknown_post_command_falls_back_to_http() {
        let job = make_job("localhost:80", "missing");
        let mode = decide_post_mode(&job, "file:///photos/a.jpg", &BTreeMap::new());
        assert_eq!(mode, PostMode::UrlForm);
    }

    #[test]
    fn test_option_fields_stringify_values() {
        let job = make_job("localhost", "");
        let mut fields = option_fields(&job);
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("exposure".to_string(), "1.5".to_string()),
                ("rotation".to_string(), "landscape".to_string()),
            ]
        );
    }

    #[test]
    fn test_info_json_shape() {
        let info = PhotoInfo {
            url: "file:///photos/a.jpg".to_string(),
            path: "summer/a.jpg".to_string(),
            collection_name: "Family".to_string(),
        };
        let payload = info_json(&info, Some("2023-08-15T12:00:00+00:00"));
        assert_eq!(payload["path"], "summer/a.jpg");
        assert_eq!(payload["collection"], "Family");
        assert_eq!(payload["capture_date"], "2023-08-15T12:00:00+00:00");

        let payload = info_json(&info, None);
        assert!(payload.get("capture_date").is_none());
    }
}
