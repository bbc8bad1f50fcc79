//! The single-slot display job engine.
//!
//! Exactly one conversion job runs at a time. The engine's state quadruple
//! `(status, sub_status, preview, image_info)` lives behind a watch channel:
//! every mutation publishes a new snapshot, which gives status observers (and
//! the SSE stream) a totally ordered, monotone view of each job.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ready,
    Failed,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubStatus {
    None,
    Launching,
    Converting,
    Displaying,
}

/// One published engine state. `preview` is the current preview file name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub status: Status,
    #[serde(rename = "subStatus")]
    pub sub_status: SubStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(rename = "imageInfo", skip_serializing_if = "Option::is_none")]
    pub image_info: Option<JsonValue>,
}

impl EngineSnapshot {
    fn initial() -> Self {
        Self {
            status: Status::Ready,
            sub_status: SubStatus::None,
            preview: None,
            image_info: None,
        }
    }

    /// The JSON served to clients; the preview name becomes a fetchable path.
    pub fn to_client_json(&self) -> JsonValue {
        let mut payload = json!({
            "status": self.status,
            "subStatus": self.sub_status,
        });
        if let Some(preview) = &self.preview {
            payload["preview"] = JsonValue::String(format!("/preview/{}", preview));
        }
        if let Some(image_info) = &self.image_info {
            payload["imageInfo"] = image_info.clone();
        }
        payload
    }
}

fn status_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Status: (LAUNCHING|CONVERTING|DISPLAYING)\s*$").unwrap())
}

pub struct DisplayEngine {
    command: Vec<String>,
    upload_dir: PathBuf,
    preview_dir: PathBuf,
    state_tx: watch::Sender<EngineSnapshot>,
}

impl DisplayEngine {
    pub fn new(command: Vec<String>, upload_dir: PathBuf, preview_dir: PathBuf) -> Self {
        let (state_tx, _) = watch::channel(EngineSnapshot::initial());
        Self {
            command,
            upload_dir,
            preview_dir,
            state_tx,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn preview_dir(&self) -> &Path {
        &self.preview_dir
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.state_tx.borrow().status == Status::Busy
    }

    /// Accept an upload and start its conversion job. Returns false without
    /// side effects when a job is already running; the caller keeps ownership
    /// of the upload file in that case.
    pub fn try_start(
        self: &Arc<Self>,
        job_id: &str,
        image_path: PathBuf,
        options: JsonValue,
        info: JsonValue,
    ) -> bool {
        let accepted = self.state_tx.send_if_modified(|state| {
            if state.status == Status::Busy {
                return false;
            }
            state.status = Status::Busy;
            state.sub_status = SubStatus::Launching;
            state.image_info = None;
            true
        });
        if !accepted {
            return false;
        }

        let preview_path = self.preview_dir.join(format!("preview_{}.png", job_id));
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_job(image_path, preview_path, options, info).await;
        });
        true
    }

    async fn run_job(
        self: Arc<Self>,
        image_path: PathBuf,
        preview_path: PathBuf,
        options: JsonValue,
        info: JsonValue,
    ) {
        let result = self
            .drive_subprocess(&image_path, &preview_path, &options, &info)
            .await;

        match result {
            Ok(()) => {
                self.swap_preview(&preview_path);
                self.state_tx.send_modify(|state| {
                    state.status = Status::Ready;
                    state.sub_status = SubStatus::None;
                });
            }
            Err(e) => {
                error!("Display job failed: {:#}", e);
                self.remove_preview_unless_current(&preview_path);
                self.state_tx.send_modify(|state| {
                    state.status = Status::Failed;
                    state.sub_status = SubStatus::None;
                });
            }
        }

        // The upload file is consumed by the job either way.
        let _ = tokio::fs::remove_file(&image_path).await;
    }

    async fn drive_subprocess(
        &self,
        image_path: &Path,
        preview_path: &Path,
        options: &JsonValue,
        info: &JsonValue,
    ) -> Result<()> {
        let (program, arguments) = self
            .command
            .split_first()
            .context("display writer command is empty")?;

        let mut child = Command::new(program)
            .args(arguments)
            .arg(image_path)
            .arg("--options")
            .arg(serde_json::to_string(options)?)
            .arg("--info")
            .arg(serde_json::to_string(info)?)
            .arg("--preview")
            .arg(preview_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn display writer \"{}\"", program))?;

        match self.read_status_lines(&mut child, preview_path, info).await {
            Ok(()) => {}
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "display writer exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }

    async fn read_status_lines(
        &self,
        child: &mut tokio::process::Child,
        preview_path: &Path,
        info: &JsonValue,
    ) -> Result<()> {
        let stdout = child
            .stdout
            .take()
            .context("display writer has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            let Some(captures) = status_line_pattern().captures(&line) else {
                debug!("display writer: {}", line);
                continue;
            };
            let sub_status = match &captures[1] {
                "LAUNCHING" => SubStatus::Launching,
                "CONVERTING" => SubStatus::Converting,
                "DISPLAYING" => SubStatus::Displaying,
                _ => unreachable!("pattern restricts the capture"),
            };

            if sub_status == SubStatus::Displaying {
                self.swap_preview(preview_path);
                self.state_tx.send_modify(|state| {
                    state.sub_status = sub_status;
                    state.image_info = Some(info.clone());
                });
            } else {
                self.state_tx
                    .send_modify(|state| state.sub_status = sub_status);
            }
        }
        Ok(())
    }

    /// Point the published preview at `new_path`, unlinking the previous
    /// preview file first. A missing or unchanged file leaves the pointer
    /// untouched.
    fn swap_preview(&self, new_path: &Path) {
        if !new_path.exists() {
            return;
        }
        let Some(new_name) = new_path.file_name().map(|n| n.to_string_lossy().to_string())
        else {
            return;
        };

        let current = self.state_tx.borrow().preview.clone();
        if current.as_deref() == Some(new_name.as_str()) {
            return;
        }
        if let Some(current) = current {
            let _ = std::fs::remove_file(self.preview_dir.join(current));
        }
        info!("Preview updated: {}", new_name);
        self.state_tx
            .send_modify(|state| state.preview = Some(new_name));
    }

    fn remove_preview_unless_current(&self, preview_path: &Path) {
        let name = preview_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        let is_current = name.is_some() && self.state_tx.borrow().preview == name;
        if !is_current {
            let _ = std::fs::remove_file(preview_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("writer.sh");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn make_engine(temp: &TempDir, script: &Path) -> Arc<DisplayEngine> {
        let (upload_dir, preview_dir) =
            super::super::upload::prepare_temp_dirs(temp.path()).unwrap();
        Arc::new(DisplayEngine::new(
            vec!["/bin/sh".to_string(), script.to_string_lossy().to_string()],
            upload_dir,
            preview_dir,
        ))
    }

    fn make_upload(engine: &DisplayEngine, name: &str) -> PathBuf {
        let path = engine.upload_dir().join(name);
        std::fs::write(&path, b"image bytes").unwrap();
        path
    }

    async fn wait_for(
        rx: &mut watch::Receiver<EngineSnapshot>,
        predicate: impl Fn(&EngineSnapshot) -> bool,
    ) -> EngineSnapshot {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                {
                    let snapshot = rx.borrow();
                    if predicate(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for engine state")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_job_walks_the_status_ladder() {
        let temp = TempDir::new().unwrap();
        // $1 image, $3 options, $5 info, $7 preview
        let script = write_script(
            temp.path(),
            "#!/bin/sh\n\
             echo 'Status: CONVERTING'\n\
             sleep 0.1\n\
             echo 'converter chatter'\n\
             cp \"$1\" \"$7\"\n\
             echo 'Status: DISPLAYING'\n\
             sleep 0.1\n\
             exit 0\n",
        );
        let engine = make_engine(&temp, &script);
        let mut rx = engine.subscribe();

        let upload = make_upload(&engine, "photo_abc.jpg");
        assert!(engine.try_start("abc", upload.clone(), json!({}), json!({"path": "photo.jpg"})));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.status, Status::Busy);
        assert_eq!(snapshot.sub_status, SubStatus::Launching);

        wait_for(&mut rx, |s| s.sub_status == SubStatus::Converting).await;
        let displaying = wait_for(&mut rx, |s| s.sub_status == SubStatus::Displaying).await;
        assert_eq!(displaying.preview.as_deref(), Some("preview_abc.png"));
        assert_eq!(displaying.image_info, Some(json!({"path": "photo.jpg"})));

        let done = wait_for(&mut rx, |s| s.status == Status::Ready).await;
        assert_eq!(done.sub_status, SubStatus::None);
        assert!(engine.preview_dir().join("preview_abc.png").exists());
        assert!(!upload.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_start_is_rejected_while_busy() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "#!/bin/sh\nsleep 2\nexit 0\n");
        let engine = make_engine(&temp, &script);
        let mut rx = engine.subscribe();

        let first = make_upload(&engine, "first.jpg");
        let second = make_upload(&engine, "second.jpg");
        assert!(engine.try_start("a", first, json!({}), json!({})));
        assert!(!engine.try_start("b", second.clone(), json!({}), json!({})));
        // The rejected upload is left alone; the caller owns it.
        assert!(second.exists());

        wait_for(&mut rx, |s| s.status == Status::Ready).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_job_cleans_up_and_recovers() {
        let temp = TempDir::new().unwrap();
        let script = write_script(
            temp.path(),
            "#!/bin/sh\n\
             cp \"$1\" \"$7\"\n\
             echo 'boom' >&2\n\
             exit 3\n",
        );
        let engine = make_engine(&temp, &script);
        let mut rx = engine.subscribe();

        let upload = make_upload(&engine, "photo_x.jpg");
        assert!(engine.try_start("x", upload.clone(), json!({}), json!({})));

        let failed = wait_for(&mut rx, |s| s.status == Status::Failed).await;
        assert_eq!(failed.sub_status, SubStatus::None);
        assert!(!upload.exists());
        assert!(!engine.preview_dir().join("preview_x.png").exists());

        // A failed engine accepts the next upload.
        let retry = make_upload(&engine, "photo_y.jpg");
        assert!(engine.try_start("y", retry, json!({}), json!({})));
        wait_for(&mut rx, |s| s.status != Status::Failed).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_at_most_one_preview_file_exists() {
        let temp = TempDir::new().unwrap();
        let script = write_script(
            temp.path(),
            "#!/bin/sh\ncp \"$1\" \"$7\"\necho 'Status: DISPLAYING'\nexit 0\n",
        );
        let engine = make_engine(&temp, &script);
        let mut rx = engine.subscribe();

        for job_id in ["one", "two"] {
            let upload = make_upload(&engine, &format!("photo_{}.jpg", job_id));
            assert!(engine.try_start(job_id, upload, json!({}), json!({})));
            wait_for(&mut rx, |s| s.status == Status::Ready).await;
            // Wait until this job's preview is published before starting the
            // next one.
            wait_for(&mut rx, |s| {
                s.preview.as_deref() == Some(&format!("preview_{}.png", job_id))
            })
            .await;
        }

        assert!(!engine.preview_dir().join("preview_one.png").exists());
        assert!(engine.preview_dir().join("preview_two.png").exists());
        let files: Vec<_> = std::fs::read_dir(engine.preview_dir())
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_error_fails_the_job() {
        let temp = TempDir::new().unwrap();
        let (upload_dir, preview_dir) =
            super::super::upload::prepare_temp_dirs(temp.path()).unwrap();
        let engine = Arc::new(DisplayEngine::new(
            vec!["/nonexistent/display-writer".to_string()],
            upload_dir,
            preview_dir,
        ));
        let mut rx = engine.subscribe();

        let upload = make_upload(&engine, "photo.jpg");
        assert!(engine.try_start("z", upload, json!({}), json!({})));
        wait_for(&mut rx, |s| s.status == Status::Failed).await;
    }

    #[test]
    fn test_client_json_shape() {
        let snapshot = EngineSnapshot {
            status: Status::Busy,
            sub_status: SubStatus::Displaying,
            preview: Some("preview_abc.png".to_string()),
            image_info: Some(json!({"collection": "Family"})),
        };
        let payload = snapshot.to_client_json();
        assert_eq!(payload["status"], "BUSY");
        assert_eq!(payload["subStatus"], "DISPLAYING");
        assert_eq!(payload["preview"], "/preview/preview_abc.png");
        assert_eq!(payload["imageInfo"]["collection"], "Family");

        let initial = EngineSnapshot::initial().to_client_json();
        assert_eq!(initial["status"], "READY");
        assert!(initial.get("preview").is_none());
    }
}
