use super::dispatch;
use super::job::RefreshJob;
use crate::collections::{CollectionManager, PhotoInfo};
use crate::photo_store::{PhotoStore, SelectedPhoto};
use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fires more than this late are treated as misfires: overlapping missed
/// instants collapse into the next scheduled one.
const MISFIRE_GRACE: chrono::Duration = chrono::Duration::seconds(60);

/// Upper bound on scheduler sleeps so new commands and clock drift are
/// observed regularly.
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no enabled schedule for the given identifier")]
    NotFound,

    #[error("the refresh scheduler is not running")]
    SchedulerStopped,
}

enum RefreshCommand {
    UpsertJob(Box<RefreshJob>),
    RemoveJob(String),
    ManualRefresh {
        identifier: String,
        delay: Duration,
        response: oneshot::Sender<Result<(), RefreshError>>,
    },
}

/// Cloneable handle used by HTTP handlers to talk to the scheduler loop.
#[derive(Clone)]
pub struct RefreshHandle {
    command_tx: mpsc::Sender<RefreshCommand>,
}

impl RefreshHandle {
    /// Register or replace a job. Disabled jobs are dropped from the
    /// schedule.
    pub async fn upsert_job(&self, job: RefreshJob) {
        let _ = self
            .command_tx
            .send(RefreshCommand::UpsertJob(Box::new(job)))
            .await;
    }

    pub async fn remove_job(&self, identifier: &str) {
        let _ = self
            .command_tx
            .send(RefreshCommand::RemoveJob(identifier.to_string()))
            .await;
    }

    /// Schedule (or reschedule) a one-shot fire at `now + delay`.
    pub async fn manual_refresh(
        &self,
        identifier: &str,
        delay: Duration,
    ) -> Result<(), RefreshError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(RefreshCommand::ManualRefresh {
                identifier: identifier.to_string(),
                delay,
                response: response_tx,
            })
            .await
            .map_err(|_| RefreshError::SchedulerStopped)?;
        response_rx
            .await
            .map_err(|_| RefreshError::SchedulerStopped)?
    }
}

struct JobEntry {
    job: Arc<RefreshJob>,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

/// One background loop schedules every enabled refresh job. Each fire picks
/// a photo and posts it to the job's display agent; the next fire is then
/// re-armed from the cron iterator so manual refreshes can rewrite the next
/// run without racing a recurring trigger.
pub struct RefreshScheduler {
    store: Arc<PhotoStore>,
    collections: Arc<CollectionManager>,
    post_commands: Arc<BTreeMap<String, Vec<String>>>,
    http: reqwest::Client,
    entries: HashMap<String, JobEntry>,
    command_rx: mpsc::Receiver<RefreshCommand>,
    shutdown_token: CancellationToken,
}

pub fn create_refresh_scheduler(
    store: Arc<PhotoStore>,
    collections: Arc<CollectionManager>,
    post_commands: Arc<BTreeMap<String, Vec<String>>>,
    shutdown_token: CancellationToken,
) -> (RefreshScheduler, RefreshHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let scheduler = RefreshScheduler {
        store,
        collections,
        post_commands,
        http: reqwest::Client::new(),
        entries: HashMap::new(),
        command_rx,
        shutdown_token,
    };
    (scheduler, RefreshHandle { command_tx })
}

impl RefreshScheduler {
    /// Load enabled jobs from the store and run the scheduling loop until
    /// shutdown.
    pub async fn run(&mut self) {
        if let Err(e) = self.load_jobs() {
            error!("Failed to load refresh jobs: {:#}", e);
        }
        info!("Scheduled all refreshes ({} jobs)", self.entries.len());

        loop {
            let sleep_duration = self.time_until_next();
            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Refresh scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Refresh scheduler stopped");
    }

    fn load_jobs(&mut self) -> anyhow::Result<()> {
        for record in self.store.list_refresh_jobs()? {
            let identifier = record.identifier.clone();
            match RefreshJob::from_record(record) {
                Ok(job) if job.enabled => {
                    info!("Starting \"{}\"", identifier);
                    self.insert_entry(job);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Invalid refresh job \"{}\" in the photo DB: {}", identifier, e);
                }
            }
        }
        Ok(())
    }

    fn insert_entry(&mut self, job: RefreshJob) {
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!("Invalid schedule for \"{}\": {}", job.identifier, e);
                return;
            }
        };
        let next_run = schedule.next_after(Utc::now());
        if let Some(next_run) = next_run {
            debug!("Next refresh of \"{}\": {}", job.identifier, next_run.to_rfc3339());
        }
        self.entries.insert(
            job.identifier.clone(),
            JobEntry {
                job: Arc::new(job),
                schedule,
                next_run,
            },
        );
    }

    async fn handle_command(&mut self, command: RefreshCommand) {
        match command {
            RefreshCommand::UpsertJob(job) => {
                self.entries.remove(&job.identifier);
                if job.enabled {
                    self.insert_entry(*job);
                }
            }
            RefreshCommand::RemoveJob(identifier) => {
                self.entries.remove(&identifier);
            }
            RefreshCommand::ManualRefresh {
                identifier,
                delay,
                response,
            } => {
                let result = match self.entries.get_mut(&identifier) {
                    Some(entry) => {
                        let at = Utc::now()
                            + chrono::Duration::from_std(delay).unwrap_or_default();
                        entry.next_run = Some(at);
                        debug!("Next refresh of \"{}\": {}", identifier, at.to_rfc3339());
                        Ok(())
                    }
                    None => Err(RefreshError::NotFound),
                };
                let _ = response.send(result);
            }
        }
    }

    fn time_until_next(&self) -> Duration {
        let now = Utc::now();
        let mut min_duration = CHECK_INTERVAL;
        for entry in self.entries.values() {
            if let Some(next_run) = entry.next_run {
                if next_run <= now {
                    return Duration::from_secs(0);
                }
                let duration = (next_run - now).to_std().unwrap_or(Duration::from_secs(1));
                if duration < min_duration {
                    min_duration = duration;
                }
            }
        }
        min_duration
    }

    async fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let mut due: Vec<(String, Arc<RefreshJob>, DateTime<Utc>)> = Vec::new();
        for (identifier, entry) in &self.entries {
            if let Some(next_run) = entry.next_run {
                if next_run <= now {
                    due.push((identifier.clone(), Arc::clone(&entry.job), next_run));
                }
            }
        }

        for (identifier, job, next_run) in due {
            if now - next_run > MISFIRE_GRACE {
                warn!(
                    "Skipping misfired refresh of \"{}\" scheduled for {}",
                    identifier,
                    next_run.to_rfc3339()
                );
            } else {
                self.fire(&job).await;
            }

            if let Some(entry) = self.entries.get_mut(&identifier) {
                entry.next_run = entry.schedule.next_after(Utc::now());
                if let Some(next_run) = entry.next_run {
                    debug!("Next refresh of \"{}\": {}", identifier, next_run.to_rfc3339());
                }
            }
        }
    }

    async fn fire(&self, job: &Arc<RefreshJob>) {
        info!("Running refresh job \"{}\"", job.identifier);

        let store = Arc::clone(&self.store);
        let collections = Arc::clone(&self.collections);
        let job_for_select = Arc::clone(job);
        // Selection and photo resolution are blocking work (SQLite, possibly
        // a cloud download).
        let selection = tokio::task::spawn_blocking(move || {
            select_photo(&store, &collections, &job_for_select)
        })
        .await;

        let (selected, photo_info) = match selection {
            Ok(Ok(Some(pair))) => pair,
            Ok(Ok(None)) => {
                info!("No image available for refresh");
                return;
            }
            Ok(Err(e)) => {
                error!("Failed to select a photo for \"{}\": {:#}", job.identifier, e);
                return;
            }
            Err(e) => {
                error!("Photo selection panicked for \"{}\": {}", job.identifier, e);
                return;
            }
        };

        info!("Posting: \"{}\" to {}", photo_info.url, job.hostname);
        if let Err(e) = dispatch::post_photo(
            &self.http,
            job,
            &photo_info,
            selected.capture_date.as_deref(),
            &self.post_commands,
        )
        .await
        {
            error!("Failed to post an image to the display agent: {:#}", e);
        }
    }
}

fn select_photo(
    store: &PhotoStore,
    collections: &CollectionManager,
    job: &RefreshJob,
) -> anyhow::Result<Option<(SelectedPhoto, PhotoInfo)>> {
    let filter_sql = job.filter.to_sql();
    let (order_sql, extra_filter_sql) = job.order.to_sql();
    let Some(selected) =
        store.select_next_photo(&filter_sql, order_sql, extra_filter_sql, Utc::now())?
    else {
        return Ok(None);
    };

    let Some(photo_info) = collections.photo_info(selected.collection_id, selected.photo_id)?
    else {
        warn!(
            "Selected photo {} has no resolvable source",
            selected.photo_id
        );
        return Ok(None);
    };
    debug!(
        "Selected photo \"{}\" from \"{}\"",
        photo_info.url, photo_info.collection_name
    );
    Ok(Some((selected, photo_info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo_store::RefreshJobRecord;
    use serde_json::json;
    use tempfile::TempDir;

    async fn make_scheduler(
        db_dir: &TempDir,
    ) -> (Arc<PhotoStore>, Arc<CollectionManager>, RefreshHandle, CancellationToken) {
        let store = Arc::new(PhotoStore::new(db_dir.path().join("photo.db")).unwrap());
        let collections = Arc::new(CollectionManager::new(Arc::clone(&store)));
        let shutdown = CancellationToken::new();
        let (mut scheduler, handle) = create_refresh_scheduler(
            Arc::clone(&store),
            Arc::clone(&collections),
            Arc::new(BTreeMap::new()),
            shutdown.clone(),
        );
        tokio::spawn(async move { scheduler.run().await });
        (store, collections, handle, shutdown)
    }

    fn make_job(identifier: &str, hostname: &str, enabled: bool) -> RefreshJob {
        RefreshJob::from_record(RefreshJobRecord {
            id: None,
            identifier: identifier.to_string(),
            display_name: identifier.to_string(),
            hostname: hostname.to_string(),
            schedule: String::new(),
            enabled,
            filter: "true".to_string(),
            order: "SHUFFLE".to_string(),
            affiche_options: json!({}),
            post_command_id: String::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_manual_refresh_of_unknown_job_is_not_found() {
        let db_dir = TempDir::new().unwrap();
        let (_store, _collections, handle, shutdown) = make_scheduler(&db_dir).await;

        let result = handle.manual_refresh("missing", Duration::from_secs(0)).await;
        assert_eq!(result, Err(RefreshError::NotFound));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disabled_job_is_not_scheduled() {
        let db_dir = TempDir::new().unwrap();
        let (_store, _collections, handle, shutdown) = make_scheduler(&db_dir).await;

        handle.upsert_job(make_job("off", "localhost:1", false)).await;
        let result = handle.manual_refresh("off", Duration::from_secs(0)).await;
        assert_eq!(result, Err(RefreshError::NotFound));

        // Removing an upserted enabled job drops it from the schedule.
        handle.upsert_job(make_job("on", "localhost:1", true)).await;
        handle
            .manual_refresh("on", Duration::from_secs(3600))
            .await
            .unwrap();
        handle.remove_job("on").await;
        let result = handle.manual_refresh("on", Duration::from_secs(0)).await;
        assert_eq!(result, Err(RefreshError::NotFound));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_manual_refresh_posts_url_form_to_local_agent() {
        use axum::extract::State;
        use axum::routing::post;

        let db_dir = TempDir::new().unwrap();
        let (store, collections, handle, shutdown) = make_scheduler(&db_dir).await;

        // One filesystem photo to select.
        let photos_dir = TempDir::new().unwrap();
        image::DynamicImage::new_rgb8(10, 10)
            .save(photos_dir.path().join("a.png"))
            .unwrap();
        let record = collections
            .add(crate::photo_store::CollectionRecord {
                id: None,
                identifier: "local".to_string(),
                display_name: "Local".to_string(),
                schedule: String::new(),
                enabled: true,
                class_name: "FileSystemCollection".to_string(),
                settings: json!({"root_path": photos_dir.path().to_string_lossy()}),
            })
            .unwrap();
        let mut scan_conn = crate::photo_store::open_connection(store.db_path()).unwrap();
        crate::collections::StrategyKind::FileSystem
            .update(&mut scan_conn, &record, &|| false)
            .unwrap();

        // A fake agent that records the posted form body.
        let (body_tx, mut body_rx) = mpsc::channel::<String>(1);
        let app = axum::Router::new()
            .route(
                "/",
                post(|State(tx): State<mpsc::Sender<String>>, body: String| async move {
                    let _ = tx.send(body).await;
                    "ok"
                }),
            )
            .with_state(body_tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        handle
            .upsert_job(make_job("hall", &format!("localhost:{}", port), true))
            .await;
        handle
            .manual_refresh("hall", Duration::from_secs(0))
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(10), body_rx.recv())
            .await
            .expect("agent was not called")
            .unwrap();
        // Local agent + file URL means the URL itself is posted.
        assert!(body.contains("url=file%3A%2F%2F"));
        assert!(body.contains("a.png"));
        assert!(body.contains("info="));
        shutdown.cancel();
    }
}
